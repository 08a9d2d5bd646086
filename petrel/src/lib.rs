//! Petrel - process-launch orchestration for science-gateway middleware.
//!
//! Petrel drives scientific computations ("processes") through a multi-stage
//! lifecycle on remote HPC and cloud resources: environment setup, input
//! staging, job submission, status polling, output staging and completion.
//! It guarantees that a process is submitted **at most once** despite
//! at-least-once message delivery, server restarts and operator-initiated
//! cancellation.
//!
//! # Core Concepts
//!
//! - **Launch handling**: [`ProcessLaunchHandler`] consumes launch events
//!   from the inbound bus, suppresses duplicates through the coordination
//!   namespace, arms a cancellation watch and dispatches work to a bounded
//!   worker pool.
//!
//! - **Coordination**: the [`CoordinationStore`] trait is a watchable
//!   hierarchical namespace recording live instances, process ownership,
//!   delivery tags and per-process cancel flags.
//!
//! - **Pipeline**: [`TaskPipeline`] runs the ordered, independently
//!   retryable stages of a launch, checking the cooperative [`CancelFlag`]
//!   at every stage boundary.
//!
//! - **Remote execution**: the [`RemoteExecution`] trait turns directory,
//!   copy and exec operations into a raw remote-shell protocol; the
//!   `ssh`-feature session implements it over libssh2, with the copy-receiver
//!   byte protocol in [`adaptor::scp`].
//!
//! - **Parsers**: [`SchedulerKind`] dispatches submit/status text of five
//!   batch schedulers (fork, PBS, LSF, UGE, HTCondor) into canonical
//!   [`JobStatus`] values.
//!
//! # Feature Flags
//!
//! - `ssh` - libssh2-backed remote session
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use petrel::*;
//! use std::sync::Arc;
//!
//! let coordination = Arc::new(InMemoryCoordinationStore::new());
//! let handler = Arc::new(ProcessLaunchHandler::new(
//!     InstanceConfig::default(),
//!     coordination,
//!     registry,
//!     publisher,
//!     executor,
//!     Arc::new(WorkerPool::new(8)),
//!     acks,
//! ));
//! handler.start().await?;
//! ```

/// Remote-execution adaptor: session management and the copy byte protocol.
pub mod adaptor;

/// Configuration structures for instance identity, worker pool and polling.
pub mod config;

/// Coordination-service layer: the watchable hierarchical namespace used
/// for instance liveness, process ownership and cancellation flags.
pub mod coordination;

/// Outbound status events and the publisher seam.
pub mod events;

/// The process-launch message handler and its consumer loop.
pub mod handler;

/// Inbound message framing and the acknowledgement seam.
pub mod messaging;

/// Prometheus metrics (behind the `metrics` feature).
pub mod metrics;

/// Scheduler output parser family.
pub mod parsers;

/// Task pipeline stages and the executor seam.
pub mod pipeline;

/// Process and job lifecycle data model.
pub mod process;

/// Interface boundary to the persistent registry collaborator.
pub mod registry;

/// Worker pool and shutdown signalling.
pub mod runtime;

/// Tracing span helpers and metric recording.
pub mod telemetry;

pub use adaptor::{AdaptorError, AuthMethod, CommandOutput, RemoteExecution, SessionKey, SshConfig};
pub use config::{InstanceConfig, OrchestratorConfig, PollingConfig, WorkerPoolConfig};
pub use coordination::{CancelWatch, CoordinationStore, InMemoryCoordinationStore};
pub use events::{InProcStatusBus, JobStatusEvent, ProcessStatusEvent, StatusPublisher};
pub use handler::{ProcessLaunchHandler, spawn_consumer};
pub use messaging::{
    AckChannel, DeliveryEnvelope, InProcLaunchBus, LaunchMessage, ProcessTerminateEvent,
};
pub use parsers::SchedulerKind;
pub use pipeline::{
    CancelFlag, DataStagingItem, PipelineOutcome, PlanSource, ProcessExecutor, ProcessPlan,
    StageFailure, StageKind, StageOutcome, TaskPipeline,
};
pub use process::{
    ExperimentId, GatewayId, JobState, JobStatus, ProcessId, ProcessLaunchEvent, ProcessState,
    ProcessStatus, TokenId,
};
pub use registry::{ErrorReport, Registry};
pub use runtime::{ShutdownToken, WorkerPool};
