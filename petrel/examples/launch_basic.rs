//! Basic launch orchestration with in-memory seams.
//!
//! Demonstrates the full message path (launch bus, handler, coordination
//! store, worker pool, task pipeline) against petrel-testkit's mock remote
//! endpoints, including a redelivery that gets absorbed by the dedup check.

use std::sync::Arc;
use std::time::Duration;

use petrel::{
    InMemoryCoordinationStore, InProcLaunchBus, InProcStatusBus, InstanceConfig, LaunchMessage,
    PollingConfig, ProcessLaunchHandler, ProcessState, ShutdownToken, TaskPipeline, WorkerPool,
    spawn_consumer,
};
use petrel_testkit::{InMemoryRegistry, MockRemote, StaticPlanSource, test_launch_event, test_plan};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "petrel=info".into()),
        )
        .init();

    println!("=== Petrel Launch Example ===\n");

    // Remote endpoints: a PBS compute resource and a storage resource.
    let compute = Arc::new(MockRemote::new());
    let storage = Arc::new(MockRemote::new());
    compute.respond_stdout("qsub", "2080802.gordon-fe2.local\n");
    compute.respond_stdout(
        "qstat",
        "2080802.gordon-fe2   tester   normal   A3124026   12002  1     8   1gb    00:30 R 00:05\n",
    );
    compute.respond_stdout(
        "qstat",
        "2080802.gordon-fe2   tester   normal   A3124026   12002  1     8   1gb    00:30 C 00:22\n",
    );

    let plan = test_plan("proc-demo");
    storage.put_file(plan.inputs[0].storage_path.clone(), b"input data".to_vec());
    compute.put_file(
        plan.outputs[0].compute_path.clone(),
        b"simulation results".to_vec(),
    );

    let coordination = Arc::new(InMemoryCoordinationStore::new());
    let registry = Arc::new(InMemoryRegistry::new());
    let status_bus = Arc::new(InProcStatusBus::new(256));
    let launch_bus = Arc::new(InProcLaunchBus::new(64));

    let pipeline = Arc::new(TaskPipeline::new(
        Arc::clone(&compute) as _,
        Arc::clone(&storage) as _,
        Arc::clone(&registry) as _,
        Arc::clone(&status_bus) as _,
        Arc::new(StaticPlanSource(plan)),
        PollingConfig {
            interval_secs: 1,
            timeout_secs: 60,
        },
    ));

    let handler = Arc::new(ProcessLaunchHandler::new(
        InstanceConfig::default(),
        Arc::clone(&coordination) as _,
        Arc::clone(&registry) as _,
        Arc::clone(&status_bus) as _,
        pipeline,
        Arc::new(WorkerPool::new(4)),
        Arc::clone(&launch_bus) as _,
    ));
    handler.start().await?;

    let shutdown = ShutdownToken::new();
    let receiver = launch_bus.take_receiver().expect("consumer slot");
    let consumer = spawn_consumer(Arc::clone(&handler), receiver, shutdown.clone());

    let mut process_events = status_bus.subscribe_process_events();
    let mut job_events = status_bus.subscribe_job_events();

    println!("1. Sending launch event...");
    let event = test_launch_event("proc-demo");
    launch_bus
        .send(LaunchMessage::Launch(event.clone()))
        .await?;

    // A broker-style redelivery while the pipeline is running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("2. Redelivering the same launch (should be absorbed)...");
    launch_bus
        .send_redelivery(LaunchMessage::Launch(event))
        .await?;

    println!("3. Status transitions:");
    loop {
        tokio::select! {
            Ok(event) = process_events.recv() => {
                println!("   [process] {} -> {}", event.routing_key(), event.state);
                if event.state == ProcessState::Completed {
                    break;
                }
            }
            Ok(event) = job_events.recv() => {
                println!("   [job]     {} -> {}", event.routing_key(), event.state);
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("\n4. Results:");
    println!("   submit commands run: {}", compute.call_count("qsub"));
    println!("   acknowledged tags:   {:?}", launch_bus.acked_tags());
    println!(
        "   staged output:       {:?}",
        storage
            .file("/archive/proc-demo/output.dat")
            .map(String::from_utf8)
    );

    shutdown.cancel();
    let _ = consumer.await;

    println!("\n=== Example Complete ===");
    println!("\nKey takeaways:");
    println!("- The handler acknowledges every delivery, including redeliveries");
    println!("- The dedup check keeps one pipeline run per process");
    println!("- Status transitions are persisted first, then published");
    Ok(())
}
