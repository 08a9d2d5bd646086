//! Scheduler output parsing.
//!
//! One pure-function module per batch scheduler, dispatched through
//! [`SchedulerKind`]. The inputs are operator-facing free text captured from
//! submit and status commands; nothing in here is allowed to panic or error
//! out of the polling loop. A job the parser cannot locate is reported as
//! absent (`None` / untouched map entry) and an unrecognized state column
//! degrades to [`JobState::Unknown`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::process::JobStatus;

pub mod condor;
pub mod fork;
pub mod lsf;
pub mod pbs;
pub mod uge;

/// Supported batch scheduler families.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Direct fork/exec on the target host, no scheduler.
    Fork,
    /// PBS/Torque (`qsub`/`qstat`).
    Pbs,
    /// IBM LSF (`bsub`/`bjobs`).
    Lsf,
    /// Univa/Sun Grid Engine (`qsub`/`qstat`).
    Uge,
    /// HTCondor (`condor_submit`/`condor_q`).
    Condor,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Fork => "fork",
            SchedulerKind::Pbs => "pbs",
            SchedulerKind::Lsf => "lsf",
            SchedulerKind::Uge => "uge",
            SchedulerKind::Condor => "condor",
        }
    }

    /// Extract the scheduler-assigned job id from submit-command output.
    ///
    /// Fork submissions have no scheduler id, so one is synthesized.
    pub fn parse_submission_id(&self, raw: &str) -> Option<String> {
        match self {
            SchedulerKind::Fork => Some(fork::synthesize_job_id()),
            SchedulerKind::Pbs => pbs::parse_submission_id(raw),
            SchedulerKind::Lsf => lsf::parse_submission_id(raw),
            SchedulerKind::Uge => uge::parse_submission_id(raw),
            SchedulerKind::Condor => condor::parse_submission_id(raw),
        }
    }

    /// Whether submit-command output indicates the scheduler rejected the
    /// job. Keyword-based and deliberately conservative; never errors.
    pub fn submission_failed(&self, raw: &str) -> bool {
        match self {
            SchedulerKind::Fork => false,
            SchedulerKind::Pbs => pbs::submission_failed(raw),
            SchedulerKind::Lsf => lsf::submission_failed(raw),
            SchedulerKind::Uge => uge::submission_failed(raw),
            SchedulerKind::Condor => condor::submission_failed(raw),
        }
    }

    /// Locate one job in status-command output. `None` means the job is not
    /// visible in this listing, which callers treat as "not found yet".
    pub fn parse_job_status(&self, job_id: &str, raw: &str) -> Option<JobStatus> {
        match self {
            SchedulerKind::Fork => fork::parse_job_status(job_id, raw),
            SchedulerKind::Pbs => pbs::parse_job_status(job_id, raw),
            SchedulerKind::Lsf => lsf::parse_job_status(job_id, raw),
            SchedulerKind::Uge => uge::parse_job_status(job_id, raw),
            SchedulerKind::Condor => condor::parse_job_status(job_id, raw),
        }
    }

    /// Bulk variant for polling many jobs with one status call. Entries
    /// whose job cannot be located in `raw` are left unchanged; the caller
    /// decides whether that means completed-and-purged or still queued.
    ///
    /// Map keys are [`status_key`] pairs for schedulers that need the job
    /// name for row matching (PBS, UGE) and bare job ids elsewhere.
    pub fn parse_job_statuses(
        &self,
        username: &str,
        statuses: &mut HashMap<String, JobStatus>,
        raw: &str,
    ) {
        match self {
            SchedulerKind::Fork => {}
            SchedulerKind::Pbs => pbs::parse_job_statuses(username, statuses, raw),
            SchedulerKind::Lsf => lsf::parse_job_statuses(username, statuses, raw),
            SchedulerKind::Uge => uge::parse_job_statuses(username, statuses, raw),
            SchedulerKind::Condor => condor::parse_job_statuses(username, statuses, raw),
        }
    }

    /// Recover a job id by submission-time job name, for schedulers whose
    /// submit output is not trustworthy. Applies the scheduler's display
    /// truncation rule to the lookup key before searching.
    pub fn parse_job_id_by_name(&self, job_name: &str, raw: &str) -> Option<String> {
        match self {
            SchedulerKind::Fork => None,
            SchedulerKind::Pbs => pbs::parse_job_id_by_name(job_name, raw),
            SchedulerKind::Lsf => lsf::parse_job_id_by_name(job_name, raw),
            SchedulerKind::Uge => uge::parse_job_id_by_name(job_name, raw),
            SchedulerKind::Condor => condor::parse_job_id_by_name(job_name, raw),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bulk-polling map key for schedulers that match rows by job name.
pub fn status_key(job_id: &str, job_name: &str) -> String {
    format!("{job_id},{job_name}")
}

/// Split a bulk-polling key into `(job_id, job_name)`.
pub(crate) fn split_status_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(',') {
        Some((job_id, job_name)) => (job_id, Some(job_name)),
        None => (key, None),
    }
}

/// Whitespace column split. Fixed-width scheduler tables pad with runs of
/// spaces, so empty tokens are discarded.
pub(crate) fn columns(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Truncate a lookup key to a scheduler's display width.
pub(crate) fn truncate(name: &str, width: usize) -> &str {
    if name.len() > width { &name[..width] } else { name }
}
