//! Fork "scheduler": direct execution on the target host.
//!
//! There is no batch system to assign ids or report queues, so the id is
//! synthesized at submission time and status is derived from the exit code
//! the launch wrapper prints.

use rand::Rng;
use rand::distr::Alphanumeric;

use crate::process::{JobState, JobStatus};

const JOB_ID_PREFIX: &str = "JOB_ID_";
const JOB_ID_SUFFIX_LEN: usize = 6;

/// Synthesize an id for a fork submission.
pub fn synthesize_job_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{JOB_ID_PREFIX}{suffix}")
}

/// Interpret the launch wrapper's exit-code text. Non-numeric output means
/// the process is not observable yet.
pub fn parse_job_status(job_id: &str, raw: &str) -> Option<JobStatus> {
    let code: i64 = raw.trim().parse().ok()?;
    let state = if code == 0 {
        JobState::Complete
    } else {
        JobState::Failed
    };
    Some(JobStatus::new(job_id, state))
}
