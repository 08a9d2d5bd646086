//! Univa/Sun Grid Engine output parsing (`qsub`, `qstat`).

use std::collections::HashMap;

use crate::parsers::{columns, split_status_key, truncate};
use crate::process::{JobState, JobStatus};

/// State column index in `qstat` rows:
/// `job-ID | prior | name | user | state | submit/start at | queue | slots`.
const STATE_COLUMN: usize = 4;

/// `qstat` truncates the name column to ten characters.
const NAME_WIDTH: usize = 10;

/// `qsub` prints `Your job 3477378 ("A312402627") has been submitted`; the
/// id is the first numeric token.
pub fn parse_submission_id(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .find(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
        .map(|token| token.to_string())
}

pub fn submission_failed(raw: &str) -> bool {
    raw.contains("Rejecting") || raw.to_lowercase().contains("failed")
}

fn code_to_state(code: &str) -> JobState {
    match code {
        "qw" | "hqw" | "hRwq" => JobState::Queued,
        "r" | "t" | "Rr" | "Rt" => JobState::Active,
        "s" | "ts" | "S" | "tS" => JobState::Suspended,
        "Eqw" | "Ehqw" | "Er" => JobState::Failed,
        "d" | "dr" | "dt" => JobState::Canceled,
        _ => JobState::Unknown,
    }
}

fn row_state(row: &[&str]) -> JobState {
    row.get(STATE_COLUMN)
        .map(|code| code_to_state(code))
        .unwrap_or(JobState::Unknown)
}

pub fn parse_job_status(job_id: &str, raw: &str) -> Option<JobStatus> {
    for line in raw.lines() {
        let row = columns(line);
        if row.first() == Some(&job_id) {
            return Some(JobStatus::new(job_id, row_state(&row)));
        }
    }
    None
}

pub fn parse_job_statuses(
    _username: &str,
    statuses: &mut HashMap<String, JobStatus>,
    raw: &str,
) {
    let keys: Vec<String> = statuses.keys().cloned().collect();
    for key in keys {
        let (job_id, job_name) = split_status_key(&key);
        let found = raw.lines().find_map(|line| {
            let row = columns(line);
            let hit = match job_name {
                Some(name) => row.get(2) == Some(&truncate(name, NAME_WIDTH)),
                None => row.first() == Some(&job_id),
            };
            if hit { Some(row_state(&row)) } else { None }
        });
        if let Some(state) = found {
            let status = JobStatus::new(job_id, state);
            statuses.insert(key, status);
        }
    }
}

pub fn parse_job_id_by_name(job_name: &str, raw: &str) -> Option<String> {
    let needle = truncate(job_name, NAME_WIDTH);
    for line in raw.lines() {
        let row = columns(line);
        if row.get(2) == Some(&needle) {
            return row.first().map(|id| (*id).to_string());
        }
    }
    None
}
