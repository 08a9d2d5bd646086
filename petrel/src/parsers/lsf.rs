//! IBM LSF output parsing (`bsub`, `bjobs`).

use std::collections::HashMap;

use crate::parsers::columns;
use crate::process::{JobState, JobStatus};

/// State column index in `bjobs` rows:
/// `JOBID | USER | STAT | QUEUE | FROM_HOST | EXEC_HOST | JOB_NAME | SUBMIT_TIME`.
const STATE_COLUMN: usize = 2;

/// `bjobs` displays names longer than this as `*` plus the trailing chars.
const NAME_WIDTH: usize = 10;

/// `bsub` prints `Job <2636607> is submitted to queue <long>.`.
pub fn parse_submission_id(raw: &str) -> Option<String> {
    let start = raw.find('<')? + 1;
    let end = raw[start..].find('>')? + start;
    let id = &raw[start..end];
    if id.is_empty() { None } else { Some(id.to_string()) }
}

pub fn submission_failed(raw: &str) -> bool {
    raw.to_lowercase().contains("failed")
}

fn word_to_state(word: &str) -> JobState {
    match word {
        "PEND" => JobState::Queued,
        "RUN" => JobState::Active,
        "PSUSP" | "USUSP" | "SSUSP" => JobState::Suspended,
        "DONE" => JobState::Complete,
        "EXIT" => JobState::Failed,
        _ => JobState::Unknown,
    }
}

fn row_state(row: &[&str]) -> JobState {
    row.get(STATE_COLUMN)
        .map(|word| word_to_state(word))
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
    for line in raw.lines() {
        let row = columns(line);
        let Some(row_id) = row.first() else { continue };
        let (key, state) = match statuses.get_key_value(*row_id) {
            Some((key, _)) => (key.clone(), row_state(&row)),
            None => continue,
        };
        statuses.insert(key, JobStatus::new(row_id.to_string(), state));
    }
}

/// Find a job id by name. Long names are displayed truncated with a leading
/// `*` and the trailing nine characters, so the lookup key is rewritten the
/// same way before searching.
pub fn parse_job_id_by_name(job_name: &str, raw: &str) -> Option<String> {
    let needle = if job_name.len() > NAME_WIDTH {
        format!("*{}", &job_name[job_name.len() - (NAME_WIDTH - 1)..])
    } else {
        job_name.to_string()
    };
    for line in raw.lines() {
        let row = columns(line);
        if row.iter().any(|column| **column == needle) {
            return row.first().map(|id| (*id).to_string());
        }
    }
    None
}
