//! HTCondor output parsing (`condor_submit`, `condor_q`).
//!
//! Row lookup is owner-based: every data row carries the owning user in its
//! second column, and statuses are produced for rows whose id is being
//! polled regardless of which owner the poll was issued for (pool-wide
//! listings routinely interleave users).

use std::collections::HashMap;

use crate::parsers::columns;
use crate::process::{JobState, JobStatus};

/// State column index in pool-wide `condor_q` rows:
/// `ID | OWNER | STATE | QUEUE/PRI | SUBMIT_HOST | EXEC_HOST | CMD | SUBMITTED`.
const STATE_COLUMN: usize = 2;

/// The command column truncates to ten characters.
const NAME_WIDTH: usize = 10;

/// `condor_submit` prints `N job(s) submitted to cluster 6.`.
pub fn parse_submission_id(raw: &str) -> Option<String> {
    let rest = &raw[raw.find("submitted to cluster")? + "submitted to cluster".len()..];
    let id: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let id = id.trim_end_matches('.').to_string();
    if id.is_empty() { None } else { Some(id) }
}

pub fn submission_failed(raw: &str) -> bool {
    raw.contains("ERROR") || raw.to_lowercase().contains("failed")
}

fn token_to_state(token: &str) -> JobState {
    match token {
        "I" | "IDLE" | "PEND" => JobState::Queued,
        "R" | "RUN" => JobState::Active,
        "H" | "HELD" => JobState::Suspended,
        "X" | "REMOVED" => JobState::Canceled,
        "C" | "DONE" | "COMPLETED" => JobState::Complete,
        _ => JobState::Unknown,
    }
}

fn row_state(row: &[&str]) -> JobState {
    row.get(STATE_COLUMN)
        .map(|token| token_to_state(token))
        .unwrap_or(JobState::Unknown)
}

/// Owner column of a data row, if the line has one.
pub fn row_owner(line: &str) -> Option<&str> {
    let row = columns(line);
    if row.len() < 3 {
        return None;
    }
    row.get(1).copied()
}

pub fn parse_job_status(job_id: &str, raw: &str) -> Option<JobStatus> {
    for line in raw.lines() {
        let row = columns(line);
        if row.len() >= 3 && row.first() == Some(&job_id) {
            return Some(JobStatus::new(job_id, row_state(&row)));
        }
    }
    None
}

pub fn parse_job_statuses(
    username: &str,
    statuses: &mut HashMap<String, JobStatus>,
    raw: &str,
) {
    for line in raw.lines() {
        let row = columns(line);
        if row.len() < 3 {
            continue;
        }
        let Some(row_id) = row.first() else { continue };
        let (key, state) = match statuses.get_key_value(*row_id) {
            Some((key, _)) => (key.clone(), row_state(&row)),
            None => continue,
        };
        if let Some(owner) = row.get(1) {
            if *owner != username {
                tracing::debug!(
                    owner = *owner,
                    username,
                    job_id = *row_id,
                    "row owned by another user"
                );
            }
        }
        statuses.insert(key, JobStatus::new(row_id.to_string(), state));
    }
}

pub fn parse_job_id_by_name(job_name: &str, raw: &str) -> Option<String> {
    let needle = crate::parsers::truncate(job_name, NAME_WIDTH);
    for line in raw.lines() {
        let row = columns(line);
        if row.len() < 3 {
            continue;
        }
        if row
            .iter()
            .skip(2)
            .any(|column| *column == needle || column.starts_with(needle))
        {
            return row.first().map(|id| (*id).to_string());
        }
    }
    None
}
