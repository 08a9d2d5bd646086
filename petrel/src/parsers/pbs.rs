//! PBS/Torque output parsing (`qsub`, `qstat -u`).

use std::collections::HashMap;

use crate::parsers::{columns, split_status_key, truncate};
use crate::process::{JobState, JobStatus};

/// State column index in `qstat -u` rows:
/// `Job ID | Username | Queue | Jobname | SessID | NDS | TSK | Memory | Time | S | Elap`.
const STATE_COLUMN: usize = 9;

/// `qstat -u` truncates the Jobname column; rows are matched on this prefix.
const NAME_WIDTH: usize = 8;

/// Sentinel state letter for rows hit by the `E`-state padding bug (below).
pub const ER_SENTINEL: &str = "Er";

/// `qsub` prints the bare job id (`2080802.gordon-fe2.local`).
pub fn parse_submission_id(raw: &str) -> Option<String> {
    let id = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    Some(id.to_string())
}

pub fn submission_failed(raw: &str) -> bool {
    raw.contains("qsub: submit error") || raw.to_lowercase().contains("failed")
}

fn letter_to_state(letter: &str) -> Option<JobState> {
    match letter {
        "Q" | "H" | "W" => Some(JobState::Queued),
        "R" | "E" | "T" => Some(JobState::Active),
        "S" => Some(JobState::Suspended),
        "C" => Some(JobState::Complete),
        "U" => Some(JobState::Unknown),
        ER_SENTINEL => Some(JobState::Failed),
        _ => None,
    }
}

/// Extract the state letter from a split row.
///
/// Jobs in `E` (exiting) state lose their SessID column in some qstat
/// builds, shifting the row left by one; such rows report the `Er` sentinel
/// rather than degrading to unknown.
pub fn row_state_letter(row: &[&str]) -> Option<String> {
    if let Some(token) = row.get(STATE_COLUMN) {
        if letter_to_state(token).is_some() {
            return Some((*token).to_string());
        }
    }
    if row.get(STATE_COLUMN - 1) == Some(&"E") {
        return Some(ER_SENTINEL.to_string());
    }
    None
}

fn row_state(row: &[&str]) -> JobState {
    row_state_letter(row)
        .and_then(|letter| letter_to_state(&letter))
        .unwrap_or(JobState::Unknown)
}

/// The id column is itself truncated in wide listings, so either value may
/// be a prefix of the other.
fn id_matches(row_id: &str, job_id: &str) -> bool {
    row_id == job_id || job_id.starts_with(row_id) || row_id.starts_with(job_id)
}

pub fn parse_job_status(job_id: &str, raw: &str) -> Option<JobStatus> {
    for line in raw.lines() {
        let row = columns(line);
        match row.first() {
            Some(first) if id_matches(first, job_id) => {
                return Some(JobStatus::new(job_id, row_state(&row)));
            }
            _ => continue,
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
                Some(name) => line.contains(truncate(name, NAME_WIDTH)),
                None => row.first().is_some_and(|first| id_matches(first, job_id)),
            };
            if hit { Some(row_state(&row)) } else { None }
        });
        match found {
            Some(state) => {
                let status = JobStatus::new(job_id, state);
                statuses.insert(key, status);
            }
            None => {
                tracing::debug!(job_id, "job not present in qstat output");
            }
        }
    }
}

/// Recover a job id from full `qstat -f`-style output, matching on the
/// `Job_Name` attribute. The displayed name may be truncated, so a prefix of
/// the requested name is accepted.
pub fn parse_job_id_by_name(job_name: &str, raw: &str) -> Option<String> {
    let mut current_id: Option<String> = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((attribute, value)) = trimmed.split_once('=') {
            if attribute.trim() == "Job_Name" {
                let value = value.trim();
                let matched = value == job_name
                    || (!value.is_empty()
                        && value.len() < job_name.len()
                        && job_name.starts_with(value));
                if matched {
                    return current_id;
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("Job Id:") {
            current_id = Some(rest.trim().to_string());
        } else {
            current_id = columns(trimmed).first().map(|id| (*id).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::status_key;

    // qstat -u output; the A312402627 row is in E state and hit by the
    // padding bug (SessID column missing, row shifted left).
    const QSTAT_TABLE: &str = "\
gordon-fe2.local:
                                                                         Req'd  Req'd   Elap
Job ID               Username Queue    Jobname    SessID NDS   TSK Memory Time  S Time
-------------------- -------- -------- ---------- ------ ----- --- ------ ----- - -----
2080801.gordon-fe2   cjh      normal   A_older    12001  1     8   1gb    00:30 U 00:01
2080802.gordon-fe2   cjh      normal   A3124026   12002  1     8   1gb    00:30 Q   --
2080803.gordon-fe2   cjh      normal   B_running  12003  1     8   1gb    00:30 R 00:05
2080804.gordon-fe2   cjh      normal   C_done     12004  1     8   1gb    00:30 C 00:22
2080805.gordon-fe2   cjh      normal   D_exiting  1     8   1gb    00:30 E 00:29
";

    #[test]
    fn test_submission_id_is_first_line() {
        assert_eq!(
            parse_submission_id("2080802.gordon-fe2.local\n").as_deref(),
            Some("2080802.gordon-fe2.local")
        );
        assert_eq!(parse_submission_id("\n  \n"), None);
    }

    #[test]
    fn test_submission_failure_keywords() {
        assert!(submission_failed("qsub: submit error (Unauthorized Request)"));
        assert!(submission_failed("job submission FAILED: bad queue"));
        assert!(!submission_failed("2080802.gordon-fe2.local"));
    }

    #[test]
    fn test_state_letters_normalize() {
        let mut statuses = HashMap::from([
            (status_key("2080801.gordon-fe2", "A_older"), JobStatus::new("2080801.gordon-fe2", JobState::Submitted)),
            (status_key("2080802.gordon-fe2", "A3124026"), JobStatus::new("2080802.gordon-fe2", JobState::Submitted)),
            (status_key("2080803.gordon-fe2", "B_running"), JobStatus::new("2080803.gordon-fe2", JobState::Submitted)),
            (status_key("2080804.gordon-fe2", "C_done"), JobStatus::new("2080804.gordon-fe2", JobState::Submitted)),
        ]);
        parse_job_statuses("cjh", &mut statuses, QSTAT_TABLE);

        let state_of = |id: &str, name: &str| statuses[&status_key(id, name)].state;
        assert_eq!(state_of("2080801.gordon-fe2", "A_older"), JobState::Unknown);
        assert_eq!(state_of("2080802.gordon-fe2", "A3124026"), JobState::Queued);
        assert_eq!(state_of("2080803.gordon-fe2", "B_running"), JobState::Active);
        assert_eq!(state_of("2080804.gordon-fe2", "C_done"), JobState::Complete);
    }

    #[test]
    fn test_e_state_padding_bug_maps_to_er_sentinel() {
        let shifted = columns("2080805.gordon-fe2   cjh      normal   D_exiting  1     8   1gb    00:30 E 00:29");
        assert_eq!(row_state_letter(&shifted).as_deref(), Some(ER_SENTINEL));

        let mut statuses = HashMap::from([(
            status_key("2080805.gordon-fe2", "D_exiting"),
            JobStatus::new("2080805.gordon-fe2", JobState::Submitted),
        )]);
        parse_job_statuses("cjh", &mut statuses, QSTAT_TABLE);
        let status = &statuses[&status_key("2080805.gordon-fe2", "D_exiting")];
        assert_eq!(status.state, JobState::Failed);
        assert_ne!(status.state, JobState::Unknown);
    }

    #[test]
    fn test_missing_job_leaves_entry_untouched() {
        let mut statuses = HashMap::from([(
            status_key("9999999.gordon-fe2", "NOT_HERE"),
            JobStatus::new("9999999.gordon-fe2", JobState::Submitted),
        )]);
        parse_job_statuses("cjh", &mut statuses, QSTAT_TABLE);
        assert_eq!(
            statuses[&status_key("9999999.gordon-fe2", "NOT_HERE")].state,
            JobState::Submitted
        );
    }

    #[test]
    fn test_single_job_lookup_with_truncated_id() {
        let status = parse_job_status("2080803.gordon-fe2.local", QSTAT_TABLE).unwrap();
        assert_eq!(status.state, JobState::Active);
        assert!(parse_job_status("7777777.elsewhere", QSTAT_TABLE).is_none());
    }

    #[test]
    fn test_job_id_recovered_by_name() {
        let raw = "2080802.gordon-fe2.local\nJob_Name = A312402627";
        assert_eq!(
            parse_job_id_by_name("A312402627", raw).as_deref(),
            Some("2080802.gordon-fe2.local")
        );
    }

    #[test]
    fn test_job_id_by_name_accepts_truncated_display() {
        let raw = "Job Id: 2080807.gordon-fe2.local\n    Job_Name = VeryLongJob";
        assert_eq!(
            parse_job_id_by_name("VeryLongJobNameTruncated", raw).as_deref(),
            Some("2080807.gordon-fe2.local")
        );
        assert_eq!(parse_job_id_by_name("Unrelated", raw), None);
    }
}
