use std::collections::HashMap;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use petrel::parsers::status_key;
use petrel::{JobState, JobStatus, SchedulerKind};

fn pbs_table(rows: usize) -> String {
    let mut table = String::from(
        "Job ID               Username Queue    Jobname    SessID NDS   TSK Memory Time  S Time\n",
    );
    for n in 0..rows {
        table.push_str(&format!(
            "{n:07}.gordon-fe2   cjh      normal   job{n:05}   12002  1     8   1gb    00:30 R 00:05\n"
        ));
    }
    table
}

fn lsf_table(rows: usize) -> String {
    let mut table = String::from(
        "JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME\n",
    );
    for n in 0..rows {
        table.push_str(&format!(
            "{n:07} lg11w   RUN   long       ghpcc06     c11b02      job{n:05}   Mar  7 00:58\n"
        ));
    }
    table
}

fn bench_bulk_status_parsing(c: &mut Criterion) {
    let pbs = pbs_table(500);
    let pbs_statuses: HashMap<String, JobStatus> = (0..100)
        .map(|n| {
            let id = format!("{n:07}.gordon-fe2");
            (
                status_key(&id, &format!("job{n:05}")),
                JobStatus::new(id, JobState::Submitted),
            )
        })
        .collect();

    c.bench_function("pbs_bulk_status_parse_500_rows", |b| {
        b.iter(|| {
            let mut statuses = pbs_statuses.clone();
            SchedulerKind::Pbs.parse_job_statuses("cjh", &mut statuses, black_box(&pbs));
            statuses
        })
    });

    let lsf = lsf_table(500);
    let lsf_statuses: HashMap<String, JobStatus> = (0..100)
        .map(|n| {
            let id = format!("{n:07}");
            (id.clone(), JobStatus::new(id, JobState::Submitted))
        })
        .collect();

    c.bench_function("lsf_bulk_status_parse_500_rows", |b| {
        b.iter(|| {
            let mut statuses = lsf_statuses.clone();
            SchedulerKind::Lsf.parse_job_statuses("lg11w", &mut statuses, black_box(&lsf));
            statuses
        })
    });
}

fn bench_single_job_lookup(c: &mut Criterion) {
    let table = pbs_table(500);
    c.bench_function("pbs_single_status_parse_500_rows", |b| {
        b.iter(|| SchedulerKind::Pbs.parse_job_status(black_box("0000499.gordon-fe2"), &table))
    });
}

criterion_group!(benches, bench_bulk_status_parsing, bench_single_job_lookup);
criterion_main!(benches);
