use petrel::{
    DataStagingItem, ExperimentId, GatewayId, ProcessId, ProcessLaunchEvent, ProcessPlan,
    SchedulerKind, TokenId,
};

/// Launch event fixture with a fixed experiment/gateway identity.
pub fn test_launch_event(process_id: &str) -> ProcessLaunchEvent {
    ProcessLaunchEvent {
        process_id: ProcessId::new(process_id),
        experiment_id: ExperimentId::new("exp-1"),
        gateway_id: GatewayId::new("testdrive"),
        token_id: TokenId::new("token-1"),
    }
}

/// A one-input, one-output PBS plan against temp-dir scratch space.
pub fn test_plan(process_id: &str) -> ProcessPlan {
    ProcessPlan {
        working_directory: format!("/scratch/{process_id}"),
        scratch_directory: std::env::temp_dir(),
        inputs: vec![DataStagingItem {
            name: format!("{process_id}-input.dat"),
            storage_path: format!("/archive/{process_id}/input.dat"),
            compute_path: format!("/scratch/{process_id}/{process_id}-input.dat"),
        }],
        outputs: vec![DataStagingItem {
            name: format!("{process_id}-output.dat"),
            storage_path: format!("/archive/{process_id}/output.dat"),
            compute_path: format!("/scratch/{process_id}/{process_id}-output.dat"),
        }],
        scheduler: SchedulerKind::Pbs,
        submit_command: "qsub launch.pbs".to_string(),
        status_command: "qstat -u tester".to_string(),
        job_name: "A312402627".to_string(),
        login_username: "tester".to_string(),
        task_id: "task-1".to_string(),
    }
}
