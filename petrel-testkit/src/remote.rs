use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use petrel::{
    AdaptorError, CommandOutput, PlanSource, ProcessLaunchEvent, ProcessPlan, RemoteExecution,
};

/// Scripted remote-execution endpoint with call recording.
///
/// Command responses are matched by substring and consumed in order;
/// unmatched commands succeed with empty output. Transfers move bytes
/// between the local filesystem and an in-memory remote tree.
#[derive(Default)]
pub struct MockRemote {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_next_upload: Mutex<Option<String>>,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("calls", &self.calls.lock().len())
            .field("files", &self.files.lock().len())
            .finish()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next command containing `needle`.
    pub fn respond(&self, needle: impl Into<String>, output: CommandOutput) {
        self.responses.lock().push((needle.into(), output));
    }

    /// Queue a plain-stdout response.
    pub fn respond_stdout(&self, needle: impl Into<String>, stdout: impl Into<String>) {
        self.respond(
            needle,
            CommandOutput {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
    }

    /// Make the next upload fail with the given reason.
    pub fn fail_next_upload(&self, reason: impl Into<String>) {
        *self.fail_next_upload.lock() = Some(reason.into());
    }

    /// Place a file into the remote tree (e.g. a job output to stage back).
    pub fn put_file(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.into(), content.into());
    }

    /// Content of a remote file, if present.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Every command executed, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of executed commands containing `needle`.
    pub fn call_count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }

    pub fn assert_no_calls(&self) {
        let calls = self.calls.lock();
        assert!(calls.is_empty(), "expected no remote calls, got {calls:?}");
    }
}

#[async_trait]
impl RemoteExecution for MockRemote {
    async fn execute(
        &self,
        command: &str,
        _workdir: Option<&str>,
    ) -> Result<CommandOutput, AdaptorError> {
        self.calls.lock().push(command.to_string());
        let mut responses = self.responses.lock();
        if let Some(index) = responses
            .iter()
            .position(|(needle, _)| command.contains(needle.as_str()))
        {
            return Ok(responses.remove(index).1);
        }
        Ok(CommandOutput::default())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), AdaptorError> {
        self.calls
            .lock()
            .push(format!("upload {} -> {remote}", local.display()));
        if let Some(reason) = self.fail_next_upload.lock().take() {
            return Err(AdaptorError::Command {
                command: format!("upload {remote}"),
                reason,
            });
        }
        let content = std::fs::read(local).unwrap_or_default();
        self.files.lock().insert(remote.to_string(), content);
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), AdaptorError> {
        self.calls
            .lock()
            .push(format!("download {remote} -> {}", local.display()));
        let content = self.files.lock().get(remote).cloned().unwrap_or_default();
        std::fs::write(local, content)?;
        Ok(())
    }
}

/// Plan source returning one fixed plan for every process.
#[derive(Debug)]
pub struct StaticPlanSource(pub ProcessPlan);

#[async_trait]
impl PlanSource for StaticPlanSource {
    async fn plan_for(&self, _event: &ProcessLaunchEvent) -> anyhow::Result<ProcessPlan> {
        Ok(self.0.clone())
    }
}
