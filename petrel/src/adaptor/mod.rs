//! Remote-execution adaptor.
//!
//! Turns the pipeline's directory/copy/exec operations into an interactive
//! remote shell plus the copy-receiver byte protocol in [`scp`]. The
//! [`RemoteExecution`] trait is the seam the pipeline depends on; the
//! `ssh`-feature [`session::SshSession`] is the production implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod scp;
#[cfg(feature = "ssh")]
pub mod session;

use crate::process::{GatewayId, TokenId};

/// Adaptor failure taxonomy. Connection and protocol errors are fatal for
/// the pipeline run that hit them; they are wrapped with enough context
/// (command, host, user) to be actionable in a failure report.
#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("connection to {user}@{host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        user: String,
        reason: String,
    },
    #[error("authentication failed for {user}@{host}: {reason}")]
    Authentication {
        host: String,
        user: String,
        reason: String,
    },
    #[error("transfer protocol error at {step}: {reason}")]
    Protocol {
        step: scp::HandshakeStep,
        reason: String,
    },
    #[error("remote command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Captured output of one remote command.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How to authenticate the remote shell session.
#[derive(Clone)]
pub enum AuthMethod {
    Password { password: String },
    KeyPair {
        private_key: PathBuf,
        public_key: Option<PathBuf>,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs.
        match self {
            AuthMethod::Password { .. } => f.write_str("AuthMethod::Password"),
            AuthMethod::KeyPair { private_key, .. } => f
                .debug_struct("AuthMethod::KeyPair")
                .field("private_key", private_key)
                .finish_non_exhaustive(),
        }
    }
}

/// Connection settings for one target host.
#[derive(Clone, Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// When disabled, host-key verification is skipped. This is an explicit,
    /// operator-controlled degradation and is logged at session
    /// establishment.
    pub strict_host_key_checking: bool,
    /// OpenSSH-format known-hosts file; required when strict checking is on.
    pub known_hosts_path: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            strict_host_key_checking: true,
            known_hosts_path: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Identity a session is opened for. One live session per key, owned
/// exclusively by the pipeline run that opened it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionKey {
    pub gateway_id: GatewayId,
    pub compute_resource_id: String,
    pub credential_token: TokenId,
    pub login_username: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.gateway_id, self.compute_resource_id, self.login_username
        )
    }
}

/// High-level remote operations the task pipeline consumes.
///
/// Directory operations have default implementations over [`execute`] using
/// the portable command surface (`mkdir -p`, `ls`), matching what the remote
/// side of the copy protocol expects to exist.
///
/// [`execute`]: RemoteExecution::execute
#[async_trait]
pub trait RemoteExecution: Send + Sync {
    /// Run a command, optionally inside a working directory, and capture its
    /// output. Synchronous from the caller's viewpoint; one exec channel per
    /// call.
    async fn execute(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, AdaptorError>;

    /// Copy a local file to the remote path via the copy protocol.
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), AdaptorError>;

    /// Copy a remote file to the local path via the copy protocol.
    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), AdaptorError>;

    async fn create_directory(&self, path: &str) -> Result<(), AdaptorError> {
        let command = format!("mkdir -p {path}");
        let output = self.execute(&command, None).await?;
        if output.stderr.contains("mkdir:") {
            return Err(AdaptorError::Command {
                command,
                reason: output.stderr,
            });
        }
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, AdaptorError> {
        let command = format!("ls {path}");
        let output = self.execute(&command, None).await?;
        if output.stderr.contains("ls:") {
            return Err(AdaptorError::Command {
                command,
                reason: output.stderr,
            });
        }
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_debug_hides_secrets() {
        let password = AuthMethod::Password {
            password: "hunter2".into(),
        };
        let rendered = format!("{password:?}");
        assert!(!rendered.contains("hunter2"));

        let keypair = AuthMethod::KeyPair {
            private_key: PathBuf::from("/home/cjh/.ssh/id_rsa"),
            public_key: None,
            passphrase: Some("secret".into()),
        };
        let rendered = format!("{keypair:?}");
        assert!(rendered.contains("id_rsa"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_session_key_display_omits_token() {
        let key = SessionKey {
            gateway_id: GatewayId::new("gw"),
            compute_resource_id: "gordon.sdsc.edu".into(),
            credential_token: TokenId::new("secret-token"),
            login_username: "cjh".into(),
        };
        let rendered = key.to_string();
        assert_eq!(rendered, "gw:gordon.sdsc.edu:cjh");
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_command_output_success() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(output.success());
        assert!(
            !CommandOutput {
                exit_code: 1,
                ..output
            }
            .success()
        );
    }
}
