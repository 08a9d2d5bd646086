//! libssh2-backed remote shell session.
//!
//! One authenticated session per target host, owned exclusively by the
//! pipeline run that opened it. Every command and transfer opens its own
//! exec channel; channels are never reused or shared across concurrent
//! calls. libssh2 is blocking, so all channel work runs under
//! `spawn_blocking` with the session behind a mutex.

use std::fs::File;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{CheckResult, KnownHostFileKind};

use crate::adaptor::{scp, AdaptorError, AuthMethod, CommandOutput, RemoteExecution, SshConfig};

pub struct SshSession {
    inner: Arc<Mutex<ssh2::Session>>,
    config: SshConfig,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("username", &self.config.username)
            .finish()
    }
}

fn join_error(err: tokio::task::JoinError) -> AdaptorError {
    AdaptorError::Io(std::io::Error::other(err))
}

fn command_error(command: &str, reason: impl std::fmt::Display) -> AdaptorError {
    AdaptorError::Command {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

impl SshSession {
    /// Establish and authenticate a session.
    pub async fn connect(config: SshConfig) -> Result<Self, AdaptorError> {
        let blocking_config = config.clone();
        let session = tokio::task::spawn_blocking(move || connect_blocking(&blocking_config))
            .await
            .map_err(join_error)??;
        tracing::info!(
            host = %config.host,
            port = config.port,
            username = %config.username,
            "remote session established"
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            config,
        })
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

fn connect_blocking(config: &SshConfig) -> Result<ssh2::Session, AdaptorError> {
    let connection = |reason: String| AdaptorError::Connection {
        host: config.host.clone(),
        port: config.port,
        user: config.username.clone(),
        reason,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|err| connection(err.to_string()))?
        .next()
        .ok_or_else(|| connection("hostname resolved to no addresses".to_string()))?;
    let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)
        .map_err(|err| connection(err.to_string()))?;

    let mut session = ssh2::Session::new().map_err(|err| connection(err.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| connection(err.to_string()))?;

    if config.strict_host_key_checking {
        verify_host_key(&session, config)?;
    } else {
        tracing::warn!(
            host = %config.host,
            "strict host-key checking disabled; accepting the remote host key unverified"
        );
    }

    authenticate(&session, config)?;
    Ok(session)
}

fn verify_host_key(session: &ssh2::Session, config: &SshConfig) -> Result<(), AdaptorError> {
    let failure = |reason: String| AdaptorError::Connection {
        host: config.host.clone(),
        port: config.port,
        user: config.username.clone(),
        reason,
    };

    let path = config
        .known_hosts_path
        .as_ref()
        .ok_or_else(|| failure("strict host-key checking enabled but no known-hosts file configured".to_string()))?;
    let mut known_hosts = session
        .known_hosts()
        .map_err(|err| failure(err.to_string()))?;
    known_hosts
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|err| failure(format!("reading {}: {err}", path.display())))?;

    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| failure("remote offered no host key".to_string()))?;
    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(failure(format!(
            "host key not present in {}",
            path.display()
        ))),
        CheckResult::Mismatch => Err(failure("host key mismatch".to_string())),
        CheckResult::Failure => Err(failure("host key check failed".to_string())),
    }
}

fn authenticate(session: &ssh2::Session, config: &SshConfig) -> Result<(), AdaptorError> {
    let auth_failure = |reason: String| AdaptorError::Authentication {
        host: config.host.clone(),
        user: config.username.clone(),
        reason,
    };

    match &config.auth {
        AuthMethod::Password { password } => session
            .userauth_password(&config.username, password)
            .map_err(|err| auth_failure(err.to_string()))?,
        AuthMethod::KeyPair {
            private_key,
            public_key,
            passphrase,
        } => session
            .userauth_pubkey_file(
                &config.username,
                public_key.as_deref(),
                private_key,
                passphrase.as_deref(),
            )
            .map_err(|err| auth_failure(err.to_string()))?,
    }

    if !session.authenticated() {
        return Err(auth_failure("authentication was not accepted".to_string()));
    }
    Ok(())
}

fn run_command(session: &ssh2::Session, command: &str) -> Result<CommandOutput, AdaptorError> {
    let mut channel = session
        .channel_session()
        .map_err(|err| command_error(command, err))?;
    channel
        .exec(command)
        .map_err(|err| command_error(command, err))?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel
        .wait_close()
        .map_err(|err| command_error(command, err))?;
    let exit_code = channel
        .exit_status()
        .map_err(|err| command_error(command, err))?;

    tracing::debug!(command, exit_code, "remote command finished");
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

#[async_trait]
impl RemoteExecution for SshSession {
    async fn execute(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, AdaptorError> {
        let full = match workdir {
            Some(dir) => format!("cd {dir} && {command}"),
            None => command.to_string(),
        };
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let session = inner.lock();
            run_command(&session, &full)
        })
        .await
        .map_err(join_error)?
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), AdaptorError> {
        let inner = Arc::clone(&self.inner);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || {
            let basename = local
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    AdaptorError::Io(std::io::Error::other("local path has no file name"))
                })?
                .to_string();
            let mut file = File::open(&local)?;
            let metadata = file.metadata()?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs());

            let command = format!("scp -p -t {remote}");
            let session = inner.lock();
            let mut channel = session
                .channel_session()
                .map_err(|err| command_error(&command, err))?;
            channel
                .exec(&command)
                .map_err(|err| command_error(&command, err))?;

            scp::send_file(&mut file, metadata.len(), &basename, mtime, &mut channel)?;

            let _ = channel.send_eof();
            let _ = channel.wait_close();
            let mut stderr = String::new();
            let _ = channel.stderr().read_to_string(&mut stderr);
            if stderr.contains("scp:") {
                return Err(command_error(&command, stderr));
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), AdaptorError> {
        let inner = Arc::clone(&self.inner);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || {
            let command = format!("scp -f {remote}");
            let session = inner.lock();
            let mut channel = session
                .channel_session()
                .map_err(|err| command_error(&command, err))?;
            channel
                .exec(&command)
                .map_err(|err| command_error(&command, err))?;

            let mut file = File::create(&local)?;
            let received = scp::receive_file(&mut channel, &mut file)?;
            tracing::debug!(
                remote = %remote,
                local = %local.display(),
                size = received.size,
                "file downloaded"
            );
            Ok(())
        })
        .await
        .map_err(join_error)?
    }
}
