//! Key-pair generation and post-boot key installation.
//!
//! The provider cannot inject a key pair at boot, so the freshly started host
//! is reached once with the root password, the public key is copied over and
//! appended to `authorized_keys`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;
use crate::config::WaitSettings;

pub const SSH_USER: &str = "root";
pub const SSH_PORT: u16 = 22;

/// Default limit for one `ssh`, `scp` or `ssh-keygen` invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    Timeout {
        program: &'static str,
        timeout: Duration,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: &'static str,
        status: String,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how to log in to a host.
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl SshTarget {
    pub fn root(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: SSH_PORT,
            user: SSH_USER.into(),
            password: password.into(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

// Keeps the password out of debug output.
impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// `<private>.pub`
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Produces a key pair on disk.
#[async_trait]
pub trait KeyGenerator: Send + Sync + 'static {
    /// Ensure a key pair exists at `private_key`; returns the public key path.
    async fn generate(&self, private_key: &Path) -> Result<PathBuf, CredentialError>;
}

/// Password-authenticated file copy and command execution.
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    async fn copy(
        &self,
        target: &SshTarget,
        local: &Path,
        remote: &str,
    ) -> Result<(), CredentialError>;

    /// Run `command` remotely, returning its stdout.
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String, CredentialError>;
}

/// Run a program to completion, killing it if it outlives `timeout`.
async fn run_checked(
    program: &'static str,
    mut cmd: Command,
    timeout: Duration,
) -> Result<String, CredentialError> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CredentialError::Spawn { program, source })?;

    // Dropping the output future on timeout drops the child, which kills it.
    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        () = tokio::time::sleep(timeout) => {
            return Err(CredentialError::Timeout { program, timeout });
        }
    };

    if !output.status.success() {
        return Err(CredentialError::Failed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// [`KeyGenerator`] running `ssh-keygen`. An existing key pair is reused.
pub struct SshKeygen {
    timeout: Duration,
}

impl SshKeygen {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key: &Path) -> Result<PathBuf, CredentialError> {
        let public_key = public_key_path(private_key);
        if tokio::fs::try_exists(private_key).await? && tokio::fs::try_exists(&public_key).await? {
            debug!(path = %private_key.display(), "reusing existing key pair");
            return Ok(public_key);
        }
        if let Some(dir) = private_key.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        debug!(path = %private_key.display(), "creating key pair");
        let mut cmd = Command::new("ssh-keygen");
        cmd.args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
            .arg(private_key);
        run_checked("ssh-keygen", cmd, self.timeout).await?;
        Ok(public_key)
    }
}

/// [`RemoteShell`] driving `scp`/`ssh` through `sshpass`.
///
/// The password travels in the `SSHPASS` environment variable, never argv.
pub struct SshPassShell {
    timeout: Duration,
}

impl SshPassShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(program: &str, target: &SshTarget) -> Command {
        let mut cmd = Command::new("sshpass");
        cmd.arg("-e")
            .arg(program)
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "-o",
                "ConnectTimeout=10",
            ])
            .env("SSHPASS", &target.password);
        cmd
    }
}

impl Default for SshPassShell {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl RemoteShell for SshPassShell {
    async fn copy(
        &self,
        target: &SshTarget,
        local: &Path,
        remote: &str,
    ) -> Result<(), CredentialError> {
        let mut cmd = Self::command("scp", target);
        cmd.arg("-P")
            .arg(target.port.to_string())
            .arg(local)
            .arg(format!("{}:{remote}", target.destination()));
        run_checked("scp", cmd, self.timeout).await?;
        Ok(())
    }

    async fn run(&self, target: &SshTarget, command: &str) -> Result<String, CredentialError> {
        let mut cmd = Self::command("ssh", target);
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg(target.destination())
            .arg(command);
        run_checked("ssh", cmd, self.timeout).await
    }
}

/// Shell snippet that installs an uploaded public key for `root`.
pub fn install_command(remote_file: &str) -> String {
    format!(
        "mkdir -p .ssh && chmod 700 .ssh && cat {remote_file} >> .ssh/authorized_keys \
         && chmod 600 .ssh/authorized_keys && rm -f {remote_file}"
    )
}

/// Pushes a public key to a booted host and installs it.
pub struct CredentialInjector<'a> {
    shell: &'a dyn RemoteShell,
    cancel: &'a CancellationToken,
    attempts: u32,
    retry_delay: Duration,
}

impl<'a> CredentialInjector<'a> {
    pub fn new(
        shell: &'a dyn RemoteShell,
        wait: &WaitSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            shell,
            cancel,
            attempts: wait.ssh_attempts.max(1),
            retry_delay: wait.ssh_retry_delay,
        }
    }

    /// Copy `public_key` to the target's home directory and append it to
    /// `authorized_keys`.
    ///
    /// Only the copy is retried: sshd may come up after the instance reports
    /// `Running`. The install command runs once. Cancellation aborts any
    /// step, killing the running `scp`/`ssh`.
    pub async fn install(&self, target: &SshTarget, public_key: &Path) -> crate::Result<()> {
        let cancelled = || Error::Cancelled {
            waiting_for: format!("public key installation on {}", target.host),
        };
        let injection = |source: CredentialError| Error::KeyInjection {
            host: target.host.clone(),
            source,
        };
        let remote_file = public_key
            .file_name()
            .map_or_else(|| "id_rsa.pub".to_string(), |n| n.to_string_lossy().into_owned());

        let mut attempt = 1;
        loop {
            let copied = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(cancelled()),
                copied = self.shell.copy(target, public_key, &remote_file) => copied,
            };
            match copied {
                Ok(()) => break,
                Err(e) if attempt < self.attempts => {
                    warn!(host = %target.host, attempt, error = %e, "host not reachable yet");
                    attempt += 1;
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(cancelled()),
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => return Err(injection(e)),
            }
        }

        let command = install_command(&remote_file);
        let ran = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(cancelled()),
            ran = self.shell.run(target, &command) => ran,
        };
        ran.map_err(injection)?;
        info!(host = %target.host, "public key installed");
        Ok(())
    }
}
