use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;
use tracing::debug;

use crate::provider::BoxFuture;

/// Remote directory payload files are uploaded to before execution.
pub const REMOTE_STAGING_DIR: &str = "/tmp";

/// ssh reserves exit status 255 for its own failures (connect, auth, host
/// resolution); anything else came from the remote command.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// One remote session endpoint: where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub address: String,
    pub username: String,
    pub key_name: String,
}

#[derive(Debug)]
pub enum ExecError {
    /// The session could not be established or was cut short.
    Transport { message: String },
    /// The session worked but the remote command exited non-zero.
    Remote { exit_code: i32, stderr: String },
    Io(io::Error),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "transport failure: {message}"),
            Self::Remote { exit_code, stderr } => {
                write!(f, "remote command exited with status {exit_code}: {stderr}")
            }
            Self::Io(e) => write!(f, "executor io error: {e}"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ExecError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Opens an authenticated session to one node and either runs a command or
/// uploads-and-runs a script, returning captured stdout.
pub trait Executor: Send + Sync + 'static {
    fn run_command(
        &self,
        target: ExecTarget,
        command: String,
    ) -> BoxFuture<'_, Result<String, ExecError>>;

    fn run_script(
        &self,
        target: ExecTarget,
        local_path: PathBuf,
    ) -> BoxFuture<'_, Result<String, ExecError>>;
}

pub fn key_path(ssh_dir: &Path, key_name: &str) -> PathBuf {
    ssh_dir.join(format!("{key_name}.pem"))
}

/// Remote executor driving the system `ssh` and `scp` binaries. Uses the
/// `.pem` file named after the target's credential key when one exists under
/// the configured ssh directory, and falls back to the ssh agent otherwise.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_dir: PathBuf,
}

impl SshExecutor {
    pub fn new(ssh_dir: PathBuf) -> Self {
        Self { ssh_dir }
    }

    pub fn identity_for(&self, key_name: &str) -> Option<PathBuf> {
        let path = key_path(&self.ssh_dir, key_name);
        path.is_file().then_some(path)
    }

    async fn exec_command(&self, target: ExecTarget, command: String) -> Result<String, ExecError> {
        debug!(address = %target.address, "running remote command");
        self.ssh(&target, command).await
    }

    async fn exec_script(
        &self,
        target: ExecTarget,
        local_path: PathBuf,
    ) -> Result<String, ExecError> {
        let file_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "payload path has no file name")
            })?
            .to_string();

        debug!(address = %target.address, file = %file_name, "uploading payload");
        let mut scp = Command::new("scp");
        scp.args(common_options(self.identity_for(&target.key_name).as_deref()));
        scp.arg(&local_path);
        scp.arg(format!(
            "{}@{}:{}/",
            target.username, target.address, REMOTE_STAGING_DIR
        ));
        // An upload failure is a session failure, whichever way scp exited.
        match capture(scp).await {
            Ok(_) => {}
            Err(ExecError::Remote { exit_code, stderr }) => {
                return Err(ExecError::Transport {
                    message: format!("upload exited with status {exit_code}: {stderr}"),
                });
            }
            Err(e) => return Err(e),
        }

        self.ssh(&target, remote_invocation(&file_name)).await
    }

    async fn ssh(&self, target: &ExecTarget, remote_command: String) -> Result<String, ExecError> {
        let mut cmd = Command::new("ssh");
        cmd.args(common_options(self.identity_for(&target.key_name).as_deref()));
        cmd.arg(format!("{}@{}", target.username, target.address));
        cmd.arg(remote_command);
        capture(cmd).await
    }
}

impl Executor for SshExecutor {
    fn run_command(
        &self,
        target: ExecTarget,
        command: String,
    ) -> BoxFuture<'_, Result<String, ExecError>> {
        Box::pin(self.exec_command(target, command))
    }

    fn run_script(
        &self,
        target: ExecTarget,
        local_path: PathBuf,
    ) -> BoxFuture<'_, Result<String, ExecError>> {
        Box::pin(self.exec_script(target, local_path))
    }
}

fn common_options(identity: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if let Some(identity) = identity {
        args.push("-i".to_string());
        args.push(identity.to_string_lossy().into_owned());
    }
    args
}

fn remote_invocation(file_name: &str) -> String {
    let staged = format!("{REMOTE_STAGING_DIR}/{file_name}");
    format!("chmod +x {staged} && {staged}")
}

async fn capture(mut cmd: Command) -> Result<String, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd.output().await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ExecError::Transport {
                message: "ssh binary not found on PATH".to_string(),
            }
        } else {
            ExecError::Io(err)
        }
    })?;

    outcome_from_output(output)
}

fn outcome_from_output(output: std::process::Output) -> Result<String, ExecError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    match output.status.code() {
        Some(0) => Ok(stdout),
        Some(SSH_TRANSPORT_EXIT) => Err(ExecError::Transport { message: stderr }),
        Some(code) => Err(ExecError::Remote {
            exit_code: code,
            stderr,
        }),
        None => Err(ExecError::Transport {
            message: "session terminated by signal".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use pretty_assertions::assert_eq;

    use super::*;

    fn output(raw_status: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(raw_status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn success_returns_stdout() {
        let result = outcome_from_output(output(0, "load complete\n", ""));
        assert_eq!(result.unwrap(), "load complete\n");
    }

    #[test]
    fn exit_255_is_a_transport_failure() {
        match outcome_from_output(output(255 << 8, "", "connection refused")) {
            Err(ExecError::Transport { message }) => {
                assert_eq!(message, "connection refused")
            }
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    #[test]
    fn other_nonzero_exit_keeps_code_and_stderr() {
        match outcome_from_output(output(2 << 8, "", "no such file")) {
            Err(ExecError::Remote { exit_code, stderr }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "no such file");
            }
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[test]
    fn identity_is_used_only_when_the_pem_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = SshExecutor::new(tmp.path().to_path_buf());
        assert_eq!(executor.identity_for("fleet-key"), None);

        let pem = tmp.path().join("fleet-key.pem");
        fs::write(&pem, "key material").unwrap();
        assert_eq!(executor.identity_for("fleet-key"), Some(pem));
    }

    #[test]
    fn common_options_include_identity_flag_only_with_a_key() {
        let without = common_options(None);
        assert!(!without.contains(&"-i".to_string()));

        let with = common_options(Some(Path::new("/keys/fleet-key.pem")));
        assert!(with.contains(&"-i".to_string()));
        assert!(with.contains(&"/keys/fleet-key.pem".to_string()));
    }

    #[test]
    fn remote_invocation_pins_the_staging_path() {
        assert_eq!(
            remote_invocation("load.sh"),
            "chmod +x /tmp/load.sh && /tmp/load.sh"
        );
    }
}
