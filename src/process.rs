//! Shell script execution with streamed output and a kill-tree policy.
//!
//! Scripts run inside the task environment merged on top of the ambient
//! process environment. On Unix each script gets its own process group so
//! the whole tree can be signalled on cancellation or deadline, unless the
//! task opts out via `CIRRUS_ESCAPING_PROCESSES`.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::environment::Environment;
use crate::errors::{Error, Result};
use crate::logs::LogUploader;

pub struct ShellProcess {
    child: Child,
    leader_pid: Option<u32>,
    pumps: Vec<tokio::task::JoinHandle<()>>,
}

fn build_command(scripts: &[String], env: &Environment) -> Command {
    let program = scripts.join("\n");

    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("sh");
        command.arg("-c").arg(program);
        command.process_group(0);
        command
    };

    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd.exe");
        command.arg("/c").arg(program);
        command
    };

    command
        .envs(env.items())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(working_dir) = env.lookup("CIRRUS_WORKING_DIR") {
        if Path::new(&working_dir).is_dir() {
            command.current_dir(&working_dir);
        }
    }

    command
}

fn pump_output<R>(mut reader: R, uploader: Arc<LogUploader>) -> tokio::task::JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    uploader.write_bytes(&buffer[..n]);
                    if uploader.wants_flush() {
                        uploader.flush().await;
                    }
                }
            }
        }
    })
}

/// Launch the scripts detached; output keeps streaming into the uploader
/// until the process exits or is killed.
pub fn spawn_scripts(
    scripts: &[String],
    env: &Environment,
    uploader: Arc<LogUploader>,
) -> Result<ShellProcess> {
    let mut command = build_command(scripts, env);
    let mut child = command
        .spawn()
        .map_err(|e| Error::command_execution("sh", format!("failed to spawn: {e}"), None))?;
    let leader_pid = child.id();

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_output(stdout, Arc::clone(&uploader)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_output(stderr, Arc::clone(&uploader)));
    }

    Ok(ShellProcess {
        child,
        leader_pid,
        pumps,
    })
}

/// Run the scripts in the foreground. Returns the exit status, a dedicated
/// timeout error when the deadline expires, or a cancellation error.
pub async fn run_scripts_and_wait(
    token: &CancellationToken,
    deadline: Instant,
    command_name: &str,
    scripts: &[String],
    env: &Environment,
    uploader: Arc<LogUploader>,
    kill_tree: bool,
) -> Result<ExitStatus> {
    let mut process = spawn_scripts(scripts, env, Arc::clone(&uploader))?;

    let status = tokio::select! {
        status = process.child.wait() => {
            status.map_err(|e| Error::command_execution(command_name, e.to_string(), None))
        }
        _ = tokio::time::sleep_until(deadline) => {
            uploader.write_line("\nTimed out!");
            let _ = process.terminate(kill_tree);
            let _ = process.child.wait().await;
            Err(Error::timeout(command_name))
        }
        _ = token.cancelled() => {
            let _ = process.terminate(kill_tree);
            let _ = process.child.wait().await;
            Err(Error::command_execution(command_name, "cancelled", None))
        }
    };

    // Escaped descendants can keep the pipes open, so the drain is bounded.
    process.drain_output().await;
    uploader.flush().await;
    status
}

impl ShellProcess {
    pub fn id(&self) -> Option<u32> {
        self.leader_pid
    }

    /// Deliver a kill to the whole process group, or to the leader only
    /// when the task allows descendants to escape.
    pub fn terminate(&mut self, kill_tree: bool) -> std::result::Result<(), String> {
        #[cfg(unix)]
        if kill_tree {
            if let Some(pid) = self.leader_pid {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(pid, error = %e, "failed to kill process group, killing leader");
                    }
                }
            }
        }

        self.child.start_kill().map_err(|e| e.to_string())
    }

    /// Wait for the process to exit after a kill was delivered.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Wait briefly for the output pumps to reach end-of-stream.
    pub async fn drain_output(&mut self) {
        for pump in self.pumps.drain(..) {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), pump).await;
        }
    }
}

/// Whether the exit status was produced by a signal rather than a plain
/// exit. Always false on non-Unix platforms.
pub fn signaled_to_exit(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().is_some()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}
