//! Executable launcher: launch, poll, kill

use async_trait::async_trait;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a killed process gets to exit after SIGTERM
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Launcher failures
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fully resolved invocation of one step
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LaunchCommand {
    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// State of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Finished(i32),
    /// Terminated by a signal
    Killed,
}

/// A running external process
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking status check
    fn poll(&mut self) -> Result<PollStatus, LaunchError>;

    /// Terminate the process and wait for it
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Starts external processes for pipeline steps
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, cmd: &LaunchCommand) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// Runs steps as local child processes, each in its own process group
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, cmd: &LaunchCommand) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        debug!(command = %cmd.display(), cwd = ?cmd.cwd, "LocalLauncher::launch: called");
        let stdout = File::create(&cmd.stdout)?;
        let stderr = File::create(&cmd.stderr)?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        debug!(pid = ?child.id(), "LocalLauncher::launch: spawned");
        Ok(Box::new(LocalProcess { child }))
    }
}

struct LocalProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn poll(&mut self) -> Result<PollStatus, LaunchError> {
        match self.child.try_wait()? {
            None => Ok(PollStatus::Running),
            Some(status) => Ok(status.code().map(PollStatus::Finished).unwrap_or(PollStatus::Killed)),
        }
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        debug!(pid = ?self.child.id(), "LocalProcess::kill: called");

        // SIGTERM the whole group so MPI ranks and shell children go too
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(pid, error = %e, "LocalProcess::kill: killpg failed");
                }
                if tokio::time::timeout(KILL_GRACE, self.child.wait()).await.is_ok() {
                    return Ok(());
                }
                warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "LocalProcess::kill: start_kill failed");
        }
        self.child.wait().await?;
        Ok(())
    }
}

impl Drop for LocalProcess {
    /// An abandoned step (its evaluation was aborted) takes its whole group
    /// down, not just the direct child
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                debug!(pid, "LocalProcess::drop: killing process group");
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!(pid, error = %e, "LocalProcess::drop: killpg failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str, dir: &std::path::Path) -> LaunchCommand {
        LaunchCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: dir.to_path_buf(),
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        }
    }

    async fn wait(handle: &mut Box<dyn ProcessHandle>) -> PollStatus {
        loop {
            match handle.poll().unwrap() {
                PollStatus::Running => tokio::time::sleep(Duration::from_millis(10)).await,
                done => return done,
            }
        }
    }

    #[tokio::test]
    async fn test_exit_codes_and_redirection() {
        let temp = tempdir().unwrap();
        let mut handle = LocalLauncher.launch(&shell("echo hello; exit 3", temp.path())).await.unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(wait(&mut handle).await, PollStatus::Finished(3));

        let stdout = std::fs::read_to_string(temp.path().join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let temp = tempdir().unwrap();
        let mut handle = LocalLauncher.launch(&shell("sleep 30", temp.path())).await.unwrap();
        assert_eq!(handle.poll().unwrap(), PollStatus::Running);

        handle.kill().await.unwrap();
        assert_eq!(handle.poll().unwrap(), PollStatus::Killed);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let temp = tempdir().unwrap();
        let mut cmd = shell("", temp.path());
        cmd.program = "definitely-not-a-real-program-xyz".to_string();
        let err = LocalLauncher.launch(&cmd).await.err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    /// Running and not a zombie, per /proc
    #[cfg(target_os = "linux")]
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_process_group() {
        let temp = tempdir().unwrap();
        let script = "sleep 30 & echo $! > child.pid; wait";
        let handle = LocalLauncher.launch(&shell(script, temp.path())).await.unwrap();

        let pid_file = temp.path().join("child.pid");
        let mut grandchild = None;
        for _ in 0..200 {
            if let Ok(text) = std::fs::read_to_string(&pid_file)
                && let Ok(pid) = text.trim().parse::<i32>()
            {
                grandchild = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let grandchild = grandchild.unwrap();
        assert!(alive(grandchild));

        drop(handle);
        let mut gone = false;
        for _ in 0..200 {
            if !alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "grandchild {} survived", grandchild);
    }

    #[test]
    fn test_display() {
        let cmd = shell("true", std::path::Path::new("/tmp"));
        assert_eq!(cmd.display(), "sh -c true");
    }
}
