//! Startup and shutdown scripts
//!
//! Scripts run as child processes. Their output and exit status are collected
//! by a background task and drained by the scheduler on each iteration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    Startup,
    Shutdown,
}

/// Something a running script reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    Output(String),
    /// Exit code, -1 when the script could not run or was killed by a signal
    Exited(i32),
}

/// A script started by the scheduler
pub struct RunningScript {
    pub phase: ScriptPhase,
    pub path: PathBuf,
    events: mpsc::UnboundedReceiver<ScriptEvent>,
    task: JoinHandle<()>,
}

impl RunningScript {
    /// Start `path` in the background. Must be called from within a tokio runtime.
    pub fn spawn(phase: ScriptPhase, path: &Path) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = path.to_path_buf();
        let task = tokio::spawn(async move {
            let code = match run(&script, &tx).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!("Failed to run script {}: {}", script.display(), e);
                    let _ = tx.send(ScriptEvent::Output(e.to_string()));
                    -1
                }
            };
            let _ = tx.send(ScriptEvent::Exited(code));
        });
        tracing::info!("Started {:?} script {}", phase, path.display());
        Self {
            phase,
            path: path.to_path_buf(),
            events: rx,
            task,
        }
    }

    /// Everything reported since the last call
    pub fn drain(&mut self) -> Vec<ScriptEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Kill the script if still running
    pub fn terminate(self) {
        tracing::info!("Terminating script {}", self.path.display());
        self.task.abort();
    }
}

async fn run(path: &Path, tx: &mpsc::UnboundedSender<ScriptEvent>) -> std::io::Result<i32> {
    let mut child = Command::new(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let _ = tx.send(ScriptEvent::Output(line));
        }
    }

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_exit(script: &mut RunningScript) -> (Vec<String>, i32) {
        let mut output = Vec::new();
        for _ in 0..200 {
            for event in script.drain() {
                match event {
                    ScriptEvent::Output(line) => output.push(line),
                    ScriptEvent::Exited(code) => return (output, code),
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("script did not exit");
    }

    #[tokio::test]
    async fn test_script_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "ok.sh", "echo opening roof\necho done");
        let mut script = RunningScript::spawn(ScriptPhase::Startup, &path);

        let (output, code) = wait_exit(&mut script).await;
        assert_eq!(code, 0);
        assert_eq!(output, vec!["opening roof".to_string(), "done".to_string()]);
    }

    #[tokio::test]
    async fn test_script_failure_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "fail.sh", "exit 3");
        let mut script = RunningScript::spawn(ScriptPhase::Shutdown, &path);

        let (_, code) = wait_exit(&mut script).await;
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_missing_script() {
        let mut script = RunningScript::spawn(ScriptPhase::Startup, Path::new("/nonexistent/script.sh"));
        let (_, code) = wait_exit(&mut script).await;
        assert_eq!(code, -1);
    }
}
