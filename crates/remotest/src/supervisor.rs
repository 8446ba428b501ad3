//! Worker process supervisor.
//!
//! Spawns the configured shell command as a child process, relays its output
//! line-prefixed so interleaved worker output stays attributable, and
//! guarantees the child does not outlive the coordinator: `kill_on_drop` on
//! the command plus an explicit kill in `Drop`.

use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for worker process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Prefixes every new line in a chunked text stream.
///
/// State carries across chunks: a chunk ending in a newline leaves the
/// trailing empty line unprefixed and the next chunk starts a fresh line.
pub struct LinePrefixer {
    prefix: String,
    at_line_start: bool,
}

impl LinePrefixer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            at_line_start: true,
        }
    }

    pub fn transform(&mut self, chunk: &str) -> String {
        let lines: Vec<&str> = chunk.split('\n').collect();
        let last = lines.len() - 1;
        let mut out = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if index == 0 && self.at_line_start {
                self.at_line_start = false;
                out.push(format!("{}{}", self.prefix, line));
            } else if index == 0 {
                // Continuation of a line started in a previous chunk.
                out.push((*line).to_string());
            } else if index == last && line.is_empty() {
                // Chunk ended with a newline; the prefix carries over.
                self.at_line_start = true;
                out.push(String::new());
            } else {
                out.push(format!("{}{}", self.prefix, line));
            }
        }
        out.join("\n")
    }
}

enum SupervisorState {
    Stopped,
    Running {
        child: Child,
        output_tasks: Vec<JoinHandle<()>>,
    },
}

/// Owns the worker child process for one session.
pub struct Supervisor {
    command: String,
    log_prefix: String,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(command: impl Into<String>, log_prefix: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            log_prefix: log_prefix.into(),
            state: SupervisorState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SupervisorState::Running { .. })
    }

    /// Spawn the worker. Resolves once the OS confirms the process exists.
    pub async fn start(&mut self) -> Result<(), SpawnError> {
        if self.is_running() {
            return Ok(());
        }

        tracing::info!(command = %self.command, "spawning worker");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let prefix = format!("[{}] ", self.log_prefix);
        let mut output_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output_tasks.push(tokio::spawn(relay_output(
                stdout,
                tokio::io::stdout(),
                LinePrefixer::new(prefix.clone()),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            output_tasks.push(tokio::spawn(relay_output(
                stderr,
                tokio::io::stderr(),
                LinePrefixer::new(prefix),
            )));
        }

        tracing::debug!(pid = ?child.id(), "worker spawned");
        self.state = SupervisorState::Running {
            child,
            output_tasks,
        };
        Ok(())
    }

    /// Force-terminate the worker. Resolves once the process has actually
    /// exited. Idempotent.
    pub async fn stop(&mut self) -> Result<(), SpawnError> {
        match std::mem::replace(&mut self.state, SupervisorState::Stopped) {
            SupervisorState::Stopped => Ok(()),
            SupervisorState::Running {
                mut child,
                output_tasks,
            } => {
                if let Err(error) = child.start_kill() {
                    // InvalidInput means the child already exited.
                    if error.kind() != std::io::ErrorKind::InvalidInput {
                        return Err(SpawnError::Wait(error));
                    }
                }
                let status = child.wait().await.map_err(SpawnError::Wait)?;
                tracing::info!(code = ?status.code(), "worker exited");
                for task in output_tasks {
                    let _ = task.await;
                }
                Ok(())
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let SupervisorState::Running { child, .. } = &mut self.state {
            let _ = child.start_kill();
        }
    }
}

async fn relay_output(
    mut source: impl AsyncReadExt + Unpin,
    mut sink: impl AsyncWriteExt + Unpin,
    mut prefixer: LinePrefixer,
) {
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let prefixed = prefixer.transform(&text);
                if sink.write_all(prefixed.as_bytes()).await.is_err() {
                    break;
                }
                let _ = sink.flush().await;
            }
            Err(error) => {
                tracing::debug!(%error, "worker output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_every_line() {
        let mut prefixer = LinePrefixer::new("> ");
        assert_eq!(prefixer.transform("hi,\nthere!"), "> hi,\n> there!");
    }

    #[test]
    fn trailing_newline_carries_prefix_state() {
        let mut prefixer = LinePrefixer::new("> ");
        assert_eq!(prefixer.transform("hi,\n"), "> hi,\n");
        assert_eq!(prefixer.transform("there!"), "> there!");
    }

    #[test]
    fn split_line_is_not_prefixed_twice() {
        let mut prefixer = LinePrefixer::new("> ");
        assert_eq!(prefixer.transform("par"), "> par");
        assert_eq!(prefixer.transform("tial\nnext"), "tial\n> next");
    }

    #[test]
    fn single_newline_chunk() {
        let mut prefixer = LinePrefixer::new("> ");
        assert_eq!(prefixer.transform("\n"), "> \n");
        assert_eq!(prefixer.transform("after"), "> after");
    }

    #[tokio::test]
    async fn start_and_stop_a_worker() {
        let mut supervisor = Supervisor::new("sleep 30", "worker");
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut supervisor = Supervisor::new("sleep 30", "worker");
        supervisor.stop().await.unwrap();

        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_after_child_already_exited() {
        let mut supervisor = Supervisor::new("true", "worker");
        supervisor.start().await.unwrap();
        // Give the child time to exit on its own.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        supervisor.stop().await.unwrap();
    }
}
