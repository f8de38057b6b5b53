use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{AgentClient, AgentError, AgentOptions, MessageStream};

const DEFAULT_BINARY: &str = "claude";
const CHANNEL_CAPACITY: usize = 256;
const STDERR_TAIL_BYTES: usize = 4096;
/// How long to wait for an agent that stopped reading its prompt to exit.
const EARLY_EXIT_WAIT: Duration = Duration::from_secs(5);

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

/// Runs the `claude` CLI in print mode and streams its JSON output.
#[derive(Debug, Clone)]
pub struct ClaudeCliClient {
    binary: PathBuf,
}

impl ClaudeCliClient {
    /// Locate the binary on `PATH`.
    pub fn discover() -> Result<Self, AgentError> {
        which::which(DEFAULT_BINARY)
            .map(|binary| Self { binary })
            .map_err(|e| AgentError::BinaryNotFound(format!("{DEFAULT_BINARY}: {e}")))
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    fn build_args(options: &AgentOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            options.max_turns.to_string(),
            "--permission-mode".to_string(),
            options.permission_mode.as_str().to_string(),
        ];
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.allowed_tools.join(","));
        }
        if let Some(ref model) = options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    /// The agent stopped reading its prompt. Report how it exited instead
    /// of the pipe error, which says nothing about the cause.
    async fn early_exit(child: Child, write_error: std::io::Error) -> AgentError {
        match tokio::time::timeout(EARLY_EXIT_WAIT, child.wait_with_output()).await {
            Ok(Ok(output)) if !output.status.success() => {
                warn!(code = ?output.status.code(), "Agent exited before reading its prompt");
                AgentError::ProcessExit {
                    code: output.status.code(),
                    stderr: stderr_tail(&output.stderr),
                }
            }
            _ => AgentError::Io(write_error),
        }
    }

    /// Forward stdout lines as JSON values, then report a non-zero exit.
    async fn pump(mut child: Child, tx: mpsc::Sender<Result<serde_json::Value, AgentError>>) {
        let Some(stdout) = child.stdout.take() else {
            let _ = tx
                .send(Err(AgentError::Protocol("agent stdout was not captured".to_string())))
                .await;
            return;
        };
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                stderr_tail(&buf)
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            // A silent agent must still die when the consumer goes away.
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = tx.closed() => {
                    debug!("Agent stream receiver dropped, stopping reader");
                    return;
                }
            };
            match next {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let item = serde_json::from_str::<serde_json::Value>(line).map_err(|e| {
                        AgentError::Protocol(format!("unparsable message line ({e}): {line}"))
                    });
                    // Receiver gone means the invocation was cancelled; dropping
                    // `child` here kills the process.
                    if tx.send(item).await.is_err() {
                        debug!("Agent stream receiver dropped, stopping reader");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(AgentError::Io(e))).await;
                    return;
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = tx.closed() => return,
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let _ = tx.send(Err(AgentError::Io(e))).await;
                return;
            }
        };
        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            warn!(code = ?status.code(), "Agent process exited unsuccessfully");
            let _ = tx
                .send(Err(AgentError::ProcessExit {
                    code: status.code(),
                    stderr,
                }))
                .await;
        }
    }
}

#[async_trait]
impl AgentClient for ClaudeCliClient {
    async fn query(&self, prompt: &str, options: &AgentOptions) -> Result<MessageStream, AgentError> {
        let args = Self::build_args(options);
        debug!(
            binary = %self.binary.display(),
            working_dir = %options.working_dir.display(),
            max_turns = options.max_turns,
            "Spawning agent"
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&options.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                drop(stdin);
                return Err(Self::early_exit(child, e).await);
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(Self::pump(child, tx));

        Ok(ReceiverStream::new(rx).boxed())
    }
}
