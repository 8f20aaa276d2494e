use std::io::{BufRead, BufReader, PipeReader};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::guard::{RunPermit, RunState};
use super::target::RunTarget;
use crate::core::config::TelegramConfig;

/// Builds the external check-in command for a target. The engine only sees
/// its merged output lines and exit status.
pub trait SignerInvoker: Send + Sync {
    fn command(&self, target: &RunTarget) -> Command;
}

/// `<bin> --workdir W --session_dir S --account A run-once TASK`, with the
/// Telegram API credentials in `TG_API_ID` / `TG_API_HASH`.
pub struct CliInvoker {
    program: String,
    workdir: PathBuf,
    session_dir: PathBuf,
    telegram: TelegramConfig,
}

impl CliInvoker {
    pub fn new(
        program: impl Into<String>,
        workdir: PathBuf,
        session_dir: PathBuf,
        telegram: TelegramConfig,
    ) -> Self {
        Self {
            program: program.into(),
            workdir,
            session_dir,
            telegram,
        }
    }
}

impl SignerInvoker for CliInvoker {
    fn command(&self, target: &RunTarget) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--workdir")
            .arg(&self.workdir)
            .arg("--session_dir")
            .arg(&self.session_dir)
            .arg("--account")
            .arg(target.account())
            .arg("run-once")
            .arg(target.task_name())
            .env("TG_API_ID", &self.telegram.api_id)
            .env("TG_API_HASH", &self.telegram.api_hash);
        cmd
    }
}

/// Output kept for history per run. The live buffer still sees every line.
const MAX_OUTPUT_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub output: String,
    /// Empty on success.
    pub message: String,
}

impl RunOutcome {
    fn failed(message: String, output: String) -> Self {
        Self {
            state: RunState::Failed,
            output,
            message,
        }
    }
}

pub struct ProcessRunner {
    invoker: Arc<dyn SignerInvoker>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(invoker: Arc<dyn SignerInvoker>, timeout: Duration) -> Self {
        Self { invoker, timeout }
    }

    /// Runs `target` to completion or timeout, feeding every non-empty output
    /// line into `permit`'s live buffer. Stdout and stderr share one pipe so
    /// lines keep the order the signer wrote them in. The returned output is
    /// capped at [`MAX_OUTPUT_BYTES`].
    pub async fn run(&self, target: &RunTarget, permit: &RunPermit) -> RunOutcome {
        let spawned = std::io::pipe().and_then(|(reader, writer)| {
            let mut cmd = self.invoker.command(target);
            cmd.stdin(Stdio::null())
                .stderr(writer.try_clone()?)
                .stdout(writer)
                .kill_on_drop(true);
            // `cmd` holds the parent's copies of the write end; they close
            // when it drops here so the reader sees EOF once the child exits.
            Ok((cmd.spawn()?, reader))
        });
        let (mut child, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = format!("failed to start signer: {e}");
                warn!("{} for {}", message, target);
                permit.push_line(message.clone());
                return RunOutcome::failed(message, String::new());
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::task::spawn_blocking(move || forward_lines(reader, tx));

        let mut output = String::new();
        let mut truncated = false;
        let collect = async {
            while let Some(line) = rx.recv().await {
                if output.len() + line.len() < MAX_OUTPUT_BYTES {
                    output.push_str(&line);
                    output.push('\n');
                } else if !truncated {
                    output.push_str("[output truncated]\n");
                    truncated = true;
                }
                permit.push_line(line);
            }
            child.wait().await
        };
        let waited = tokio::time::timeout(self.timeout, collect).await;

        match waited {
            Ok(Ok(status)) if status.success() => RunOutcome {
                state: RunState::Succeeded,
                output,
                message: String::new(),
            },
            Ok(Ok(status)) => {
                let message = match status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                RunOutcome::failed(message, output)
            }
            Ok(Err(e)) => RunOutcome::failed(format!("failed to wait for signer: {e}"), output),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    debug!("Kill after timeout failed for {}: {}", target, e);
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                let message = format!("timed out after {}s", self.timeout.as_secs());
                permit.push_line(message.clone());
                RunOutcome {
                    state: RunState::TimedOut,
                    output,
                    message,
                }
            }
        }
    }
}

/// Reads lines until EOF, dropping blank ones. Invalid UTF-8 is replaced
/// rather than ending the stream. Runs on a blocking thread.
fn forward_lines(reader: PipeReader, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                if tx.blocking_send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}
