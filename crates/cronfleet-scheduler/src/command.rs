//! Shell command as a job body.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cronfleet_core::JobId;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::{JobBody, JobContext};

/// Characters of stderr kept in the failure reason.
const STDERR_TAIL_CHARS: usize = 500;
/// How long to wait for output pipes after the child exited. A background
/// grandchild can hold them open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runs `sh -c <command>` with the job's identity in its environment.
///
/// Every stdout and stderr line is forwarded to the log under the job's id.
/// The child is killed as soon as the job context is invalidated, or when the
/// executor drops the body. Whatever the process already did stays done.
#[derive(Debug, Clone)]
pub struct CommandJob {
    command: String,
    args: Vec<String>,
}

impl CommandJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments appended to the command, each passed through intact.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn shell_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        if self.args.is_empty() {
            cmd.arg("-c").arg(&self.command);
        } else {
            // Positional parameters keep each argument a single word.
            cmd.arg("-c")
                .arg(format!("{} \"$@\"", self.command))
                .arg("cronfleet")
                .args(&self.args);
        }
        cmd
    }
}

#[async_trait]
impl JobBody for CommandJob {
    async fn run(&self, ctx: JobContext) -> std::result::Result<(), String> {
        debug!(job_id = %ctx.job_id(), command = %self.command, args = ?self.args, "spawning job command");
        let mut child = self
            .shell_command()
            .env("CRONFLEET_JOB_ID", ctx.job_id().as_str())
            .env("CRONFLEET_RUNNER_ID", ctx.runner_id().as_str())
            .env("CRONFLEET_FENCING_TOKEN", ctx.fencing_token().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn failed: {e}"))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(ctx.job_id().clone(), out, Stream::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_lines(ctx.job_id().clone(), err, Stream::Stderr));

        // Returning early drops the child, which kills it.
        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| format!("wait failed: {e}"))?,
            _ = ctx.invalidated() => return Err("cancelled: job context invalidated".to_string()),
        };

        if let Some(task) = stdout {
            collect(task).await;
        }
        let stderr = match stderr {
            Some(task) => collect(task).await,
            None => String::new(),
        };

        if status.success() {
            return Ok(());
        }
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = stderr_tail(stderr.trim_end(), STDERR_TAIL_CHARS);
        if tail.is_empty() {
            Err(format!("exit {code}"))
        } else {
            Err(format!("exit {code}: {tail}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Log every line of `pipe`. Stderr lines are also kept for the failure reason.
fn forward_lines<R>(job_id: JobId, pipe: R, stream: Stream) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = String::new();
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    Stream::Stdout => info!(%job_id, "{line}"),
                    Stream::Stderr => {
                        warn!(%job_id, "{line}");
                        kept.push_str(&line);
                        kept.push('\n');
                        if kept.len() > STDERR_TAIL_CHARS * 8 {
                            let cut = kept.len() - STDERR_TAIL_CHARS * 4;
                            let cut = (cut..kept.len())
                                .find(|i| kept.is_char_boundary(*i))
                                .unwrap_or(0);
                            kept.drain(..cut);
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(%job_id, ?stream, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
        kept
    })
}

async fn collect(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

/// Last `max_chars` characters of `s`, split on a char boundary.
fn stderr_tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(stderr_tail("short", 10), "short");
        assert_eq!(stderr_tail("abcdefgh", 3), "fgh");
        assert_eq!(stderr_tail("ééééé", 2), "éé");
    }
}
