//! Turn Executor (C5, spec §4.5).
//!
//! Wraps a single invocation of the external coding-assistant CLI.
//! Generalizes the teacher's `orchestrator::runner::ClaudeRunner` (spawn,
//! stream stdout lines as `StreamEvent` JSON, watch for a `<promise>` tag)
//! into: process-group spawn, three timeout tiers plus heartbeat, typed
//! activity transitions, and schema-constrained structured output where a
//! missing/malformed schema match is a hard error rather than a silent
//! fallback to free text.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use orc_common::error::{Classify, ErrorKind};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Activity states emitted as the turn progresses (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Idle,
    WaitingApi,
    Streaming,
    RunningTool,
    Processing,
    SpecAnalyzing,
    SpecWriting,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("failed to spawn CLI process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("turn exceeded turn_max ({0:?})")]
    TurnTimeout(Duration),

    #[error("turn exceeded phase_max ({0:?})")]
    PhaseTimeout(Duration),

    #[error("stream line failed to parse as a structured frame: {0}")]
    ParseFailure(String),

    #[error("structured output missing or did not match the requested schema")]
    SchemaMismatch,

    #[error("turn cancelled")]
    Cancelled,

    #[error("CLI exited with non-zero status {0}")]
    NonZeroExit(i32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for TurnError {
    fn kind(&self) -> ErrorKind {
        match self {
            TurnError::TurnTimeout(_) | TurnError::PhaseTimeout(_) => ErrorKind::Timeout,
            TurnError::Cancelled => ErrorKind::Cancelled,
            TurnError::ParseFailure(_) | TurnError::SchemaMismatch => ErrorKind::Parse,
            TurnError::SpawnFailed(_) | TurnError::NonZeroExit(_) | TurnError::Io(_) => {
                ErrorKind::External
            }
        }
    }
}

/// Streaming frame shapes emitted by the CLI's `stream-json` output format.
/// Narrower than the teacher's `StreamEvent` — only what the Turn Executor
/// itself needs to act on; tool-use/text content is forwarded as a
/// `transcript` event by the Phase Runner, not interpreted here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamFrame {
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "system")]
    System { #[serde(default)] subtype: String },
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse,
    #[serde(rename = "text")]
    Text,
}

/// Timeouts configurable per spec §5.
#[derive(Debug, Clone)]
pub struct TurnTimeouts {
    pub turn_max: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        TurnTimeouts {
            turn_max: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Model selection is fixed at construction; no per-call override (spec
/// §4.5, §5 "LLM client: stateless per call; model is fixed at client
/// construction").
#[derive(Clone)]
pub struct TurnExecutor {
    cli_path: std::path::PathBuf,
    model: String,
    timeouts: TurnTimeouts,
}

/// Observer for activity/heartbeat transitions during a turn. The Turn
/// Executor only knows how to call this; whoever constructs the executor
/// wires it to the Event Bus (spec §4.2's "Phase Runner MUST be constructed
/// with a SessionBroadcaster reference" generalizes to: whatever sink you
/// pass here is the only thing that makes UI counters move).
pub trait ActivitySink: Send + Sync {
    fn on_activity(&self, state: ActivityState);
    fn on_heartbeat(&self);
    fn on_warning(&self, message: &str);
}

pub struct NullSink;
impl ActivitySink for NullSink {
    fn on_activity(&self, _state: ActivityState) {}
    fn on_heartbeat(&self) {}
    fn on_warning(&self, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub raw_output: String,
    /// Populated only when a schema was requested and matched.
    pub structured: Option<Value>,
    /// `is_error` as reported on the CLI's `result` stream frame, surfaced
    /// so the Gate Evaluator's `no_errors` auto-predicate can actually see it.
    pub is_error: bool,
}

impl TurnExecutor {
    pub fn new(cli_path: impl Into<std::path::PathBuf>, model: impl Into<String>, timeouts: TurnTimeouts) -> Self {
        TurnExecutor {
            cli_path: cli_path.into(),
            model: model.into(),
            timeouts,
        }
    }

    /// Runs a single turn. `ultrathink`, when requested, is prefixed to the
    /// user message, never to a system prompt (spec §4.5 enforcement).
    /// When `require_schema` is set, the final structured frame is
    /// REQUIRED; absence or shape mismatch is a hard [`TurnError::SchemaMismatch`],
    /// never a silent fallback to the raw text.
    pub async fn run_turn(
        &self,
        cwd: &Path,
        user_message: &str,
        ultrathink: bool,
        require_schema: bool,
        cancel: &CancellationToken,
        sink: &dyn ActivitySink,
    ) -> Result<TurnOutcome, TurnError> {
        let prompt = if ultrathink {
            format!("ultrathink\n\n{user_message}")
        } else {
            user_message.to_string()
        };

        let mut command = Command::new(&self.cli_path);
        command
            .arg("--model")
            .arg(&self.model)
            .arg("--output-format")
            .arg("stream-json")
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Best-effort: put the child in its own process group so any
            // descendants it spawns die together with it on cancellation.
            unsafe {
                command.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(TurnError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        sink.on_activity(ActivityState::WaitingApi);

        let mut raw_output = String::new();
        let mut structured: Option<Value> = None;
        let mut saw_error = false;

        let deadline = Instant::now() + self.timeouts.turn_max;
        let mut heartbeat = tokio::time::interval(self.timeouts.heartbeat_interval);

        let result: Result<(), TurnError> = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break Err(TurnError::Cancelled);
                }

                _ = tokio::time::sleep_until(deadline) => {
                    break Err(TurnError::TurnTimeout(self.timeouts.turn_max));
                }

                _ = heartbeat.tick() => {
                    sink.on_heartbeat();
                    continue;
                }

                line = tokio::time::timeout(self.timeouts.idle_timeout, lines.next_line()) => {
                    let line = match line {
                        Ok(inner) => inner?,
                        Err(_) => {
                            sink.on_warning("idle_timeout exceeded: no streaming activity");
                            continue;
                        }
                    };
                    let Some(line) = line else { break Ok(()); };
                    if line.trim().is_empty() {
                        continue;
                    }
                    raw_output.push_str(&line);
                    raw_output.push('\n');

                    match serde_json::from_str::<StreamFrame>(&line) {
                        Ok(StreamFrame::Assistant { message }) => {
                            let has_tool_use = message
                                .content
                                .iter()
                                .any(|b| matches!(b, ContentBlock::ToolUse));
                            sink.on_activity(if has_tool_use {
                                ActivityState::RunningTool
                            } else {
                                ActivityState::Streaming
                            });
                        }
                        Ok(StreamFrame::System { .. }) => {
                            sink.on_activity(ActivityState::Processing);
                        }
                        Ok(StreamFrame::Result { result, is_error }) => {
                            saw_error = is_error;
                            structured = result;
                            break Ok(());
                        }
                        Err(e) => {
                            break Err(TurnError::ParseFailure(e.to_string()));
                        }
                    }
                }
            }
        };

        // Cancellation/timeout kill the whole process group, best-effort.
        if result.is_err() {
            let _ = child.start_kill();
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        result?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(TurnError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        if saw_error {
            warn!("CLI reported is_error on result frame");
        }

        if require_schema && structured.is_none() {
            return Err(TurnError::SchemaMismatch);
        }

        sink.on_activity(ActivityState::Idle);
        Ok(TurnOutcome { raw_output, structured, is_error: saw_error })
    }
}
