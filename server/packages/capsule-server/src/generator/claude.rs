//! Drives the `claude` CLI in print mode and translates its `stream-json`
//! output into relay callbacks.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use capsule_error::CapsuleError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{CodeGenerator, GenerationRequest, GenerationResult, TokenUsage};
use crate::relay::GenerationCallbacks;

const STDERR_TAIL_LINES: usize = 20;
const FILE_TOOLS: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];

#[derive(Debug, Clone)]
pub struct ClaudeCliGenerator {
    program: PathBuf,
    working_dir: Option<PathBuf>,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl ClaudeCliGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            working_dir: None,
            model: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self, request: &GenerationRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-p")
            .arg(&request.prompt)
            .args(["--output-format", "stream-json", "--verbose"]);
        if let Some(conversation_id) = &request.conversation_id {
            command.arg("--resume").arg(conversation_id);
        }
        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }
        command.args(&self.extra_args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .env("CAPSULE_SANDBOX_ID", &request.sandbox.sandbox_id)
            .env("CAPSULE_PREVIEW_URL", &request.preview_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CodeGenerator for ClaudeCliGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        callbacks: GenerationCallbacks,
    ) -> Result<(), CapsuleError> {
        let started = Instant::now();
        let mut child = self.command(&request).spawn().map_err(|err| {
            tracing::error!(program = ?self.program, error = %err, "failed to spawn claude");
            CapsuleError::generation_failed(format!(
                "failed to start {}: {err}",
                self.program.display()
            ))
        })?;
        tracing::info!(
            pid = child.id().unwrap_or(0),
            resume = request.conversation_id.is_some(),
            "claude process spawned"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapsuleError::generation_failed("failed to capture claude stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CapsuleError::generation_failed("failed to capture claude stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("claude stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut files_changed: Vec<String> = Vec::new();
        let mut session_id: Option<String> = None;
        let mut saw_result = false;
        let mut lines = BufReader::new(stdout).lines();
        let mut line_count: u64 = 0;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| CapsuleError::generation_failed(format!("claude stdout: {err}")))?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            line_count += 1;

            let payload = match serde_json::from_str::<Value>(trimmed) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, line_number = line_count, "claude stdout: invalid JSON");
                    continue;
                }
            };

            for event in parse_event(&payload) {
                match event {
                    ClaudeEvent::Init { session_id: id } => {
                        tracing::debug!(session_id = %id, "claude session initialized");
                        session_id = Some(id);
                    }
                    ClaudeEvent::Text(text) => callbacks.on_message(text).await,
                    ClaudeEvent::ToolUse { name, file_path } => {
                        if let Some(path) = &file_path {
                            if FILE_TOOLS.contains(&name.as_str()) && !files_changed.contains(path) {
                                files_changed.push(path.clone());
                            }
                        }
                        callbacks.on_message(tool_message(&name, file_path.as_deref())).await;
                    }
                    ClaudeEvent::Result(result) => {
                        saw_result = true;
                        if result.is_error {
                            let message = result
                                .result
                                .or(result.subtype)
                                .unwrap_or_else(|| "Claude Code reported an error".to_string());
                            callbacks.on_error(message).await;
                        } else {
                            callbacks
                                .on_complete(GenerationResult {
                                    session_id: result.session_id.or_else(|| session_id.clone()),
                                    result: result.result,
                                    usage: result.usage,
                                    files_changed: files_changed.clone(),
                                    num_turns: result.num_turns,
                                    cost_usd: result.cost_usd,
                                })
                                .await;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| CapsuleError::generation_failed(format!("claude wait: {err}")))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        tracing::info!(
            success = status.success(),
            code = status.code(),
            lines = line_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "claude process exited"
        );

        if saw_result {
            return Ok(());
        }
        let mut message = format!("claude exited ({status}) without a result");
        if !stderr_tail.is_empty() {
            message.push_str(": ");
            message.push_str(&stderr_tail);
        }
        Err(CapsuleError::generation_failed(message))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClaudeEvent {
    Init {
        session_id: String,
    },
    Text(String),
    ToolUse {
        name: String,
        file_path: Option<String>,
    },
    Result(ResultEvent),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResultEvent {
    pub is_error: bool,
    pub subtype: Option<String>,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub num_turns: Option<u64>,
    pub cost_usd: Option<f64>,
}

pub(crate) fn parse_event(event: &Value) -> Vec<ClaudeEvent> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" => event
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|_| event.get("subtype").and_then(Value::as_str) == Some("init"))
            .map(|id| {
                vec![ClaudeEvent::Init {
                    session_id: id.to_string(),
                }]
            })
            .unwrap_or_default(),
        "assistant" => assistant_events(event),
        "result" => vec![ClaudeEvent::Result(result_event(event))],
        _ => Vec::new(),
    }
}

fn assistant_events(event: &Value) -> Vec<ClaudeEvent> {
    let content = event
        .get("message")
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_array);
    let Some(content) = content else {
        return Vec::new();
    };

    content
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block
                .get("text")
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
                .map(|text| ClaudeEvent::Text(text.to_string())),
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str)?;
                let input = block.get("input");
                let file_path = input
                    .and_then(|input| {
                        input
                            .get("file_path")
                            .or_else(|| input.get("notebook_path"))
                    })
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                Some(ClaudeEvent::ToolUse {
                    name: name.to_string(),
                    file_path,
                })
            }
            _ => None,
        })
        .collect()
}

fn result_event(event: &Value) -> ResultEvent {
    let string = |key: &str| event.get(key).and_then(Value::as_str).map(ToString::to_string);
    let usage = event.get("usage").map(|usage| TokenUsage {
        input_tokens: usage
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    });
    ResultEvent {
        is_error: event
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        subtype: string("subtype"),
        result: string("result"),
        session_id: string("session_id"),
        usage,
        num_turns: event.get("num_turns").and_then(Value::as_u64),
        cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
    }
}

fn tool_message(name: &str, file_path: Option<&str>) -> String {
    match file_path {
        Some(path) => format!("Using {name}: {path}"),
        None => format!("Using {name}"),
    }
}
