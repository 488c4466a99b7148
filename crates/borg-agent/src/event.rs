use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by Claude Code (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message — emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if last turn was a tool call).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

/// Sentinel substring Claude Code emits in `result.result` when the backend
/// itself errored out (rate limit, outage) despite the process exiting 0.
pub const API_ERROR_SENTINEL: &str = "API Error";

/// Everything `parse_stream` learns from one subprocess run's NDJSON output.
#[derive(Debug, Clone, Default)]
pub struct ParsedStream {
    pub output: String,
    pub session_id: Option<String>,
    /// Lines that failed to parse as a known `AgentEvent`.
    pub malformed_lines: u64,
    /// Whether a terminal `Result` record was seen at all (a killed/crashed
    /// process may exit 0 on some platforms without ever emitting one).
    pub has_terminal_result: bool,
    pub result_is_error: bool,
    pub tool_use_count: u64,
    pub tool_result_count: u64,
}

impl ParsedStream {
    /// The compound success formula (§4.E.2): a phase only succeeds if the
    /// process exited 0, a terminal result record was actually observed, and
    /// that result isn't the backend's own "API Error" sentinel — exit code
    /// alone cannot distinguish a genuine completion from a silently-eaten
    /// backend failure.
    pub fn indicates_success(&self, exit_success: bool) -> bool {
        exit_success
            && self.has_terminal_result
            && !self.result_is_error
            && !self.output.contains(API_ERROR_SENTINEL)
    }
}

/// Parse a full NDJSON stream and extract the final output text, session ID,
/// and bookkeeping needed for success classification and the event log.
pub fn parse_stream(data: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    let mut assistant_text = String::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => {
                parsed.malformed_lines += 1;
                continue;
            }
        };
        match event {
            AgentEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
            }
            AgentEvent::Assistant(e) => {
                if let Some(msg) = e.message {
                    if let Some(blocks) = msg.content {
                        for block in blocks {
                            match block {
                                ContentBlock::Text { text } => {
                                    if !assistant_text.is_empty() {
                                        assistant_text.push('\n');
                                    }
                                    assistant_text.push_str(&text);
                                }
                                ContentBlock::ToolUse { .. } => parsed.tool_use_count += 1,
                                _ => {}
                            }
                        }
                    }
                }
            }
            AgentEvent::User(e) => {
                if let Some(msg) = e.message {
                    if let Some(blocks) = msg.content {
                        for block in blocks {
                            if let ContentBlock::ToolResult { .. } = block {
                                parsed.tool_result_count += 1;
                            }
                        }
                    }
                }
            }
            AgentEvent::Result(e) => {
                parsed.has_terminal_result = true;
                parsed.result_is_error = e.is_error.unwrap_or(false);
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
                if let Some(text) = e.result {
                    parsed.output = text;
                }
            }
            AgentEvent::Unknown => {}
        }
    }

    // Fall back to collected assistant text if the result record was empty.
    if parsed.output.is_empty() && !assistant_text.is_empty() {
        parsed.output = assistant_text;
    }

    parsed
}
