// Converter Traits
//
// Frontends face the client: parse a dialect request into the IR and render
// IR responses/events back into that dialect. Backends face the upstream:
// render the IR into a provider payload and parse provider responses/stream
// lines back into the IR.

use super::types::*;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

pub type ConvertResult<T> = Result<T, GatewayError>;

/// Per-stream bookkeeping for client-dialect emission.
pub struct StreamEmitState {
    pub message_id: String,
    pub model: String,
    pub created: i64,
    /// Gemini only: frame events as SSE (`alt=sse`) instead of bare JSON.
    pub sse: bool,
    pub started: bool,
    pub finish_seen: bool,
    pub block: Option<OpenBlock>,
    pub next_block_index: usize,
    pub output_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

impl StreamEmitState {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            sse: false,
            started: false,
            finish_seen: false,
            block: None,
            next_block_index: 0,
            output_index: 0,
        }
    }
}

/// Tool call being accumulated across stream deltas.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: String,
    pub thought_signature: Option<String>,
}

/// Per-stream bookkeeping for upstream parsing.
#[derive(Default)]
pub struct StreamParseState {
    /// Last `event:` field seen (Anthropic SSE).
    pub event_name: Option<String>,
    /// Tool calls accumulating arguments, keyed by upstream index.
    pub pending_tool_calls: BTreeMap<usize, PendingToolCall>,
    /// Anthropic content block kinds by index.
    pub block_kinds: HashMap<usize, String>,
    /// Running index for providers that deliver tool calls whole (Gemini).
    pub tool_call_count: usize,
    pub saw_tool_calls: bool,
    pub usage: IRUsage,
    pub finish_reason: Option<IRFinishReason>,
    pub native_finish: Option<String>,
    /// Set once the upstream signalled the end of the stream.
    pub done: bool,
}

impl StreamParseState {
    /// Drain accumulated tool calls as complete ToolCall events, in index order.
    pub fn take_tool_calls(&mut self) -> Vec<IREvent> {
        let pending = std::mem::take(&mut self.pending_tool_calls);
        pending
            .into_iter()
            .map(|(index, tc)| IREvent::ToolCall {
                call: IRToolCall {
                    id: tc.id,
                    name: tc.name,
                    args: tc.args,
                    thought_signature: tc.thought_signature,
                },
                index,
            })
            .collect()
    }
}

/// Client-facing converter for one wire dialect.
#[async_trait]
pub trait FrontendConverter: Send + Sync {
    /// Dialect key ("openai", "openai-responses", "anthropic", "gemini").
    fn dialect(&self) -> &'static str;

    /// Parse request bytes into the IR. The dialect's streaming flag is
    /// extracted into `IRRequest.stream`.
    async fn parse_request(&self, body: &[u8]) -> ConvertResult<IRRequest>;

    /// Render a complete IR response in this dialect.
    async fn format_response(&self, response: &IRResponse) -> ConvertResult<Vec<u8>>;

    /// Render one stream event as a wire frame (SSE or bare JSON). Returns
    /// None for events this dialect does not surface.
    fn format_stream_event(
        &self,
        event: &IREvent,
        state: &mut StreamEmitState,
    ) -> ConvertResult<Option<String>>;

    /// Terminal frame after the last event (e.g. `data: [DONE]`).
    fn format_stream_end(&self, state: &mut StreamEmitState) -> Option<String>;

    /// Render an error body in this dialect's error shape.
    fn format_error_body(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "error": { "code": status, "message": message }
        }))
        .unwrap_or_default()
    }
}

/// Upstream-facing converter for one provider protocol.
#[async_trait]
pub trait BackendConverter: Send + Sync {
    /// Provider key ("openai", "anthropic", "gemini").
    fn provider(&self) -> &'static str;

    /// Render the IR as the provider's native request payload.
    async fn format_request(
        &self,
        request: &IRRequest,
        provider_model: &str,
    ) -> ConvertResult<Vec<u8>>;

    /// Parse a complete provider response into the IR.
    async fn parse_response(&self, body: &[u8], model: &str) -> ConvertResult<IRResponse>;

    /// Parse one upstream stream line into zero or more events. Lines the
    /// provider uses for framing only (SSE comments, array brackets) yield
    /// an empty vec.
    fn parse_stream_line(
        &self,
        line: &[u8],
        state: &mut StreamParseState,
    ) -> ConvertResult<Vec<IREvent>>;
}
