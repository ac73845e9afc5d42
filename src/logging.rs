use crate::ir::IREvent;
use tracing::{debug, Level};

/// Initialize the tracing subscriber for the whole process.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Verbose tracing of thinking/reasoning traffic, enabled with DEBUG_THINKING=1.
pub fn debug_thinking_enabled() -> bool {
    matches!(
        std::env::var("DEBUG_THINKING").as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

fn is_thinking_model(model: &str) -> bool {
    model.contains("thinking")
}

/// Log the outbound payload for thinking models so missing thinkingConfig
/// blocks can be spotted in the request we actually send.
pub fn thinking_trace_request(payload: &[u8], model: &str) {
    if !debug_thinking_enabled() || !is_thinking_model(model) {
        return;
    }
    let payload = String::from_utf8_lossy(payload);
    if payload.contains("thinking") {
        debug!(model, "[THINKING_TRACE] request: {}", truncate(&payload, 2000));
    } else {
        debug!(
            model,
            "[THINKING_TRACE] request WITHOUT thinking config: {}",
            truncate(&payload, 2000)
        );
    }
}

/// Log raw upstream stream lines that may carry reasoning content.
pub fn thinking_trace_line(line: &[u8], model: &str) {
    if !debug_thinking_enabled() || !is_thinking_model(model) {
        return;
    }
    let line = String::from_utf8_lossy(line);
    if line.contains("thinking") || line.contains("thought") || line.contains("reasoning") {
        debug!(model, "[THINKING_TRACE] raw: {}", truncate(&line, 500));
    }
}

/// Log parsed stream events for thinking models.
pub fn thinking_trace_event(event: &IREvent, model: &str) {
    if !debug_thinking_enabled() || !is_thinking_model(model) {
        return;
    }
    match event {
        IREvent::Reasoning { text, .. } => {
            debug!(model, "[THINKING_TRACE] reasoning: {}", truncate(text, 200));
        }
        IREvent::Token { text } => {
            debug!(model, "[THINKING_TRACE] token: {}", truncate(text, 100));
        }
        IREvent::ToolCall { call, .. } => {
            debug!(model, "[THINKING_TRACE] tool call: {}", call.name);
        }
        IREvent::Finish { reason, .. } => {
            debug!(model, "[THINKING_TRACE] finish: {:?}", reason);
        }
        _ => {}
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &s[..end])
}
