// Response building utilities shared by the from-IR emitters.

use super::types::*;
use serde_json::{json, Value};

/// Convert a tool call ID to the Claude `toolu_…` form. A leading `call_` is
/// replaced; an already-prefixed ID passes through; anything else gets the
/// prefix prepended.
pub fn to_claude_tool_id(id: &str) -> String {
    if id.starts_with("toolu_") {
        return id.to_string();
    }
    if let Some(rest) = id.strip_prefix("call_") {
        return format!("toolu_{rest}");
    }
    format!("toolu_{id}")
}

/// Inverse of [`to_claude_tool_id`]: convert to the OpenAI `call_…` form.
pub fn to_openai_tool_id(id: &str) -> String {
    if id.starts_with("call_") {
        return id.to_string();
    }
    if let Some(rest) = id.strip_prefix("toolu_") {
        return format!("call_{rest}");
    }
    format!("call_{id}")
}

/// Parse tool call arguments as a JSON object, defaulting to `{}` for empty
/// or invalid input.
pub fn parse_tool_args(args: &str) -> Value {
    if args.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(args).unwrap_or_else(|_| json!({}))
}

/// Helps construct provider-specific response content from an IR candidate.
pub struct ResponseBuilder<'a> {
    message: &'a IRMessage,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(message: &'a IRMessage) -> Self {
        Self { message }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }

    /// `tool_calls` if the message carries tool calls, else `stop`.
    pub fn finish_reason(&self) -> IRFinishReason {
        if self.has_tool_calls() {
            IRFinishReason::ToolCalls
        } else {
            IRFinishReason::Stop
        }
    }

    /// OpenAI-format tool call array, IDs normalised to `call_…`.
    pub fn openai_tool_calls(&self) -> Vec<Value> {
        self.message
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": to_openai_tool_id(&tc.id),
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": if tc.args.is_empty() { "{}" } else { tc.args.as_str() },
                    }
                })
            })
            .collect()
    }

    /// Claude content array: thinking blocks first, then text, then tool_use.
    pub fn claude_content(&self) -> Vec<Value> {
        let mut parts = Vec::new();

        for part in &self.message.content {
            if let IRContent::Reasoning {
                text,
                thought_signature,
            } = part
            {
                if !text.is_empty() {
                    let mut block = json!({ "type": "thinking", "thinking": text });
                    if let Some(sig) = thought_signature {
                        block["signature"] = json!(sig);
                    }
                    parts.push(block);
                }
            }
        }

        for part in &self.message.content {
            if let IRContent::Text { text } = part {
                if !text.is_empty() {
                    parts.push(json!({ "type": "text", "text": text }));
                }
            }
        }

        for tc in &self.message.tool_calls {
            parts.push(json!({
                "type": "tool_use",
                "id": to_claude_tool_id(&tc.id),
                "name": tc.name,
                "input": parse_tool_args(&tc.args),
            }));
        }

        parts
    }

    /// Gemini parts array, preserving the original content order.
    pub fn gemini_parts(&self) -> Vec<Value> {
        let mut parts = Vec::new();

        for part in &self.message.content {
            match part {
                IRContent::Reasoning {
                    text,
                    thought_signature,
                } => {
                    if !text.is_empty() {
                        let mut p = json!({ "text": text, "thought": true });
                        if let Some(sig) = thought_signature {
                            p["thoughtSignature"] = json!(sig);
                        }
                        parts.push(p);
                    }
                }
                IRContent::Text { text } => {
                    if !text.is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                }
                IRContent::Image { image } => {
                    if !image.data.is_empty() {
                        parts.push(json!({
                            "inlineData": {
                                "mimeType": image.mime_type,
                                "data": image.data,
                            }
                        }));
                    }
                }
                IRContent::ExecutableCode { language, code } => {
                    parts.push(json!({
                        "executableCode": { "language": language, "code": code }
                    }));
                }
                IRContent::CodeResult { outcome, output } => {
                    parts.push(json!({
                        "codeExecutionResult": { "outcome": outcome, "output": output }
                    }));
                }
                IRContent::File { .. } | IRContent::ToolResult { .. } => {}
            }
        }

        for tc in &self.message.tool_calls {
            parts.push(json!({
                "functionCall": {
                    "name": tc.name,
                    "args": parse_tool_args(&tc.args),
                }
            }));
        }

        parts
    }
}
