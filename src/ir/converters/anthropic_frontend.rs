// Anthropic Messages frontend.

use crate::error::GatewayError;
use crate::ir::response::{to_claude_tool_id, ResponseBuilder};
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::anthropic::*;
use async_trait::async_trait;
use serde_json::json;

pub struct AnthropicFrontend;

#[async_trait]
impl FrontendConverter for AnthropicFrontend {
    fn dialect(&self) -> &'static str {
        "anthropic"
    }

    async fn parse_request(&self, body: &[u8]) -> ConvertResult<IRRequest> {
        let request: MessagesRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidRequest(format!("messages body: {e}")))?;

        let mut messages = Vec::new();
        if let Some(system) = request.system {
            let text = match system {
                SystemPrompt::Text(text) => text,
                SystemPrompt::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            if !text.is_empty() {
                messages.push(IRMessage::text(IRRole::System, text));
            }
        }
        for msg in request.messages {
            messages.push(parse_message(msg)?);
        }

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|t| IRTool {
                name: t.name,
                description: t.description.unwrap_or_default(),
                parameters: t.input_schema,
            })
            .collect();

        let tool_choice = request.tool_choice.map(|tc| match tc {
            ToolChoice::Auto => IRToolChoice::Auto,
            ToolChoice::Any => IRToolChoice::Required,
            ToolChoice::Tool { name } => IRToolChoice::Specific { name },
            ToolChoice::None => IRToolChoice::None,
        });

        let thinking = request.thinking.map(|t| IRThinkingConfig {
            include_thoughts: t.kind == "enabled",
            budget: t.budget_tokens,
            summary: None,
            effort: None,
        });

        let mut metadata = std::collections::HashMap::new();
        if let Some(meta) = request.metadata {
            metadata.insert(META_CLAUDE_METADATA.to_string(), meta);
        }

        Ok(IRRequest {
            model: request.model,
            messages,
            tools,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_tokens: request.max_tokens,
            stop_sequences: request.stop_sequences.unwrap_or_default(),
            thinking,
            stream: request.stream.unwrap_or(false),
            tool_choice,
            metadata,
            ..Default::default()
        })
    }

    async fn format_response(&self, response: &IRResponse) -> ConvertResult<Vec<u8>> {
        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| GatewayError::Translation("response has no candidates".to_string()))?;

        let builder = ResponseBuilder::new(&candidate.message);
        let body = json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "content": builder.claude_content(),
            "model": response.model,
            "stop_reason": stop_reason_str(candidate.finish_reason),
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.prompt_tokens,
                "output_tokens": response.usage.completion_tokens,
            }
        });

        Ok(serde_json::to_vec(&body)?)
    }

    fn format_stream_event(
        &self,
        event: &IREvent,
        state: &mut StreamEmitState,
    ) -> ConvertResult<Option<String>> {
        let mut out = String::new();

        if !state.started {
            state.started = true;
            let start = json!({
                "type": "message_start",
                "message": {
                    "id": state.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": state.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            });
            push_frame(&mut out, "message_start", &start);
        }

        match event {
            IREvent::Token { text } => {
                ensure_block(&mut out, state, OpenBlock::Text);
                let delta = json!({
                    "type": "content_block_delta",
                    "index": state.next_block_index,
                    "delta": { "type": "text_delta", "text": text }
                });
                push_frame(&mut out, "content_block_delta", &delta);
            }
            IREvent::Reasoning {
                text,
                thought_signature,
            } => {
                ensure_block(&mut out, state, OpenBlock::Thinking);
                if !text.is_empty() {
                    let delta = json!({
                        "type": "content_block_delta",
                        "index": state.next_block_index,
                        "delta": { "type": "thinking_delta", "thinking": text }
                    });
                    push_frame(&mut out, "content_block_delta", &delta);
                }
                if let Some(sig) = thought_signature {
                    let delta = json!({
                        "type": "content_block_delta",
                        "index": state.next_block_index,
                        "delta": { "type": "signature_delta", "signature": sig }
                    });
                    push_frame(&mut out, "content_block_delta", &delta);
                }
            }
            IREvent::ReasoningSummary { text } => {
                ensure_block(&mut out, state, OpenBlock::Thinking);
                let delta = json!({
                    "type": "content_block_delta",
                    "index": state.next_block_index,
                    "delta": { "type": "thinking_delta", "thinking": text }
                });
                push_frame(&mut out, "content_block_delta", &delta);
            }
            IREvent::ToolCall { call, .. } => {
                close_block(&mut out, state);
                let start = json!({
                    "type": "content_block_start",
                    "index": state.next_block_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": to_claude_tool_id(&call.id),
                        "name": call.name,
                        "input": {}
                    }
                });
                push_frame(&mut out, "content_block_start", &start);
                if !call.args.is_empty() {
                    let delta = json!({
                        "type": "content_block_delta",
                        "index": state.next_block_index,
                        "delta": { "type": "input_json_delta", "partial_json": call.args }
                    });
                    push_frame(&mut out, "content_block_delta", &delta);
                }
                let stop = json!({
                    "type": "content_block_stop",
                    "index": state.next_block_index,
                });
                push_frame(&mut out, "content_block_stop", &stop);
                state.next_block_index += 1;
            }
            IREvent::ToolCallDelta { .. } => return Ok(None),
            IREvent::Finish { reason, usage } => {
                close_block(&mut out, state);
                state.finish_seen = true;
                let delta = json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": stop_reason_str(*reason),
                        "stop_sequence": null,
                    },
                    "usage": {
                        "output_tokens": usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
                    }
                });
                push_frame(&mut out, "message_delta", &delta);
                push_frame(&mut out, "message_stop", &json!({ "type": "message_stop" }));
            }
            IREvent::Error { message, .. } => {
                let err = json!({
                    "type": "error",
                    "error": { "type": "api_error", "message": message }
                });
                push_frame(&mut out, "error", &err);
            }
            IREvent::Image { .. } | IREvent::CodeExecution { .. } => return Ok(None),
        }

        Ok(Some(out))
    }

    fn format_stream_end(&self, _state: &mut StreamEmitState) -> Option<String> {
        Some("data: [DONE]\n\n".to_string())
    }

    fn format_error_body(&self, _status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "error",
            "error": { "type": "api_error", "message": message }
        }))
        .unwrap_or_default()
    }
}

fn push_frame(out: &mut String, event: &str, data: &serde_json::Value) {
    out.push_str(&format!("event: {event}\ndata: {data}\n\n"));
}

/// Open a block of the given kind, closing the current one if it differs.
fn ensure_block(out: &mut String, state: &mut StreamEmitState, kind: OpenBlock) {
    if state.block == Some(kind) {
        return;
    }
    close_block(out, state);
    let content_block = match kind {
        OpenBlock::Text => json!({ "type": "text", "text": "" }),
        OpenBlock::Thinking => json!({ "type": "thinking", "thinking": "" }),
        OpenBlock::ToolUse => json!({ "type": "tool_use" }),
    };
    let start = json!({
        "type": "content_block_start",
        "index": state.next_block_index,
        "content_block": content_block,
    });
    push_frame(out, "content_block_start", &start);
    state.block = Some(kind);
}

fn close_block(out: &mut String, state: &mut StreamEmitState) {
    if state.block.take().is_some() {
        let stop = json!({
            "type": "content_block_stop",
            "index": state.next_block_index,
        });
        push_frame(out, "content_block_stop", &stop);
        state.next_block_index += 1;
    }
}

fn parse_message(msg: Message) -> ConvertResult<IRMessage> {
    let role = match msg.role.as_str() {
        "user" => IRRole::User,
        "assistant" => IRRole::Assistant,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported message role: {other}"
            )))
        }
    };

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();

    match msg.content {
        MessageContent::Text(text) => content.push(IRContent::Text { text }),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => content.push(IRContent::Text { text }),
                    ContentBlock::Image { source } => content.push(IRContent::Image {
                        image: IRImage {
                            mime_type: source.media_type.unwrap_or_default(),
                            data: source.data.unwrap_or_default(),
                            url: source.url,
                        },
                    }),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(IRToolCall {
                        id,
                        name,
                        args: input.to_string(),
                        thought_signature: None,
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content: result,
                        ..
                    } => {
                        let (text, images) = flatten_tool_result(result);
                        content.push(IRContent::ToolResult {
                            tool_call_id: tool_use_id,
                            result: text,
                            images,
                        });
                    }
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    } => content.push(IRContent::Reasoning {
                        text: thinking,
                        thought_signature: signature,
                    }),
                    ContentBlock::RedactedThinking { data } => {
                        content.push(IRContent::Reasoning {
                            text: String::new(),
                            thought_signature: Some(data),
                        })
                    }
                }
            }
        }
    }

    Ok(IRMessage {
        role,
        content,
        tool_calls,
    })
}

fn flatten_tool_result(content: Option<ToolResultContent>) -> (String, Vec<IRImage>) {
    match content {
        Some(ToolResultContent::Text(text)) => (text, Vec::new()),
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    ContentBlock::Image { source } => images.push(IRImage {
                        mime_type: source.media_type.unwrap_or_default(),
                        data: source.data.unwrap_or_default(),
                        url: source.url,
                    }),
                    _ => {}
                }
            }
            (texts.join("\n"), images)
        }
        None => (String::new(), Vec::new()),
    }
}

fn stop_reason_str(reason: IRFinishReason) -> &'static str {
    match reason {
        IRFinishReason::Stop => "end_turn",
        IRFinishReason::Length => "max_tokens",
        IRFinishReason::ToolCalls => "tool_use",
        IRFinishReason::ContentFilter => "refusal",
        IRFinishReason::Error | IRFinishReason::Unknown => "end_turn",
    }
}
