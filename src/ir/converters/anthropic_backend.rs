// Anthropic-protocol backend.

use crate::error::GatewayError;
use crate::ir::response::{parse_tool_args, to_claude_tool_id};
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::anthropic::*;
use async_trait::async_trait;

pub struct AnthropicBackend;

#[async_trait]
impl BackendConverter for AnthropicBackend {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    async fn format_request(
        &self,
        request: &IRRequest,
        provider_model: &str,
    ) -> ConvertResult<Vec<u8>> {
        let mut system_parts = Vec::new();
        if let Some(instructions) = &request.instructions {
            system_parts.push(instructions.clone());
        }
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                IRRole::System => {
                    let text = msg.joined_text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                IRRole::User => messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(user_blocks(msg)),
                }),
                IRRole::Assistant => messages.push(Message {
                    role: "assistant".to_string(),
                    content: MessageContent::Blocks(assistant_blocks(msg)),
                }),
                // Anthropic carries tool results as user-role blocks.
                IRRole::Tool => messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(user_blocks(msg)),
                }),
            }
        }

        let tools: Vec<Tool> = request
            .tools
            .iter()
            .map(|t| Tool {
                name: t.name.clone(),
                description: if t.description.is_empty() {
                    None
                } else {
                    Some(t.description.clone())
                },
                input_schema: t.parameters.clone(),
            })
            .collect();

        let tool_choice = request.tool_choice.as_ref().map(|tc| match tc {
            IRToolChoice::Auto => ToolChoice::Auto,
            IRToolChoice::Required => ToolChoice::Any,
            IRToolChoice::None => ToolChoice::None,
            IRToolChoice::Specific { name } => ToolChoice::Tool { name: name.clone() },
        });

        let thinking = request.thinking.as_ref().and_then(|t| {
            let budget = t.budget?;
            if budget <= 0 {
                return None;
            }
            Some(ThinkingParam {
                kind: "enabled".to_string(),
                budget_tokens: Some(budget),
            })
        });

        let out = MessagesRequest {
            model: provider_model.to_string(),
            max_tokens: Some(request.max_tokens.unwrap_or(CLAUDE_DEFAULT_MAX_TOKENS)),
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(SystemPrompt::Text(system_parts.join("\n\n")))
            },
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stream: request.stream.then_some(true),
            stop_sequences: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(request.stop_sequences.clone())
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
            thinking,
            metadata: request.metadata.get(META_CLAUDE_METADATA).cloned(),
        };

        Ok(serde_json::to_vec(&out)?)
    }

    async fn parse_response(&self, body: &[u8], model: &str) -> ConvertResult<IRResponse> {
        let response: MessagesResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Translation(format!("anthropic response: {e}")))?;

        let message = message_from_blocks(&response.content);
        let finish_reason = parse_stop_reason(response.stop_reason.as_deref(), &message);

        Ok(IRResponse {
            id: response.id,
            model: model.to_string(),
            candidates: vec![IRCandidate {
                index: 0,
                message,
                finish_reason,
            }],
            usage: usage_to_ir(&response.usage),
            meta: ResponseMeta {
                response_id: None,
                create_time: None,
                native_finish_reason: response.stop_reason,
            },
        })
    }

    fn parse_stream_line(
        &self,
        line: &[u8],
        state: &mut StreamParseState,
    ) -> ConvertResult<Vec<IREvent>> {
        let line = std::str::from_utf8(line)
            .map_err(|e| GatewayError::Translation(format!("non-utf8 stream line: {e}")))?
            .trim();

        if let Some(name) = line.strip_prefix("event:") {
            state.event_name = Some(name.trim().to_string());
            return Ok(Vec::new());
        }
        let Some(data) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }

        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| GatewayError::Translation(format!("anthropic event: {e}")))?;

        let mut events = Vec::new();
        match event {
            StreamEvent::MessageStart { message } => {
                state.usage.prompt_tokens = message.usage.input_tokens;
                state.usage.cached_tokens = message.usage.cache_read_input_tokens;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, input } => {
                    state.block_kinds.insert(index, "tool_use".to_string());
                    let args = if input.is_null() || input == serde_json::json!({}) {
                        String::new()
                    } else {
                        input.to_string()
                    };
                    state.pending_tool_calls.insert(
                        index,
                        PendingToolCall {
                            id,
                            name,
                            args,
                            thought_signature: None,
                        },
                    );
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                    state.block_kinds.insert(index, "thinking".to_string());
                }
                _ => {
                    state.block_kinds.insert(index, "text".to_string());
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => events.push(IREvent::Token { text }),
                BlockDelta::ThinkingDelta { thinking } => events.push(IREvent::Reasoning {
                    text: thinking,
                    thought_signature: None,
                }),
                BlockDelta::SignatureDelta { signature } => events.push(IREvent::Reasoning {
                    text: String::new(),
                    thought_signature: Some(signature),
                }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = state.pending_tool_calls.get_mut(&index) {
                        pending.args.push_str(&partial_json);
                    }
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(tc) = state.pending_tool_calls.remove(&index) {
                    state.saw_tool_calls = true;
                    events.push(IREvent::ToolCall {
                        call: IRToolCall {
                            id: tc.id,
                            name: tc.name,
                            args: tc.args,
                            thought_signature: tc.thought_signature,
                        },
                        index,
                    });
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    state.finish_reason = Some(stop_reason_to_ir(&reason));
                    state.native_finish = Some(reason);
                }
                if let Some(usage) = usage {
                    if let Some(output) = usage.output_tokens {
                        state.usage.completion_tokens = output;
                        state.usage.total_tokens = state.usage.prompt_tokens + output;
                    }
                }
            }
            StreamEvent::MessageStop => {
                state.done = true;
                events.extend(state.take_tool_calls());
                let reason = state.finish_reason.take().unwrap_or({
                    if state.saw_tool_calls {
                        IRFinishReason::ToolCalls
                    } else {
                        IRFinishReason::Stop
                    }
                });
                events.push(IREvent::Finish {
                    reason,
                    usage: Some(state.usage),
                });
            }
            StreamEvent::Ping => {}
            StreamEvent::Error { error } => {
                state.done = true;
                let message = error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("upstream stream error")
                    .to_string();
                events.push(IREvent::Error {
                    message,
                    status: None,
                });
            }
        }

        Ok(events)
    }
}

fn user_blocks(msg: &IRMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for part in &msg.content {
        match part {
            IRContent::Text { text } => blocks.push(ContentBlock::Text { text: text.clone() }),
            IRContent::Image { image } => blocks.push(image_block(image)),
            IRContent::ToolResult {
                tool_call_id,
                result,
                images,
            } => {
                let mut inner = Vec::new();
                if !result.is_empty() {
                    inner.push(ContentBlock::Text {
                        text: result.clone(),
                    });
                }
                for image in images {
                    inner.push(image_block(image));
                }
                blocks.push(ContentBlock::ToolResult {
                    tool_use_id: to_claude_tool_id(tool_call_id),
                    content: Some(ToolResultContent::Blocks(inner)),
                    is_error: None,
                });
            }
            _ => {}
        }
    }
    blocks
}

/// Assistant blocks with thinking first, per the Messages API ordering rule.
fn assistant_blocks(msg: &IRMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for part in &msg.content {
        if let IRContent::Reasoning {
            text,
            thought_signature,
        } = part
        {
            if text.is_empty() && thought_signature.is_some() {
                blocks.push(ContentBlock::RedactedThinking {
                    data: thought_signature.clone().unwrap_or_default(),
                });
            } else if !text.is_empty() {
                blocks.push(ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: thought_signature.clone(),
                });
            }
        }
    }
    for part in &msg.content {
        if let IRContent::Text { text } = part {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
        }
    }
    for tc in &msg.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: to_claude_tool_id(&tc.id),
            name: tc.name.clone(),
            input: parse_tool_args(&tc.args),
        });
    }
    blocks
}

fn image_block(image: &IRImage) -> ContentBlock {
    if let Some(url) = &image.url {
        ContentBlock::Image {
            source: ImageSource {
                kind: "url".to_string(),
                media_type: None,
                data: None,
                url: Some(url.clone()),
            },
        }
    } else {
        ContentBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: Some(image.mime_type.clone()),
                data: Some(image.data.clone()),
                url: None,
            },
        }
    }
}

fn message_from_blocks(blocks: &[ContentBlock]) -> IRMessage {
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => content.push(IRContent::Text { text: text.clone() }),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => content.push(IRContent::Reasoning {
                text: thinking.clone(),
                thought_signature: signature.clone(),
            }),
            ContentBlock::RedactedThinking { data } => content.push(IRContent::Reasoning {
                text: String::new(),
                thought_signature: Some(data.clone()),
            }),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(IRToolCall {
                id: id.clone(),
                name: name.clone(),
                args: input.to_string(),
                thought_signature: None,
            }),
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }
    IRMessage {
        role: IRRole::Assistant,
        content,
        tool_calls,
    }
}

fn parse_stop_reason(reason: Option<&str>, message: &IRMessage) -> IRFinishReason {
    match reason {
        Some(r) => stop_reason_to_ir(r),
        None => {
            if message.tool_calls.is_empty() {
                IRFinishReason::Stop
            } else {
                IRFinishReason::ToolCalls
            }
        }
    }
}

fn stop_reason_to_ir(reason: &str) -> IRFinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => IRFinishReason::Stop,
        "max_tokens" => IRFinishReason::Length,
        "tool_use" => IRFinishReason::ToolCalls,
        "refusal" => IRFinishReason::ContentFilter,
        _ => IRFinishReason::Unknown,
    }
}

fn usage_to_ir(usage: &Usage) -> IRUsage {
    IRUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        thoughts_tokens: None,
        cached_tokens: usage.cache_read_input_tokens,
    }
}
