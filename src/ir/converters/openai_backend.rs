// OpenAI-protocol backend: renders the IR as a Chat Completions payload and
// parses upstream responses and SSE chunks back into the IR.

use crate::error::GatewayError;
use crate::ir::response::to_openai_tool_id;
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::openai::*;
use async_trait::async_trait;
use serde_json::json;

pub struct OpenAIBackend;

#[async_trait]
impl BackendConverter for OpenAIBackend {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn format_request(
        &self,
        request: &IRRequest,
        provider_model: &str,
    ) -> ConvertResult<Vec<u8>> {
        let mut messages = Vec::new();
        if let Some(instructions) = &request.instructions {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(MessageContent::Text(instructions.clone())),
                name: None,
                tool_calls: None,
                tool_call_id: None,
                reasoning_content: None,
            });
        }
        for msg in &request.messages {
            emit_message(msg, &mut messages)?;
        }

        let tools: Vec<Tool> = request
            .tools
            .iter()
            .map(|t| Tool {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: t.name.clone(),
                    description: if t.description.is_empty() {
                        None
                    } else {
                        Some(t.description.clone())
                    },
                    parameters: Some(t.parameters.clone()),
                },
            })
            .collect();

        let tool_choice = request.tool_choice.as_ref().map(|tc| match tc {
            IRToolChoice::Auto => ToolChoice::Mode("auto".to_string()),
            IRToolChoice::Required => ToolChoice::Mode("required".to_string()),
            IRToolChoice::None => ToolChoice::Mode("none".to_string()),
            IRToolChoice::Specific { name } => ToolChoice::Function {
                kind: "function".to_string(),
                function: FunctionName { name: name.clone() },
            },
        });

        let meta_i64 = |key: &str| {
            request
                .metadata
                .get(key)
                .and_then(serde_json::Value::as_i64)
        };
        let meta_str = |key: &str| {
            request
                .metadata
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(String::from)
        };

        let out = ChatRequest {
            model: provider_model.to_string(),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            n: request.candidate_count,
            stream: request.stream.then_some(true),
            stream_options: request.stream.then(|| json!({ "include_usage": true })),
            stop: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(StopSequences::Many(request.stop_sequences.clone()))
            },
            max_tokens: request.max_tokens,
            max_completion_tokens: None,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            logit_bias: request.metadata.get(META_OPENAI_LOGIT_BIAS).cloned(),
            logprobs: request.logprobs,
            top_logprobs: request.top_logprobs,
            seed: meta_i64(META_OPENAI_SEED),
            user: meta_str(META_OPENAI_USER),
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
            parallel_tool_calls: request.parallel_tool_calls,
            response_format: request.metadata.get(META_OPENAI_RESPONSE_FORMAT).cloned(),
            reasoning_effort: request
                .thinking
                .as_ref()
                .and_then(|t| t.effort.clone()),
        };

        Ok(serde_json::to_vec(&out)?)
    }

    async fn parse_response(&self, body: &[u8], model: &str) -> ConvertResult<IRResponse> {
        let response: ChatResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Translation(format!("openai response: {e}")))?;

        let mut native_finish = None;
        let candidates = response
            .choices
            .iter()
            .map(|choice| {
                let mut content = Vec::new();
                if let Some(reasoning) = &choice.message.reasoning_content {
                    if !reasoning.is_empty() {
                        content.push(IRContent::Reasoning {
                            text: reasoning.clone(),
                            thought_signature: None,
                        });
                    }
                }
                if let Some(text) = &choice.message.content {
                    if !text.is_empty() {
                        content.push(IRContent::Text { text: text.clone() });
                    }
                }
                let tool_calls = choice
                    .message
                    .tool_calls
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tc| IRToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        args: tc.function.arguments,
                        thought_signature: None,
                    })
                    .collect();
                if native_finish.is_none() {
                    native_finish = choice.finish_reason.clone();
                }
                IRCandidate {
                    index: choice.index,
                    message: IRMessage {
                        role: IRRole::Assistant,
                        content,
                        tool_calls,
                    },
                    finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
                }
            })
            .collect();

        Ok(IRResponse {
            id: response.id,
            model: model.to_string(),
            candidates,
            usage: response.usage.map(usage_to_ir).unwrap_or_default(),
            meta: ResponseMeta {
                response_id: None,
                create_time: Some(response.created),
                native_finish_reason: native_finish,
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
        let Some(data) = strip_sse_data(line) else {
            return Ok(Vec::new());
        };

        if data == "[DONE]" {
            state.done = true;
            let mut events = state.take_tool_calls();
            if !events.is_empty() {
                state.saw_tool_calls = true;
            }
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
            return Ok(events);
        }

        let chunk: ChatChunk = serde_json::from_slice(data.as_bytes())
            .map_err(|e| GatewayError::Translation(format!("openai chunk: {e}")))?;

        let mut events = Vec::new();
        if let Some(usage) = chunk.usage {
            state.usage = usage_to_ir(usage);
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    events.push(IREvent::Reasoning {
                        text: reasoning,
                        thought_signature: None,
                    });
                }
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(IREvent::Token { text });
                }
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let index = tc.index.unwrap_or(0);
                let entry = state.pending_tool_calls.entry(index).or_default();
                if let Some(id) = tc.id {
                    entry.id = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        entry.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        entry.args.push_str(&arguments);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                state.native_finish = Some(reason.clone());
                state.finish_reason = Some(parse_finish_reason(Some(&reason)));
            }
        }

        Ok(events)
    }
}

fn strip_sse_data(line: &str) -> Option<&str> {
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
        .map(str::trim)
}

fn emit_message(msg: &IRMessage, out: &mut Vec<ChatMessage>) -> ConvertResult<()> {
    match msg.role {
        IRRole::System => out.push(ChatMessage {
            role: "system".to_string(),
            content: Some(MessageContent::Text(msg.joined_text())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
        }),
        IRRole::User => {
            let has_images = msg
                .content
                .iter()
                .any(|c| matches!(c, IRContent::Image { .. }));
            let content = if has_images {
                let parts = msg
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        IRContent::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                        IRContent::Image { image } => Some(ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: image.url.clone().unwrap_or_else(|| {
                                    format!("data:{};base64,{}", image.mime_type, image.data)
                                }),
                                detail: None,
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                MessageContent::Parts(parts)
            } else {
                MessageContent::Text(msg.joined_text())
            };
            out.push(ChatMessage {
                role: "user".to_string(),
                content: Some(content),
                name: None,
                tool_calls: None,
                tool_call_id: None,
                reasoning_content: None,
            });
        }
        IRRole::Assistant => {
            let text = msg.joined_text();
            let tool_calls: Vec<ToolCall> = msg
                .tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: to_openai_tool_id(&tc.id),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: tc.name.clone(),
                        arguments: if tc.args.is_empty() {
                            "{}".to_string()
                        } else {
                            tc.args.clone()
                        },
                    },
                })
                .collect();
            out.push(ChatMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(text))
                },
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                reasoning_content: None,
            });
        }
        IRRole::Tool => {
            for part in &msg.content {
                if let IRContent::ToolResult {
                    tool_call_id,
                    result,
                    ..
                } = part
                {
                    out.push(ChatMessage {
                        role: "tool".to_string(),
                        content: Some(MessageContent::Text(result.clone())),
                        name: None,
                        tool_calls: None,
                        tool_call_id: Some(to_openai_tool_id(tool_call_id)),
                        reasoning_content: None,
                    });
                }
            }
        }
    }
    Ok(())
}

fn parse_finish_reason(reason: Option<&str>) -> IRFinishReason {
    match reason {
        Some("stop") => IRFinishReason::Stop,
        Some("length") => IRFinishReason::Length,
        Some("tool_calls") | Some("function_call") => IRFinishReason::ToolCalls,
        Some("content_filter") => IRFinishReason::ContentFilter,
        Some(_) => IRFinishReason::Unknown,
        None => IRFinishReason::Unknown,
    }
}

fn usage_to_ir(usage: Usage) -> IRUsage {
    IRUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        thoughts_tokens: usage
            .completion_tokens_details
            .and_then(|d| d.reasoning_tokens),
        cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
    }
}
