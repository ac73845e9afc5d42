// OpenAI Responses API frontend.

use crate::error::GatewayError;
use crate::ir::response::to_openai_tool_id;
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::responses::*;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct ResponsesFrontend;

#[async_trait]
impl FrontendConverter for ResponsesFrontend {
    fn dialect(&self) -> &'static str {
        "openai-responses"
    }

    async fn parse_request(&self, body: &[u8]) -> ConvertResult<IRRequest> {
        let request: ResponsesRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidRequest(format!("responses body: {e}")))?;

        let mut messages = Vec::new();
        match request.input {
            Some(Input::Text(text)) => messages.push(IRMessage::text(IRRole::User, text)),
            Some(Input::Items(items)) => {
                for item in items {
                    if let Some(msg) = parse_input_item(item)? {
                        messages.push(msg);
                    }
                }
            }
            None => {}
        }

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.kind == "function")
            .filter_map(|t| {
                t.name.map(|name| IRTool {
                    name,
                    description: t.description.unwrap_or_default(),
                    parameters: t.parameters.unwrap_or_else(|| json!({})),
                })
            })
            .collect();

        let tool_choice = request.tool_choice.and_then(parse_tool_choice);

        let thinking = request.reasoning.map(|r| IRThinkingConfig {
            include_thoughts: true,
            budget: None,
            summary: r.summary,
            effort: r.effort,
        });

        let (prompt_id, prompt_version, prompt_variables) = match request.prompt {
            Some(p) => (Some(p.id), p.version, p.variables),
            None => (None, None, None),
        };

        Ok(IRRequest {
            model: request.model,
            messages,
            tools,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_output_tokens,
            thinking,
            stream: request.stream.unwrap_or(false),
            instructions: request.instructions,
            previous_response_id: request.previous_response_id,
            prompt_id,
            prompt_version,
            prompt_variables,
            prompt_cache_key: request.prompt_cache_key,
            store: request.store,
            parallel_tool_calls: request.parallel_tool_calls,
            tool_choice,
            ..Default::default()
        })
    }

    async fn format_response(&self, response: &IRResponse) -> ConvertResult<Vec<u8>> {
        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| GatewayError::Translation("response has no candidates".to_string()))?;

        let mut output = Vec::new();

        let reasoning = candidate.message.joined_reasoning();
        if !reasoning.is_empty() {
            output.push(json!({
                "type": "reasoning",
                "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
                "summary": [{ "type": "summary_text", "text": reasoning }],
            }));
        }

        let text = candidate.message.joined_text();
        if !text.is_empty() {
            output.push(json!({
                "type": "message",
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "role": "assistant",
                "status": "completed",
                "content": [{ "type": "output_text", "text": text, "annotations": [] }],
            }));
        }

        for call in &candidate.message.tool_calls {
            output.push(json!({
                "type": "function_call",
                "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                "call_id": to_openai_tool_id(&call.id),
                "name": call.name,
                "arguments": if call.args.is_empty() { "{}" } else { call.args.as_str() },
                "status": "completed",
            }));
        }

        let body = json!({
            "id": response.id,
            "object": "response",
            "created_at": response.meta.create_time.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            "status": "completed",
            "model": response.model,
            "output": output,
            "usage": {
                "input_tokens": response.usage.prompt_tokens,
                "output_tokens": response.usage.completion_tokens,
                "total_tokens": response.usage.total_tokens,
            },
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
            let created = json!({
                "type": "response.created",
                "response": {
                    "id": state.message_id,
                    "object": "response",
                    "status": "in_progress",
                    "model": state.model,
                }
            });
            push_frame(&mut out, "response.created", &created);
        }

        match event {
            IREvent::Token { text } => {
                let delta = json!({
                    "type": "response.output_text.delta",
                    "item_id": state.message_id,
                    "output_index": state.output_index,
                    "content_index": 0,
                    "delta": text,
                });
                push_frame(&mut out, "response.output_text.delta", &delta);
            }
            IREvent::Reasoning { text, .. } => {
                let delta = json!({
                    "type": "response.reasoning_text.delta",
                    "item_id": state.message_id,
                    "output_index": state.output_index,
                    "delta": text,
                });
                push_frame(&mut out, "response.reasoning_text.delta", &delta);
            }
            IREvent::ReasoningSummary { text } => {
                let delta = json!({
                    "type": "response.reasoning_summary_text.delta",
                    "item_id": state.message_id,
                    "output_index": state.output_index,
                    "delta": text,
                });
                push_frame(&mut out, "response.reasoning_summary_text.delta", &delta);
            }
            IREvent::ToolCall { call, .. } => {
                state.output_index += 1;
                let added = json!({
                    "type": "response.output_item.added",
                    "output_index": state.output_index,
                    "item": {
                        "type": "function_call",
                        "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                        "call_id": to_openai_tool_id(&call.id),
                        "name": call.name,
                        "arguments": if call.args.is_empty() { "{}" } else { call.args.as_str() },
                        "status": "completed",
                    }
                });
                push_frame(&mut out, "response.output_item.added", &added);
            }
            IREvent::ToolCallDelta { args_delta, .. } => {
                let delta = json!({
                    "type": "response.function_call_arguments.delta",
                    "output_index": state.output_index,
                    "delta": args_delta,
                });
                push_frame(&mut out, "response.function_call_arguments.delta", &delta);
            }
            IREvent::Finish { usage, .. } => {
                state.finish_seen = true;
                let mut response = json!({
                    "id": state.message_id,
                    "object": "response",
                    "status": "completed",
                    "model": state.model,
                });
                if let Some(usage) = usage {
                    response["usage"] = json!({
                        "input_tokens": usage.prompt_tokens,
                        "output_tokens": usage.completion_tokens,
                        "total_tokens": usage.total_tokens,
                    });
                }
                let completed = json!({
                    "type": "response.completed",
                    "response": response,
                });
                push_frame(&mut out, "response.completed", &completed);
            }
            IREvent::Error { message, .. } => {
                let err = json!({
                    "type": "error",
                    "message": message,
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
}

fn push_frame(out: &mut String, event: &str, data: &Value) {
    out.push_str(&format!("event: {event}\ndata: {data}\n\n"));
}

fn parse_input_item(item: InputItem) -> ConvertResult<Option<IRMessage>> {
    match item.kind.as_deref() {
        None | Some("message") => {
            let role = match item.role.as_deref() {
                Some("assistant") => IRRole::Assistant,
                Some("system") | Some("developer") => IRRole::System,
                _ => IRRole::User,
            };
            let content = parse_item_content(item.content);
            Ok(Some(IRMessage {
                role,
                content,
                tool_calls: Vec::new(),
            }))
        }
        Some("function_call") => {
            let call_id = item.call_id.unwrap_or_default();
            let name = item.name.unwrap_or_default();
            Ok(Some(IRMessage {
                role: IRRole::Assistant,
                content: Vec::new(),
                tool_calls: vec![IRToolCall {
                    id: call_id,
                    name,
                    args: item.arguments.unwrap_or_default(),
                    thought_signature: None,
                }],
            }))
        }
        Some("function_call_output") => {
            let result = match item.output {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Ok(Some(IRMessage {
                role: IRRole::Tool,
                content: vec![IRContent::ToolResult {
                    tool_call_id: item.call_id.unwrap_or_default(),
                    result,
                    images: Vec::new(),
                }],
                tool_calls: Vec::new(),
            }))
        }
        Some("reasoning") => {
            let text = item
                .summary
                .as_ref()
                .and_then(summary_text)
                .unwrap_or_default();
            if text.is_empty() {
                return Ok(None);
            }
            Ok(Some(IRMessage {
                role: IRRole::Assistant,
                content: vec![IRContent::Reasoning {
                    text,
                    thought_signature: None,
                }],
                tool_calls: Vec::new(),
            }))
        }
        Some(other) => Err(GatewayError::InvalidRequest(format!(
            "unsupported input item type: {other}"
        ))),
    }
}

fn parse_item_content(content: Option<Value>) -> Vec<IRContent> {
    match content {
        Some(Value::String(text)) => vec![IRContent::Text { text }],
        Some(Value::Array(parts)) => parts
            .into_iter()
            .filter_map(|part| {
                let kind = part.get("type").and_then(Value::as_str)?;
                match kind {
                    "input_text" | "output_text" | "text" => {
                        Some(IRContent::Text {
                            text: part.get("text")?.as_str()?.to_string(),
                        })
                    }
                    "input_image" => {
                        let url = part.get("image_url").and_then(Value::as_str)?;
                        Some(IRContent::Image {
                            image: IRImage {
                                mime_type: String::new(),
                                data: String::new(),
                                url: Some(url.to_string()),
                            },
                        })
                    }
                    "input_file" => Some(IRContent::File {
                        file: IRFile {
                            file_id: part
                                .get("file_id")
                                .and_then(Value::as_str)
                                .map(String::from),
                            filename: part
                                .get("filename")
                                .and_then(Value::as_str)
                                .map(String::from),
                            file_data: part
                                .get("file_data")
                                .and_then(Value::as_str)
                                .map(String::from),
                            file_url: part
                                .get("file_url")
                                .and_then(Value::as_str)
                                .map(String::from),
                        },
                    }),
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn summary_text(summary: &Value) -> Option<String> {
    match summary {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}

fn parse_tool_choice(value: Value) -> Option<IRToolChoice> {
    match value {
        Value::String(mode) => match mode.as_str() {
            "required" => Some(IRToolChoice::Required),
            "none" => Some(IRToolChoice::None),
            _ => Some(IRToolChoice::Auto),
        },
        Value::Object(map) => {
            let name = map.get("name").and_then(Value::as_str)?;
            Some(IRToolChoice::Specific {
                name: name.to_string(),
            })
        }
        _ => None,
    }
}
