// OpenAI Chat Completions frontend: parses client requests into the IR and
// renders IR responses/events back in the Chat Completions dialect.

use crate::error::GatewayError;
use crate::ir::response::to_openai_tool_id;
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::openai::*;
use async_trait::async_trait;
use serde_json::json;

pub struct OpenAIFrontend;

#[async_trait]
impl FrontendConverter for OpenAIFrontend {
    fn dialect(&self) -> &'static str {
        "openai"
    }

    async fn parse_request(&self, body: &[u8]) -> ConvertResult<IRRequest> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidRequest(format!("chat completions body: {e}")))?;

        let mut messages = Vec::new();
        for msg in request.messages {
            messages.push(parse_message(msg)?);
        }

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.kind == "function")
            .map(|t| IRTool {
                name: t.function.name,
                description: t.function.description.unwrap_or_default(),
                parameters: t.function.parameters.unwrap_or_else(|| json!({})),
            })
            .collect();

        let tool_choice = request.tool_choice.map(|tc| match tc {
            ToolChoice::Mode(mode) => match mode.as_str() {
                "required" => IRToolChoice::Required,
                "none" => IRToolChoice::None,
                _ => IRToolChoice::Auto,
            },
            ToolChoice::Function { function, .. } => IRToolChoice::Specific {
                name: function.name,
            },
        });

        let stop_sequences = match request.stop {
            Some(StopSequences::One(s)) => vec![s],
            Some(StopSequences::Many(v)) => v,
            None => Vec::new(),
        };

        let thinking = request.reasoning_effort.map(|effort| IRThinkingConfig {
            include_thoughts: false,
            budget: None,
            summary: None,
            effort: Some(effort),
        });

        let mut metadata = std::collections::HashMap::new();
        if let Some(seed) = request.seed {
            metadata.insert(META_OPENAI_SEED.to_string(), json!(seed));
        }
        if let Some(user) = request.user {
            metadata.insert(META_OPENAI_USER.to_string(), json!(user));
        }
        if let Some(bias) = request.logit_bias {
            metadata.insert(META_OPENAI_LOGIT_BIAS.to_string(), bias);
        }
        if let Some(format) = request.response_format {
            metadata.insert(META_OPENAI_RESPONSE_FORMAT.to_string(), format);
        }

        Ok(IRRequest {
            model: request.model,
            messages,
            tools,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: None,
            max_tokens: request.max_completion_tokens.or(request.max_tokens),
            stop_sequences,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            logprobs: request.logprobs,
            top_logprobs: request.top_logprobs,
            candidate_count: request.n,
            thinking,
            stream: request.stream.unwrap_or(false),
            parallel_tool_calls: request.parallel_tool_calls,
            tool_choice,
            metadata,
            ..Default::default()
        })
    }

    async fn format_response(&self, response: &IRResponse) -> ConvertResult<Vec<u8>> {
        let choices = response
            .candidates
            .iter()
            .map(|cand| {
                let text = cand.message.joined_text();
                let reasoning = cand.message.joined_reasoning();
                let tool_calls: Vec<ToolCall> = cand
                    .message
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

                Choice {
                    index: cand.index,
                    message: ResponseMessage {
                        role: "assistant".to_string(),
                        content: if text.is_empty() { None } else { Some(text) },
                        reasoning_content: if reasoning.is_empty() {
                            None
                        } else {
                            Some(reasoning)
                        },
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        refusal: None,
                    },
                    finish_reason: Some(finish_reason_str(cand.finish_reason).to_string()),
                    logprobs: None,
                }
            })
            .collect();

        let out = ChatResponse {
            id: response.id.clone(),
            object: "chat.completion".to_string(),
            created: response
                .meta
                .create_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: response.model.clone(),
            choices,
            usage: Some(usage_from_ir(&response.usage)),
            system_fingerprint: None,
        };

        Ok(serde_json::to_vec(&out)?)
    }

    fn format_stream_event(
        &self,
        event: &IREvent,
        state: &mut StreamEmitState,
    ) -> ConvertResult<Option<String>> {
        let first = !state.started;

        let (delta, finish_reason, usage) = match event {
            IREvent::Token { text } => (
                Delta {
                    role: first.then(|| "assistant".to_string()),
                    content: Some(text.clone()),
                    ..Default::default()
                },
                None,
                None,
            ),
            IREvent::Reasoning { text, .. } | IREvent::ReasoningSummary { text } => {
                if text.is_empty() {
                    // Signature-only reasoning deltas have no OpenAI shape.
                    return Ok(None);
                }
                (
                    Delta {
                        role: first.then(|| "assistant".to_string()),
                        reasoning_content: Some(text.clone()),
                        ..Default::default()
                    },
                    None,
                    None,
                )
            }
            IREvent::ToolCall { call, index } => (
                Delta {
                    role: first.then(|| "assistant".to_string()),
                    tool_calls: Some(vec![StreamToolCall {
                        index: Some(*index),
                        id: Some(to_openai_tool_id(&call.id)),
                        kind: Some("function".to_string()),
                        function: Some(StreamFunction {
                            name: Some(call.name.clone()),
                            arguments: Some(if call.args.is_empty() {
                                "{}".to_string()
                            } else {
                                call.args.clone()
                            }),
                        }),
                    }]),
                    ..Default::default()
                },
                None,
                None,
            ),
            IREvent::ToolCallDelta { index, args_delta } => (
                Delta {
                    tool_calls: Some(vec![StreamToolCall {
                        index: Some(*index),
                        id: None,
                        kind: None,
                        function: Some(StreamFunction {
                            name: None,
                            arguments: Some(args_delta.clone()),
                        }),
                    }]),
                    ..Default::default()
                },
                None,
                None,
            ),
            IREvent::Finish { reason, usage } => {
                state.finish_seen = true;
                (
                    Delta::default(),
                    Some(finish_reason_str(*reason).to_string()),
                    usage.as_ref().map(usage_from_ir),
                )
            }
            IREvent::Error { message, status } => {
                let payload = json!({
                    "error": {
                        "message": message,
                        "type": "upstream_error",
                        "code": status,
                    }
                });
                return Ok(Some(format!("data: {payload}\n\n")));
            }
            IREvent::Image { .. } | IREvent::CodeExecution { .. } => return Ok(None),
        };

        state.started = true;

        let chunk = ChatChunk {
            id: state.message_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: state.created,
            model: state.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };

        Ok(Some(format!("data: {}\n\n", serde_json::to_string(&chunk)?)))
    }

    fn format_stream_end(&self, _state: &mut StreamEmitState) -> Option<String> {
        Some("data: [DONE]\n\n".to_string())
    }

    fn format_error_body(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "error": {
                "message": message,
                "type": if (400..500).contains(&status) { "invalid_request_error" } else { "api_error" },
                "code": status,
            }
        }))
        .unwrap_or_default()
    }
}

fn parse_message(msg: ChatMessage) -> ConvertResult<IRMessage> {
    match msg.role.as_str() {
        "system" | "developer" => Ok(IRMessage::text(IRRole::System, content_text(msg.content))),
        "user" => {
            let content = match msg.content {
                Some(MessageContent::Text(text)) => vec![IRContent::Text { text }],
                Some(MessageContent::Parts(parts)) => parts
                    .into_iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => IRContent::Text { text },
                        ContentPart::ImageUrl { image_url } => IRContent::Image {
                            image: parse_image_url(&image_url.url),
                        },
                    })
                    .collect(),
                None => Vec::new(),
            };
            Ok(IRMessage {
                role: IRRole::User,
                content,
                tool_calls: Vec::new(),
            })
        }
        "assistant" => {
            let mut content = Vec::new();
            if let Some(reasoning) = msg.reasoning_content {
                if !reasoning.is_empty() {
                    content.push(IRContent::Reasoning {
                        text: reasoning,
                        thought_signature: None,
                    });
                }
            }
            let text = content_text(msg.content);
            if !text.is_empty() {
                content.push(IRContent::Text { text });
            }
            let tool_calls = msg
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| IRToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    args: tc.function.arguments,
                    thought_signature: None,
                })
                .collect();
            Ok(IRMessage {
                role: IRRole::Assistant,
                content,
                tool_calls,
            })
        }
        "tool" => {
            let tool_call_id = msg.tool_call_id.ok_or_else(|| {
                GatewayError::InvalidRequest("tool message missing tool_call_id".to_string())
            })?;
            Ok(IRMessage {
                role: IRRole::Tool,
                content: vec![IRContent::ToolResult {
                    tool_call_id,
                    result: content_text(msg.content),
                    images: Vec::new(),
                }],
                tool_calls: Vec::new(),
            })
        }
        other => Err(GatewayError::InvalidRequest(format!(
            "unsupported message role: {other}"
        ))),
    }
}

fn content_text(content: Option<MessageContent>) -> String {
    match content {
        Some(MessageContent::Text(text)) => text,
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into an inline image; other
/// URLs stay remote references.
fn parse_image_url(url: &str) -> IRImage {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return IRImage {
                mime_type: mime.to_string(),
                data: data.to_string(),
                url: None,
            };
        }
    }
    IRImage {
        mime_type: String::new(),
        data: String::new(),
        url: Some(url.to_string()),
    }
}

pub(crate) fn finish_reason_str(reason: IRFinishReason) -> &'static str {
    match reason {
        IRFinishReason::Stop => "stop",
        IRFinishReason::Length => "length",
        IRFinishReason::ToolCalls => "tool_calls",
        IRFinishReason::ContentFilter => "content_filter",
        IRFinishReason::Error | IRFinishReason::Unknown => "stop",
    }
}

pub(crate) fn usage_from_ir(usage: &IRUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        completion_tokens_details: usage.thoughts_tokens.map(|t| CompletionTokensDetails {
            reasoning_tokens: Some(t),
        }),
        prompt_tokens_details: usage.cached_tokens.map(|t| PromptTokensDetails {
            cached_tokens: Some(t),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> IRRequest {
        futures::executor::block_on(OpenAIFrontend.parse_request(body.as_bytes())).unwrap()
    }

    #[test]
    fn test_parse_basic_request() {
        let ir = parse(
            r#"{
                "model": "gemini-2.5-flash",
                "messages": [{"role": "user", "content": "Hi"}],
                "logprobs": true,
                "top_logprobs": 3,
                "max_tokens": 5
            }"#,
        );
        assert_eq!(ir.model, "gemini-2.5-flash");
        assert_eq!(ir.logprobs, Some(true));
        assert_eq!(ir.top_logprobs, Some(3));
        assert_eq!(ir.max_tokens, Some(5));
        assert!(!ir.stream);
        assert_eq!(ir.messages.len(), 1);
        assert_eq!(ir.messages[0].joined_text(), "Hi");
    }

    #[test]
    fn test_parse_tool_round() {
        let ir = parse(
            r#"{
                "model": "gpt-4o",
                "messages": [
                    {"role": "user", "content": "weather?"},
                    {"role": "assistant", "content": null, "tool_calls": [
                        {"id": "call_abc123", "type": "function",
                         "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
                    ]},
                    {"role": "tool", "tool_call_id": "call_abc123", "content": "rainy"}
                ]
            }"#,
        );
        assert_eq!(ir.messages[1].tool_calls[0].id, "call_abc123");
        assert_eq!(ir.messages[1].tool_calls[0].name, "get_weather");
        match &ir.messages[2].content[0] {
            IRContent::ToolResult { tool_call_id, result, .. } => {
                assert_eq!(tool_call_id, "call_abc123");
                assert_eq!(result, "rainy");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_lifted_to_metadata() {
        let ir = parse(
            r#"{
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "seed": 7,
                "user": "u-1",
                "logit_bias": {"50256": -100}
            }"#,
        );
        assert_eq!(ir.metadata[META_OPENAI_SEED], serde_json::json!(7));
        assert_eq!(ir.metadata[META_OPENAI_USER], serde_json::json!("u-1"));
        assert!(ir.metadata.contains_key(META_OPENAI_LOGIT_BIAS));
    }

    #[test]
    fn test_stream_flag_extracted() {
        let ir = parse(
            r#"{"model":"m","messages":[{"role":"user","content":"x"}],"stream":true}"#,
        );
        assert!(ir.stream);
    }

    #[test]
    fn test_format_response_tool_calls() {
        let response = IRResponse {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            candidates: vec![IRCandidate {
                index: 0,
                message: IRMessage {
                    role: IRRole::Assistant,
                    content: vec![],
                    tool_calls: vec![IRToolCall {
                        id: "toolu_abc123".to_string(),
                        name: "get_weather".to_string(),
                        args: r#"{"city":"Oslo"}"#.to_string(),
                        thought_signature: None,
                    }],
                },
                finish_reason: IRFinishReason::ToolCalls,
            }],
            usage: IRUsage::default(),
            meta: ResponseMeta::default(),
        };
        let bytes =
            futures::executor::block_on(OpenAIFrontend.format_response(&response)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            value["choices"][0]["message"]["tool_calls"][0]["id"],
            "call_abc123"
        );
    }

    #[test]
    fn test_stream_event_frames() {
        let mut state = StreamEmitState::new("chatcmpl-1", "gpt-4o");
        let frame = OpenAIFrontend
            .format_stream_event(
                &IREvent::Token {
                    text: "Hello".to_string(),
                },
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert!(frame.starts_with("data: "));
        let value: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(value["choices"][0]["delta"]["role"], "assistant");

        let finish = OpenAIFrontend
            .format_stream_event(
                &IREvent::Finish {
                    reason: IRFinishReason::Stop,
                    usage: None,
                },
                &mut state,
            )
            .unwrap()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(finish.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            OpenAIFrontend.format_stream_end(&mut state).unwrap(),
            "data: [DONE]\n\n"
        );
    }
}
