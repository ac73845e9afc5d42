// Gemini-protocol backend.

use crate::error::GatewayError;
use crate::ir::response::parse_tool_args;
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::gemini::*;
use async_trait::async_trait;
use std::collections::HashMap;

pub struct GeminiBackend;

#[async_trait]
impl BackendConverter for GeminiBackend {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    async fn format_request(
        &self,
        request: &IRRequest,
        _provider_model: &str,
    ) -> ConvertResult<Vec<u8>> {
        // functionResponse parts need the declared function name; recover it
        // from the assistant turn that issued the call.
        let mut call_names: HashMap<String, String> = HashMap::new();
        for msg in &request.messages {
            for tc in &msg.tool_calls {
                call_names.insert(tc.id.clone(), tc.name.clone());
            }
        }

        let mut system_texts = Vec::new();
        if let Some(instructions) = &request.instructions {
            system_texts.push(instructions.clone());
        }
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role {
                IRRole::System => {
                    let text = msg.joined_text();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
                IRRole::User | IRRole::Tool => {
                    contents.push(Content {
                        role: Some("user".to_string()),
                        parts: emit_parts(msg, &call_names),
                    });
                }
                IRRole::Assistant => {
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts: emit_parts(msg, &call_names),
                    });
                }
            }
        }

        let generation_config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            candidate_count: request.candidate_count,
            max_output_tokens: request.max_tokens,
            stop_sequences: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(request.stop_sequences.clone())
            },
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            // IR logprobs flag maps to responseLogprobs; the top-K count maps
            // to Gemini's integer logprobs field.
            response_logprobs: request.logprobs,
            logprobs: request.top_logprobs,
            response_modalities: if request.response_modalities.is_empty() {
                None
            } else {
                Some(request.response_modalities.clone())
            },
            response_mime_type: request.response_schema.as_ref().map(|_| "application/json".to_string()),
            response_schema: request.response_schema.clone(),
            thinking_config: request.thinking.as_ref().map(|t| ThinkingConfig {
                thinking_budget: t.budget,
                include_thoughts: Some(t.include_thoughts),
            }),
            image_config: request.image_config.as_ref().map(|c| ImageConfig {
                aspect_ratio: c.aspect_ratio.clone(),
                image_size: c.image_size.clone(),
            }),
        };

        let mut tools = Vec::new();
        if !request.tools.is_empty() {
            tools.push(Tool {
                function_declarations: Some(
                    request
                        .tools
                        .iter()
                        .map(|t| FunctionDeclaration {
                            name: t.name.clone(),
                            description: if t.description.is_empty() {
                                None
                            } else {
                                Some(t.description.clone())
                            },
                            parameters: None,
                            parameters_json_schema: Some(t.parameters.clone()),
                        })
                        .collect(),
                ),
                ..Default::default()
            });
        }
        if let Some(search) = request.metadata.get("gemini:googleSearch") {
            tools.push(Tool {
                google_search: Some(search.clone()),
                ..Default::default()
            });
        }
        if let Some(exec) = request.metadata.get("gemini:codeExecution") {
            tools.push(Tool {
                code_execution: Some(exec.clone()),
                ..Default::default()
            });
        }
        if let Some(url) = request.metadata.get("gemini:urlContext") {
            tools.push(Tool {
                url_context: Some(url.clone()),
                ..Default::default()
            });
        }

        let tool_config = request.tool_choice.as_ref().map(|tc| {
            let (mode, allowed) = match tc {
                IRToolChoice::Auto => ("AUTO", None),
                IRToolChoice::Required => ("ANY", None),
                IRToolChoice::None => ("NONE", None),
                IRToolChoice::Specific { name } => ("ANY", Some(vec![name.clone()])),
            };
            ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode: mode.to_string(),
                    allowed_function_names: allowed,
                },
            }
        });

        let out = GenerateContentRequest {
            contents,
            system_instruction: if system_texts.is_empty() {
                None
            } else {
                Some(Content {
                    role: None,
                    parts: vec![Part::text(system_texts.join("\n\n"))],
                })
            },
            generation_config: Some(generation_config),
            safety_settings: if request.safety_settings.is_empty() {
                None
            } else {
                Some(
                    request
                        .safety_settings
                        .iter()
                        .map(|s| SafetySetting {
                            category: s.category.clone(),
                            threshold: s.threshold.clone(),
                        })
                        .collect(),
                )
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_config,
            cached_content: request
                .metadata
                .get(META_GEMINI_CACHED_CONTENT)
                .and_then(serde_json::Value::as_str)
                .map(String::from),
            labels: request.metadata.get(META_GEMINI_LABELS).cloned(),
        };

        Ok(serde_json::to_vec(&out)?)
    }

    async fn parse_response(&self, body: &[u8], model: &str) -> ConvertResult<IRResponse> {
        let response: GenerateContentResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Translation(format!("gemini response: {e}")))?;

        let mut native_finish = None;
        let candidates = response
            .candidates
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, cand)| {
                let message = cand
                    .content
                    .as_ref()
                    .map(parse_parts)
                    .unwrap_or_else(|| IRMessage {
                        role: IRRole::Assistant,
                        content: Vec::new(),
                        tool_calls: Vec::new(),
                    });
                if native_finish.is_none() {
                    native_finish = cand.finish_reason.clone();
                }
                let finish_reason = derive_finish(cand.finish_reason.as_deref(), &message);
                IRCandidate {
                    index: cand.index.unwrap_or(i),
                    message,
                    finish_reason,
                }
            })
            .collect();

        Ok(IRResponse {
            id: response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("resp-{}", uuid::Uuid::new_v4().simple())),
            model: model.to_string(),
            candidates,
            usage: response
                .usage_metadata
                .as_ref()
                .map(usage_to_ir)
                .unwrap_or_default(),
            meta: ResponseMeta {
                response_id: response.response_id,
                create_time: response
                    .create_time
                    .as_deref()
                    .and_then(parse_create_time),
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

        // streamGenerateContent with alt=sse frames chunks as SSE data lines;
        // the plain endpoint returns a JSON array spread across lines.
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
            .unwrap_or(line)
            .trim()
            .trim_start_matches(',')
            .trim_end_matches(',')
            .trim();
        if data.is_empty() || data == "[" || data == "]" || data == "[DONE]" {
            return Ok(Vec::new());
        }

        let chunk: GenerateContentResponse = serde_json::from_str(data)
            .map_err(|e| GatewayError::Translation(format!("gemini chunk: {e}")))?;

        let mut events = Vec::new();
        if let Some(usage) = &chunk.usage_metadata {
            state.usage = usage_to_ir(usage);
        }

        for cand in chunk.candidates.unwrap_or_default() {
            if let Some(content) = &cand.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        if part.thought.unwrap_or(false) {
                            events.push(IREvent::Reasoning {
                                text: text.clone(),
                                thought_signature: part.thought_signature.clone(),
                            });
                        } else if !text.is_empty() {
                            events.push(IREvent::Token { text: text.clone() });
                        }
                    } else if let Some(call) = &part.function_call {
                        let index = state.tool_call_count;
                        state.tool_call_count += 1;
                        state.saw_tool_calls = true;
                        events.push(IREvent::ToolCall {
                            call: IRToolCall {
                                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                                name: call.name.clone(),
                                args: call
                                    .args
                                    .as_ref()
                                    .map(|a| a.to_string())
                                    .unwrap_or_default(),
                                thought_signature: part.thought_signature.clone(),
                            },
                            index,
                        });
                    } else if let Some(blob) = &part.inline_data {
                        events.push(IREvent::Image {
                            image: IRImage {
                                mime_type: blob.mime_type.clone(),
                                data: blob.data.clone(),
                                url: None,
                            },
                        });
                    } else if let Some(code) = &part.executable_code {
                        events.push(IREvent::CodeExecution {
                            language: code.language.clone(),
                            code: code.code.clone(),
                            outcome: String::new(),
                            output: String::new(),
                        });
                    } else if let Some(result) = &part.code_execution_result {
                        events.push(IREvent::CodeExecution {
                            language: String::new(),
                            code: String::new(),
                            outcome: result.outcome.clone(),
                            output: result.output.clone().unwrap_or_default(),
                        });
                    }
                }
            }

            if let Some(reason) = &cand.finish_reason {
                state.native_finish = Some(reason.clone());
                state.done = true;
                let mapped = match reason.as_str() {
                    "STOP" => {
                        if state.saw_tool_calls {
                            IRFinishReason::ToolCalls
                        } else {
                            IRFinishReason::Stop
                        }
                    }
                    "MAX_TOKENS" => IRFinishReason::Length,
                    "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => {
                        IRFinishReason::ContentFilter
                    }
                    "OTHER" | "MALFORMED_FUNCTION_CALL" => IRFinishReason::Error,
                    _ => IRFinishReason::Unknown,
                };
                state.finish_reason = Some(mapped);
                events.push(IREvent::Finish {
                    reason: mapped,
                    usage: Some(state.usage),
                });
            }
        }

        Ok(events)
    }
}

fn emit_parts(msg: &IRMessage, call_names: &HashMap<String, String>) -> Vec<Part> {
    let mut parts = Vec::new();
    for part in &msg.content {
        match part {
            IRContent::Text { text } => parts.push(Part::text(text.clone())),
            IRContent::Reasoning {
                text,
                thought_signature,
            } => parts.push(Part {
                text: Some(text.clone()),
                thought: Some(true),
                thought_signature: thought_signature.clone(),
                ..Default::default()
            }),
            IRContent::Image { image } => {
                if let Some(url) = &image.url {
                    parts.push(Part {
                        file_data: Some(FileData {
                            mime_type: if image.mime_type.is_empty() {
                                None
                            } else {
                                Some(image.mime_type.clone())
                            },
                            file_uri: url.clone(),
                        }),
                        ..Default::default()
                    });
                } else {
                    parts.push(Part {
                        inline_data: Some(Blob {
                            mime_type: image.mime_type.clone(),
                            data: image.data.clone(),
                        }),
                        ..Default::default()
                    });
                }
            }
            IRContent::File { file } => {
                if let Some(url) = &file.file_url {
                    parts.push(Part {
                        file_data: Some(FileData {
                            mime_type: None,
                            file_uri: url.clone(),
                        }),
                        ..Default::default()
                    });
                }
            }
            IRContent::ToolResult {
                tool_call_id,
                result,
                ..
            } => {
                let name = call_names
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| tool_call_id.clone());
                let response = serde_json::from_str(result)
                    .unwrap_or_else(|_| serde_json::json!({ "result": result }));
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name,
                        response,
                        id: None,
                    }),
                    ..Default::default()
                });
            }
            IRContent::ExecutableCode { language, code } => parts.push(Part {
                executable_code: Some(ExecutableCode {
                    language: language.clone(),
                    code: code.clone(),
                }),
                ..Default::default()
            }),
            IRContent::CodeResult { outcome, output } => parts.push(Part {
                code_execution_result: Some(CodeExecutionResult {
                    outcome: outcome.clone(),
                    output: Some(output.clone()),
                }),
                ..Default::default()
            }),
        }
    }
    for tc in &msg.tool_calls {
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: tc.name.clone(),
                args: Some(parse_tool_args(&tc.args)),
            }),
            thought_signature: tc.thought_signature.clone(),
            ..Default::default()
        });
    }
    parts
}

fn parse_parts(content: &Content) -> IRMessage {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                parts.push(IRContent::Reasoning {
                    text: text.clone(),
                    thought_signature: part.thought_signature.clone(),
                });
            } else {
                parts.push(IRContent::Text { text: text.clone() });
            }
        } else if let Some(call) = &part.function_call {
            tool_calls.push(IRToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: call.name.clone(),
                args: call
                    .args
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                thought_signature: part.thought_signature.clone(),
            });
        } else if let Some(blob) = &part.inline_data {
            parts.push(IRContent::Image {
                image: IRImage {
                    mime_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                    url: None,
                },
            });
        } else if let Some(code) = &part.executable_code {
            parts.push(IRContent::ExecutableCode {
                language: code.language.clone(),
                code: code.code.clone(),
            });
        } else if let Some(result) = &part.code_execution_result {
            parts.push(IRContent::CodeResult {
                outcome: result.outcome.clone(),
                output: result.output.clone().unwrap_or_default(),
            });
        }
    }
    IRMessage {
        role: IRRole::Assistant,
        content: parts,
        tool_calls,
    }
}

fn derive_finish(reason: Option<&str>, message: &IRMessage) -> IRFinishReason {
    if !message.tool_calls.is_empty() {
        return IRFinishReason::ToolCalls;
    }
    match reason {
        Some("STOP") | None => IRFinishReason::Stop,
        Some("MAX_TOKENS") => IRFinishReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
            IRFinishReason::ContentFilter
        }
        Some("OTHER") | Some("MALFORMED_FUNCTION_CALL") => IRFinishReason::Error,
        Some(_) => IRFinishReason::Unknown,
    }
}

fn usage_to_ir(usage: &UsageMetadata) -> IRUsage {
    IRUsage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        thoughts_tokens: usage.thoughts_token_count,
        cached_tokens: usage.cached_content_token_count,
    }
}

fn parse_create_time(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logprobs_translation() {
        // OpenAI-style knobs land in generationConfig under Gemini's names.
        let ir = IRRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![IRMessage::text(IRRole::User, "Hi")],
            logprobs: Some(true),
            top_logprobs: Some(3),
            max_tokens: Some(5),
            ..Default::default()
        };
        let bytes = futures::executor::block_on(
            GeminiBackend.format_request(&ir, "gemini-2.5-flash"),
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let config = &value["generationConfig"];
        assert_eq!(config["responseLogprobs"], true);
        assert_eq!(config["logprobs"], 3);
        assert_eq!(config["maxOutputTokens"], 5);
    }

    #[test]
    fn test_function_response_uses_call_name() {
        let ir = IRRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![
                IRMessage {
                    role: IRRole::Assistant,
                    content: vec![],
                    tool_calls: vec![IRToolCall {
                        id: "call_9".to_string(),
                        name: "get_weather".to_string(),
                        args: "{}".to_string(),
                        thought_signature: None,
                    }],
                },
                IRMessage {
                    role: IRRole::Tool,
                    content: vec![IRContent::ToolResult {
                        tool_call_id: "call_9".to_string(),
                        result: r#"{"temp": 3}"#.to_string(),
                        images: vec![],
                    }],
                    tool_calls: vec![],
                },
            ],
            ..Default::default()
        };
        let bytes = futures::executor::block_on(
            GeminiBackend.format_request(&ir, "gemini-2.5-flash"),
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value["contents"][1]["parts"][0]["functionResponse"]["name"],
            "get_weather"
        );
    }

    #[test]
    fn test_stream_line_variants() {
        let backend = GeminiBackend;
        let mut state = StreamParseState::default();

        // SSE-framed chunk
        let events = backend
            .parse_stream_line(
                br#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
                &mut state,
            )
            .unwrap();
        assert!(matches!(&events[0], IREvent::Token { text } if text == "Hel"));

        // Array-framed chunk with trailing comma
        let events = backend
            .parse_stream_line(
                br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo","thought":false}]}}]},"#,
                &mut state,
            )
            .unwrap();
        assert!(matches!(&events[0], IREvent::Token { text } if text == "lo"));

        // Final chunk with finishReason and usage
        let events = backend
            .parse_stream_line(
                br#"data: {"candidates":[{"content":{"role":"model","parts":[]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":4,"totalTokenCount":6}}"#,
                &mut state,
            )
            .unwrap();
        match events.last().unwrap() {
            IREvent::Finish { reason, usage } => {
                assert_eq!(*reason, IRFinishReason::Stop);
                assert_eq!(usage.unwrap().total_tokens, 6);
            }
            other => panic!("expected finish, got {other:?}"),
        }
        assert!(state.done);
    }

    #[test]
    fn test_thought_parts_to_reasoning() {
        let backend = GeminiBackend;
        let mut state = StreamParseState::default();
        let events = backend
            .parse_stream_line(
                br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"deep","thought":true,"thoughtSignature":"s"}]}}]}"#,
                &mut state,
            )
            .unwrap();
        match &events[0] {
            IREvent::Reasoning {
                text,
                thought_signature,
            } => {
                assert_eq!(text, "deep");
                assert_eq!(thought_signature.as_deref(), Some("s"));
            }
            other => panic!("expected reasoning, got {other:?}"),
        }
    }
}
