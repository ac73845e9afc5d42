// Gemini generateContent frontend.

use crate::error::GatewayError;
use crate::ir::response::ResponseBuilder;
use crate::ir::traits::*;
use crate::ir::types::*;
use crate::models::gemini::*;
use async_trait::async_trait;
use serde_json::json;

pub struct GeminiFrontend;

#[async_trait]
impl FrontendConverter for GeminiFrontend {
    fn dialect(&self) -> &'static str {
        "gemini"
    }

    async fn parse_request(&self, body: &[u8]) -> ConvertResult<IRRequest> {
        let request: GenerateContentRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidRequest(format!("generateContent body: {e}")))?;

        let mut messages = Vec::new();
        if let Some(system) = request.system_instruction {
            let text = system
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                messages.push(IRMessage::text(IRRole::System, text));
            }
        }
        for content in &request.contents {
            messages.push(parse_content(content)?);
        }

        let mut ir = IRRequest {
            messages,
            ..Default::default()
        };

        if let Some(config) = request.generation_config {
            ir.temperature = config.temperature;
            ir.top_p = config.top_p;
            ir.top_k = config.top_k;
            ir.max_tokens = config.max_output_tokens;
            ir.stop_sequences = config.stop_sequences.unwrap_or_default();
            ir.candidate_count = config.candidate_count;
            ir.presence_penalty = config.presence_penalty;
            ir.frequency_penalty = config.frequency_penalty;
            // Gemini names: responseLogprobs is the request flag, logprobs is
            // the top-K count.
            ir.logprobs = config.response_logprobs;
            ir.top_logprobs = config.logprobs;
            ir.response_modalities = config.response_modalities.unwrap_or_default();
            ir.response_schema = config.response_schema;
            ir.thinking = config.thinking_config.map(|t| IRThinkingConfig {
                include_thoughts: t.include_thoughts.unwrap_or(false),
                budget: t.thinking_budget,
                summary: None,
                effort: None,
            });
            ir.image_config = config.image_config.map(|c| IRImageConfig {
                aspect_ratio: c.aspect_ratio,
                image_size: c.image_size,
            });
        }

        ir.safety_settings = request
            .safety_settings
            .unwrap_or_default()
            .into_iter()
            .map(|s| IRSafetySetting {
                category: s.category,
                threshold: s.threshold,
            })
            .collect();

        for tool in request.tools.unwrap_or_default() {
            for decl in tool.function_declarations.unwrap_or_default() {
                ir.tools.push(IRTool {
                    name: decl.name,
                    description: decl.description.unwrap_or_default(),
                    parameters: decl
                        .parameters_json_schema
                        .or(decl.parameters)
                        .unwrap_or_else(|| json!({})),
                });
            }
            if let Some(search) = tool.google_search {
                ir.metadata.insert("gemini:googleSearch".to_string(), search);
            }
            if let Some(exec) = tool.code_execution {
                ir.metadata.insert("gemini:codeExecution".to_string(), exec);
            }
            if let Some(url) = tool.url_context {
                ir.metadata.insert("gemini:urlContext".to_string(), url);
            }
        }

        if let Some(tool_config) = request.tool_config {
            let fc = tool_config.function_calling_config;
            ir.tool_choice = Some(match fc.mode.as_str() {
                "ANY" => match fc.allowed_function_names.as_deref() {
                    Some([name]) => IRToolChoice::Specific { name: name.clone() },
                    _ => IRToolChoice::Required,
                },
                "NONE" => IRToolChoice::None,
                _ => IRToolChoice::Auto,
            });
        }

        if let Some(cached) = request.cached_content {
            ir.metadata
                .insert(META_GEMINI_CACHED_CONTENT.to_string(), json!(cached));
        }
        if let Some(labels) = request.labels {
            ir.metadata.insert(META_GEMINI_LABELS.to_string(), labels);
        }

        // The model and streaming mode ride on the URL path; the orchestrator
        // fills them in after parsing.
        Ok(ir)
    }

    async fn format_response(&self, response: &IRResponse) -> ConvertResult<Vec<u8>> {
        let candidates: Vec<serde_json::Value> = response
            .candidates
            .iter()
            .map(|cand| {
                let builder = ResponseBuilder::new(&cand.message);
                json!({
                    "content": { "role": "model", "parts": builder.gemini_parts() },
                    "finishReason": finish_reason_str(cand.finish_reason),
                    "index": cand.index,
                })
            })
            .collect();

        let mut body = json!({
            "candidates": candidates,
            "usageMetadata": {
                "promptTokenCount": response.usage.prompt_tokens,
                "candidatesTokenCount": response.usage.completion_tokens,
                "totalTokenCount": response.usage.total_tokens,
            },
            "modelVersion": response.model,
        });
        if let Some(thoughts) = response.usage.thoughts_tokens {
            body["usageMetadata"]["thoughtsTokenCount"] = json!(thoughts);
        }
        if let Some(id) = &response.meta.response_id {
            body["responseId"] = json!(id);
        } else {
            body["responseId"] = json!(response.id);
        }

        Ok(serde_json::to_vec(&body)?)
    }

    fn format_stream_event(
        &self,
        event: &IREvent,
        state: &mut StreamEmitState,
    ) -> ConvertResult<Option<String>> {
        let payload = match event {
            IREvent::Token { text } => chunk_with_parts(state, json!([{ "text": text }]), None),
            IREvent::Reasoning {
                text,
                thought_signature,
            } => {
                let mut part = json!({ "text": text, "thought": true });
                if let Some(sig) = thought_signature {
                    part["thoughtSignature"] = json!(sig);
                }
                chunk_with_parts(state, json!([part]), None)
            }
            IREvent::ReasoningSummary { text } => {
                chunk_with_parts(state, json!([{ "text": text, "thought": true }]), None)
            }
            IREvent::ToolCall { call, .. } => chunk_with_parts(
                state,
                json!([{
                    "functionCall": {
                        "name": call.name,
                        "args": crate::ir::response::parse_tool_args(&call.args),
                    }
                }]),
                None,
            ),
            IREvent::Image { image } => chunk_with_parts(
                state,
                json!([{
                    "inlineData": { "mimeType": image.mime_type, "data": image.data }
                }]),
                None,
            ),
            IREvent::CodeExecution {
                language,
                code,
                outcome,
                output,
            } => {
                let parts = if !code.is_empty() {
                    json!([{ "executableCode": { "language": language, "code": code } }])
                } else {
                    json!([{ "codeExecutionResult": { "outcome": outcome, "output": output } }])
                };
                chunk_with_parts(state, parts, None)
            }
            IREvent::Finish { reason, usage } => {
                state.finish_seen = true;
                chunk_with_parts(state, json!([]), Some((*reason, *usage)))
            }
            IREvent::Error { message, status } => {
                json!({
                    "error": {
                        "code": status.unwrap_or(502),
                        "message": message,
                        "status": "UNAVAILABLE",
                    }
                })
            }
            IREvent::ToolCallDelta { .. } => return Ok(None),
        };

        if state.sse {
            Ok(Some(format!("data: {payload}\n\n")))
        } else {
            Ok(Some(format!("{payload}\n")))
        }
    }

    fn format_stream_end(&self, _state: &mut StreamEmitState) -> Option<String> {
        None
    }

    fn format_error_body(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "error": { "code": status, "message": message, "status": "FAILED_PRECONDITION" }
        }))
        .unwrap_or_default()
    }
}

fn chunk_with_parts(
    state: &StreamEmitState,
    parts: serde_json::Value,
    finish: Option<(IRFinishReason, Option<IRUsage>)>,
) -> serde_json::Value {
    let mut candidate = json!({
        "content": { "role": "model", "parts": parts },
        "index": 0,
    });
    let mut body = json!({
        "responseId": state.message_id,
        "modelVersion": state.model,
    });
    if let Some((reason, usage)) = finish {
        candidate["finishReason"] = json!(finish_reason_str(reason));
        if let Some(usage) = usage {
            body["usageMetadata"] = json!({
                "promptTokenCount": usage.prompt_tokens,
                "candidatesTokenCount": usage.completion_tokens,
                "totalTokenCount": usage.total_tokens,
            });
        }
    }
    body["candidates"] = json!([candidate]);
    body
}

fn parse_content(content: &Content) -> ConvertResult<IRMessage> {
    let role = match content.role.as_deref() {
        Some("model") => IRRole::Assistant,
        Some("user") | None => IRRole::User,
        Some(other) => {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported content role: {other}"
            )))
        }
    };

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
        } else if let Some(blob) = &part.inline_data {
            parts.push(IRContent::Image {
                image: IRImage {
                    mime_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                    url: None,
                },
            });
        } else if let Some(file) = &part.file_data {
            parts.push(IRContent::File {
                file: IRFile {
                    file_url: Some(file.file_uri.clone()),
                    ..Default::default()
                },
            });
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
        } else if let Some(resp) = &part.function_response {
            parts.push(IRContent::ToolResult {
                tool_call_id: resp.id.clone().unwrap_or_else(|| resp.name.clone()),
                result: resp.response.to_string(),
                images: Vec::new(),
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

    Ok(IRMessage {
        role,
        content: parts,
        tool_calls,
    })
}

fn finish_reason_str(reason: IRFinishReason) -> &'static str {
    match reason {
        IRFinishReason::Stop | IRFinishReason::ToolCalls => "STOP",
        IRFinishReason::Length => "MAX_TOKENS",
        IRFinishReason::ContentFilter => "SAFETY",
        IRFinishReason::Error => "OTHER",
        IRFinishReason::Unknown => "FINISH_REASON_UNSPECIFIED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> IRRequest {
        futures::executor::block_on(GeminiFrontend.parse_request(body.as_bytes())).unwrap()
    }

    #[test]
    fn test_parse_generation_config() {
        let ir = parse(
            r#"{
                "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
                "generationConfig": {
                    "maxOutputTokens": 5,
                    "responseLogprobs": true,
                    "logprobs": 3,
                    "thinkingConfig": {"thinkingBudget": 512, "includeThoughts": true}
                }
            }"#,
        );
        assert_eq!(ir.max_tokens, Some(5));
        assert_eq!(ir.logprobs, Some(true));
        assert_eq!(ir.top_logprobs, Some(3));
        let thinking = ir.thinking.unwrap();
        assert_eq!(thinking.budget, Some(512));
        assert!(thinking.include_thoughts);
    }

    #[test]
    fn test_parse_function_call_and_response() {
        let ir = parse(
            r#"{
                "contents": [
                    {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"a": 1}}}]},
                    {"role": "user", "parts": [{"functionResponse": {"name": "f", "response": {"ok": true}}}]}
                ]
            }"#,
        );
        assert_eq!(ir.messages[0].tool_calls[0].name, "f");
        assert!(ir.messages[0].tool_calls[0].id.starts_with("call_"));
        match &ir.messages[1].content[0] {
            IRContent::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "f"),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_chunk_framing() {
        let mut state = StreamEmitState::new("resp-1", "gemini-2.5-flash");
        let bare = GeminiFrontend
            .format_stream_event(
                &IREvent::Token {
                    text: "Hi".to_string(),
                },
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert!(!bare.starts_with("data: "));
        assert!(bare.ends_with('\n'));

        state.sse = true;
        let sse = GeminiFrontend
            .format_stream_event(
                &IREvent::Token {
                    text: "Hi".to_string(),
                },
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert!(sse.starts_with("data: "));
        let value: serde_json::Value =
            serde_json::from_str(sse.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["candidates"][0]["content"]["parts"][0]["text"], "Hi");
    }
}
