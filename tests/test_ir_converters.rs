// Cross-dialect translation properties: round trips, tool-ID normalisation,
// and knob mapping between wire formats.

use llmux::ir::converters::{
    AnthropicBackend, AnthropicFrontend, GeminiBackend, OpenAIFrontend,
};
use llmux::ir::{BackendConverter, FrontendConverter, IRContent, IRRole};
use serde_json::Value;

async fn parse_openai(body: &str) -> llmux::ir::IRRequest {
    OpenAIFrontend.parse_request(body.as_bytes()).await.unwrap()
}

#[tokio::test]
async fn test_openai_round_trip_preserves_content() {
    let body = r#"{
        "model": "gpt-4o",
        "temperature": 0.4,
        "top_p": 0.9,
        "max_tokens": 256,
        "stop": ["END"],
        "messages": [
            {"role": "system", "content": "be helpful"},
            {"role": "user", "content": "What is the weather in Oslo?"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_w1", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_w1", "content": "rainy, 4C"},
            {"role": "assistant", "content": "It is rainy."}
        ],
        "tools": [{"type": "function", "function": {
            "name": "get_weather",
            "description": "Weather lookup",
            "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
        }}]
    }"#;

    let ir = parse_openai(body).await;

    // Ordering and roles survive the parse.
    assert_eq!(ir.messages.len(), 5);
    assert_eq!(ir.messages[0].role, IRRole::System);
    assert_eq!(ir.messages[1].joined_text(), "What is the weather in Oslo?");
    assert_eq!(ir.messages[2].tool_calls[0].id, "call_w1");
    assert_eq!(ir.messages[4].joined_text(), "It is rainy.");
    assert_eq!(ir.temperature, Some(0.4));
    assert_eq!(ir.top_p, Some(0.9));
    assert_eq!(ir.max_tokens, Some(256));
    assert_eq!(ir.stop_sequences, vec!["END"]);
    assert_eq!(ir.tools.len(), 1);

    // Emitting back to the OpenAI wire preserves tool names, args, and IDs.
    let emitted = llmux::ir::converters::OpenAIBackend
        .format_request(&ir, "gpt-4o")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&emitted).unwrap();
    assert_eq!(value["messages"][2]["tool_calls"][0]["id"], "call_w1");
    assert_eq!(
        value["messages"][2]["tool_calls"][0]["function"]["arguments"],
        "{\"city\":\"Oslo\"}"
    );
    assert_eq!(value["messages"][3]["tool_call_id"], "call_w1");
    assert_eq!(value["temperature"], 0.4);
    assert_eq!(value["stop"][0], "END");
    assert_eq!(value["tools"][0]["function"]["name"], "get_weather");
}

#[tokio::test]
async fn test_tool_id_normalisation_across_dialects() {
    // IR id `call_abc123` becomes `toolu_abc123` on the Anthropic wire.
    let ir = parse_openai(
        r#"{
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_abc123", "type": "function",
                     "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_abc123", "content": "ok"}
            ]
        }"#,
    )
    .await;

    let anthropic_wire = AnthropicBackend
        .format_request(&ir, "claude-sonnet-4-5-20250929")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&anthropic_wire).unwrap();
    assert_eq!(value["messages"][0]["content"][0]["id"], "toolu_abc123");
    assert_eq!(
        value["messages"][1]["content"][0]["tool_use_id"],
        "toolu_abc123"
    );

    // Re-parsed from the Anthropic dialect and emitted to OpenAI, the ID
    // returns to `call_abc123`: the transform is a bijection.
    let claude_client_body = r#"{
        "model": "claude-sonnet-4-5",
        "max_tokens": 100,
        "messages": [
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_abc123", "name": "f", "input": {}}
            ]}
        ]
    }"#;
    let ir2 = AnthropicFrontend
        .parse_request(claude_client_body.as_bytes())
        .await
        .unwrap();
    let openai_wire = llmux::ir::converters::OpenAIBackend
        .format_request(&ir2, "gpt-4o")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&openai_wire).unwrap();
    assert_eq!(value["messages"][0]["tool_calls"][0]["id"], "call_abc123");
}

#[tokio::test]
async fn test_openai_logprobs_to_gemini_generation_config() {
    let ir = parse_openai(
        r#"{
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "Hi"}],
            "logprobs": true,
            "top_logprobs": 3,
            "max_tokens": 5
        }"#,
    )
    .await;

    let wire = GeminiBackend
        .format_request(&ir, "gemini-2.5-flash")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&wire).unwrap();
    assert_eq!(value["generationConfig"]["responseLogprobs"], true);
    assert_eq!(value["generationConfig"]["logprobs"], 3);
    assert_eq!(value["generationConfig"]["maxOutputTokens"], 5);
}

#[tokio::test]
async fn test_anthropic_round_trip_thinking_blocks() {
    let body = r#"{
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "thinking": {"type": "enabled", "budget_tokens": 2048},
        "messages": [
            {"role": "user", "content": "why is the sky blue"},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "scattering", "signature": "sig-1"},
                {"type": "text", "text": "Rayleigh scattering."}
            ]}
        ]
    }"#;

    let ir = AnthropicFrontend.parse_request(body.as_bytes()).await.unwrap();
    match &ir.messages[1].content[0] {
        IRContent::Reasoning {
            text,
            thought_signature,
        } => {
            assert_eq!(text, "scattering");
            assert_eq!(thought_signature.as_deref(), Some("sig-1"));
        }
        other => panic!("expected reasoning first, got {other:?}"),
    }

    let wire = AnthropicBackend
        .format_request(&ir, "claude-sonnet-4-5-20250929")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&wire).unwrap();
    assert_eq!(value["thinking"]["type"], "enabled");
    assert_eq!(value["thinking"]["budget_tokens"], 2048);
    // The signature survives the round trip.
    assert_eq!(value["messages"][1]["content"][0]["signature"], "sig-1");
    assert_eq!(
        value["messages"][1]["content"][1]["text"],
        "Rayleigh scattering."
    );
}

#[tokio::test]
async fn test_gemini_request_round_trip() {
    let body = r#"{
        "contents": [
            {"role": "user", "parts": [{"text": "describe"}, {"inlineData": {"mimeType": "image/png", "data": "aGk="}}]}
        ],
        "systemInstruction": {"parts": [{"text": "terse"}]},
        "generationConfig": {"temperature": 0.2, "maxOutputTokens": 99, "candidateCount": 2},
        "safetySettings": [{"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"}]
    }"#;

    let frontend = llmux::ir::converters::GeminiFrontend;
    let ir = frontend.parse_request(body.as_bytes()).await.unwrap();
    assert_eq!(ir.messages[0].role, IRRole::System);
    assert_eq!(ir.temperature, Some(0.2));
    assert_eq!(ir.candidate_count, Some(2));
    assert_eq!(ir.safety_settings.len(), 1);

    let wire = GeminiBackend
        .format_request(&ir, "gemini-2.5-flash")
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&wire).unwrap();
    assert_eq!(value["systemInstruction"]["parts"][0]["text"], "terse");
    assert_eq!(value["contents"][0]["parts"][0]["text"], "describe");
    assert_eq!(
        value["contents"][0]["parts"][1]["inlineData"]["mimeType"],
        "image/png"
    );
    assert_eq!(value["generationConfig"]["candidateCount"], 2);
    assert_eq!(
        value["safetySettings"][0]["category"],
        "HARM_CATEGORY_HARASSMENT"
    );
}

#[tokio::test]
async fn test_unary_response_translation_gemini_to_openai() {
    let upstream = r#"{
        "candidates": [{
            "content": {"role": "model", "parts": [
                {"text": "thinking...", "thought": true},
                {"text": "Hello!"}
            ]},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 6, "totalTokenCount": 10, "thoughtsTokenCount": 2},
        "responseId": "r-123"
    }"#;

    let ir_response = GeminiBackend
        .parse_response(upstream.as_bytes(), "gemini-2.5-flash")
        .await
        .unwrap();
    assert_eq!(ir_response.meta.native_finish_reason.as_deref(), Some("STOP"));

    let client_body = OpenAIFrontend.format_response(&ir_response).await.unwrap();
    let value: Value = serde_json::from_slice(&client_body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(
        value["choices"][0]["message"]["reasoning_content"],
        "thinking..."
    );
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["total_tokens"], 10);
    assert_eq!(
        value["usage"]["completion_tokens_details"]["reasoning_tokens"],
        2
    );
}
