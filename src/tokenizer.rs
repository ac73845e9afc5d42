// Token estimation used for gating and countTokens fallback. tiktoken
// encodings approximate well enough across vendors for this purpose.

use crate::ir::types::*;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Flat token cost assumed per inline image.
const IMAGE_TOKEN_COST: i64 = 255;

/// Per-message framing overhead.
const TOKENS_PER_MESSAGE: i64 = 3;

fn o200k() -> &'static CoreBPE {
    static ENC: OnceLock<CoreBPE> = OnceLock::new();
    ENC.get_or_init(|| tiktoken_rs::o200k_base().expect("o200k_base tokenizer"))
}

fn cl100k() -> &'static CoreBPE {
    static ENC: OnceLock<CoreBPE> = OnceLock::new();
    ENC.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer"))
}

fn encoder_for(model: &str) -> &'static CoreBPE {
    let lower = model.to_lowercase();
    if lower.contains("gpt-4o")
        || lower.contains("gpt-5")
        || lower.contains("claude")
        || lower.contains("gemini")
    {
        return o200k();
    }
    if lower.contains("gpt-4") || lower.contains("gpt-3.5") || lower.contains("turbo") {
        return cl100k();
    }
    o200k()
}

fn count(enc: &CoreBPE, text: &str) -> i64 {
    enc.encode_with_special_tokens(text).len() as i64
}

/// Estimates the prompt token count of a unified request.
pub fn estimate_tokens(request: &IRRequest) -> i64 {
    let enc = encoder_for(&request.model);
    let mut total: i64 = 0;

    if let Some(instructions) = &request.instructions {
        total += count(enc, instructions) + TOKENS_PER_MESSAGE;
    }

    for msg in &request.messages {
        total += TOKENS_PER_MESSAGE;
        total += count(enc, role_str(msg.role));

        let (text, images) = message_text(msg);
        if !text.is_empty() {
            total += count(enc, &text);
        }
        total += images * IMAGE_TOKEN_COST;
    }

    if !request.tools.is_empty() {
        if let Ok(json) = serde_json::to_string(&request.tools) {
            total += count(enc, &json) + 10;
        }
    }

    // Reply priming.
    total + 3
}

fn role_str(role: IRRole) -> &'static str {
    match role {
        IRRole::User => "user",
        IRRole::Assistant => "assistant",
        IRRole::System => "system",
        IRRole::Tool => "tool",
    }
}

fn message_text(msg: &IRMessage) -> (String, i64) {
    let mut text = String::new();
    let mut images: i64 = 0;
    for part in &msg.content {
        match part {
            IRContent::Text { text: t } => text.push_str(t),
            IRContent::Reasoning { text: t, .. } => text.push_str(t),
            IRContent::ExecutableCode { code, .. } => text.push_str(code),
            IRContent::CodeResult { output, .. } => text.push_str(output),
            IRContent::ToolResult { result, images: imgs, .. } => {
                text.push_str(result);
                images += imgs.len() as i64;
            }
            IRContent::Image { .. } => images += 1,
            IRContent::File { file } => {
                if let Some(data) = &file.file_data {
                    text.push_str(data);
                }
            }
        }
    }
    for tc in &msg.tool_calls {
        text.push_str(&format!("\n{}({})", tc.name, tc.args));
    }
    (text, images)
}
