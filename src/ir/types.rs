// IR Types
//
// These types capture the universal concepts across all supported chat APIs.
// Messages are immutable once built by a frontend parser; converters read
// them but never mutate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Namespaced metadata keys for dialect-specific passthrough. Fields unknown
// to the IR are lifted into `IRRequest.metadata` under these keys instead of
// being dropped.
pub const META_OPENAI_LOGIT_BIAS: &str = "openai:logit_bias";
pub const META_OPENAI_SEED: &str = "openai:seed";
pub const META_OPENAI_USER: &str = "openai:user";
pub const META_OPENAI_RESPONSE_FORMAT: &str = "openai:response_format";
pub const META_GEMINI_CACHED_CONTENT: &str = "gemini:cachedContent";
pub const META_GEMINI_LABELS: &str = "gemini:labels";
pub const META_CLAUDE_METADATA: &str = "claude:metadata";

/// Default max_tokens applied to Claude requests that omit it.
pub const CLAUDE_DEFAULT_MAX_TOKENS: i32 = 4096;

/// Default thinking budget when a `-thinking` model is requested without one.
pub const DEFAULT_THINKING_BUDGET: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IRRole {
    User,
    Assistant,
    System,
    Tool,
}

/// Inline image payload, base64 or remote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IRImage {
    pub mime_type: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// File input (PDF etc.), Responses API style.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IRFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

/// Content block within a message. Closed set: emitters must handle every
/// tag and fail closed on anything they cannot express.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IRContent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    Image {
        image: IRImage,
    },
    File {
        file: IRFile,
    },
    ToolResult {
        tool_call_id: String,
        result: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<IRImage>,
    },
    ExecutableCode {
        language: String,
        code: String,
    },
    CodeResult {
        outcome: String,
        output: String,
    },
}

impl IRContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            IRContent::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, IRContent::Reasoning { .. })
    }
}

/// A request from the model to execute a tool. `args` is the raw JSON text
/// of the arguments, exactly as received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IRToolCall {
    pub id: String,
    pub name: String,
    pub args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRMessage {
    pub role: IRRole,
    pub content: Vec<IRContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<IRToolCall>,
}

impl IRMessage {
    pub fn text(role: IRRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![IRContent::Text { text: text.into() }],
            tool_calls: Vec::new(),
        }
    }

    /// Concatenated text parts, in order.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Concatenated reasoning parts, in order.
    pub fn joined_reasoning(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                IRContent::Reasoning { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Tool capability exposed to the model. `parameters` is a JSON Schema object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IRToolChoice {
    Auto,
    Required,
    None,
    Specific { name: String },
}

/// Reasoning configuration. `budget` semantics: -1 dynamic, 0 disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IRThinkingConfig {
    pub include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRSafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IRImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
}

/// The unified chat request every dialect parses into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IRRequest {
    pub model: String,
    pub messages: Vec<IRMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<IRTool>,

    // Sampling knobs
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i32>,
    pub max_tokens: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<i32>,
    pub candidate_count: Option<i32>,

    pub thinking: Option<IRThinkingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<IRSafetySetting>,
    pub image_config: Option<IRImageConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,

    /// Extracted from the dialect's native streaming flag.
    pub stream: bool,

    // Responses API extensions
    pub instructions: Option<String>,
    pub previous_response_id: Option<String>,
    pub prompt_id: Option<String>,
    pub prompt_version: Option<String>,
    pub prompt_variables: Option<serde_json::Value>,
    pub prompt_cache_key: Option<String>,
    pub store: Option<bool>,
    pub parallel_tool_calls: Option<bool>,
    pub tool_choice: Option<IRToolChoice>,
    pub response_schema: Option<serde_json::Value>,

    /// Namespaced provider passthrough (`openai:…`, `gemini:…`, `claude:…`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IRFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thoughts_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<i64>,
}

/// Upstream response metadata preserved for passthrough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    /// Original finish reason string from upstream (e.g. "STOP", "end_turn").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_finish_reason: Option<String>,
}

/// A single candidate/choice from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRCandidate {
    pub index: usize,
    pub message: IRMessage,
    pub finish_reason: IRFinishReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRResponse {
    pub id: String,
    pub model: String,
    pub candidates: Vec<IRCandidate>,
    pub usage: IRUsage,
    #[serde(default)]
    pub meta: ResponseMeta,
}

impl IRResponse {
    /// The first candidate's message, if any.
    pub fn primary(&self) -> Option<&IRCandidate> {
        self.candidates.first()
    }
}

/// One event in the unified stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IREvent {
    Token {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ReasoningSummary {
        text: String,
    },
    ToolCall {
        call: IRToolCall,
        index: usize,
    },
    ToolCallDelta {
        index: usize,
        args_delta: String,
    },
    Image {
        image: IRImage,
    },
    CodeExecution {
        language: String,
        code: String,
        outcome: String,
        output: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    Finish {
        reason: IRFinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<IRUsage>,
    },
}

/// True for any model in the Claude family, canonical or provider-specific.
pub fn is_claude_model(model: &str) -> bool {
    model.contains("claude")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_text_preserves_order() {
        let msg = IRMessage {
            role: IRRole::Assistant,
            content: vec![
                IRContent::Text {
                    text: "Hello ".to_string(),
                },
                IRContent::Reasoning {
                    text: "hidden".to_string(),
                    thought_signature: None,
                },
                IRContent::Text {
                    text: "world".to_string(),
                },
            ],
            tool_calls: Vec::new(),
        };
        assert_eq!(msg.joined_text(), "Hello world");
        assert_eq!(msg.joined_reasoning(), "hidden");
    }

    #[test]
    fn test_content_serde_tagging() {
        let part = IRContent::Text {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");

        let round: IRContent = serde_json::from_value(json).unwrap();
        assert_eq!(round.as_text(), Some("hi"));
    }

    #[test]
    fn test_is_claude_model() {
        assert!(is_claude_model("claude-sonnet-4-5"));
        assert!(is_claude_model("gemini-claude-sonnet-4-5-thinking"));
        assert!(!is_claude_model("gemini-2.5-flash"));
    }
}
