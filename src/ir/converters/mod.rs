// Dialect converters
//
// One frontend per client dialect, one backend per upstream provider.

pub mod anthropic_backend;
pub mod anthropic_frontend;
pub mod gemini_backend;
pub mod gemini_frontend;
pub mod openai_backend;
pub mod openai_frontend;
pub mod responses_frontend;

pub use anthropic_backend::AnthropicBackend;
pub use anthropic_frontend::AnthropicFrontend;
pub use gemini_backend::GeminiBackend;
pub use gemini_frontend::GeminiFrontend;
pub use openai_backend::OpenAIBackend;
pub use openai_frontend::OpenAIFrontend;
pub use responses_frontend::ResponsesFrontend;

use crate::ir::traits::{BackendConverter, FrontendConverter};
use std::sync::Arc;

/// Look up the frontend converter for a client dialect key.
pub fn frontend_for(dialect: &str) -> Option<Arc<dyn FrontendConverter>> {
    match dialect {
        "openai" => Some(Arc::new(OpenAIFrontend)),
        "openai-responses" => Some(Arc::new(ResponsesFrontend)),
        "anthropic" => Some(Arc::new(AnthropicFrontend)),
        "gemini" => Some(Arc::new(GeminiFrontend)),
        _ => None,
    }
}

/// Look up the backend converter for an upstream provider key.
pub fn backend_for(provider: &str) -> Option<Arc<dyn BackendConverter>> {
    match provider {
        "openai" => Some(Arc::new(OpenAIBackend)),
        "anthropic" => Some(Arc::new(AnthropicBackend)),
        "gemini" => Some(Arc::new(GeminiBackend)),
        _ => None,
    }
}
