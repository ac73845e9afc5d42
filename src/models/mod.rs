// Wire-format types for the supported dialects. These mirror the public
// vendor payload shapes; all mapping logic lives in `ir::converters`.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod responses;
