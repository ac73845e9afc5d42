// Per-provider executors: the HTTP edge against upstream APIs. Each
// executor implements the same capability set and is dispatched by the
// auth's provider key.

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicExecutor;
pub use gemini::GeminiExecutor;
pub use openai::OpenAIExecutor;

use crate::error::GatewayError;
use crate::provider::auth::Auth;
use crate::stream::scanner::ByteStream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const USER_AGENT: &str = concat!("llmux/", env!("CARGO_PKG_VERSION"));

/// Provider-native request payload, already emitted by a backend converter.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub payload: Vec<u8>,
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    /// Request SSE framing from upstreams that support both (Gemini).
    pub alt_sse: bool,
}

#[derive(Debug, Clone)]
pub struct ExecResponse {
    /// Raw upstream body.
    pub payload: Vec<u8>,
    pub status: u16,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable provider key ("openai", "anthropic", "gemini").
    fn identifier(&self) -> &'static str;

    /// Injects credentials and provider headers into an outbound request.
    fn prepare_request(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder;

    /// Unary call. The context token aborts the in-flight request.
    async fn execute(
        &self,
        ctx: CancellationToken,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, GatewayError>;

    /// Streaming call: status is checked eagerly, then the raw byte stream
    /// is handed to the stream pipeline. Upstream errors before the first
    /// byte surface as `GatewayError::Upstream`.
    async fn execute_stream(
        &self,
        ctx: CancellationToken,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ByteStream, GatewayError>;

    /// Optional capability.
    async fn count_tokens(
        &self,
        _ctx: CancellationToken,
        _auth: &Auth,
        _request: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<ExecResponse, GatewayError> {
        Err(GatewayError::NotImplemented(format!(
            "count tokens not supported for {}",
            self.identifier()
        )))
    }

    /// Refreshes OAuth or long-lived tokens. The default is a passthrough.
    async fn refresh(&self, _ctx: CancellationToken, auth: &Auth) -> Result<Auth, GatewayError> {
        Ok(auth.clone())
    }
}

/// Builds a client honouring the credential's proxy, when its scheme is
/// http or https.
pub(crate) fn build_client(
    auth: &Auth,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy_url) = auth.proxy_url.as_deref().filter(|p| !p.is_empty()) {
        if proxy_url.starts_with("http://") || proxy_url.starts_with("https://") {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .map_err(|e| GatewayError::Config(format!("invalid proxy url: {e}")))?,
            );
        }
    }
    builder
        .build()
        .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))
}

/// Endpoint override from the credential, else the provider default.
pub(crate) fn endpoint_for(auth: &Auth, default: &str) -> String {
    auth.attribute("endpoint")
        .map(|e| e.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Sends the request with cancellation, returning the checked response.
pub(crate) async fn send_checked(
    ctx: CancellationToken,
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, GatewayError> {
    let response = tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            return Err(GatewayError::Internal("request cancelled".to_string()));
        }
        response = builder.send() => response?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(GatewayError::Upstream {
        status: status.as_u16(),
        message: if body.is_empty() {
            status.to_string()
        } else {
            body
        },
        retry_after,
    })
}

pub(crate) async fn read_body(response: reqwest::Response) -> Result<ExecResponse, GatewayError> {
    let status = response.status().as_u16();
    let payload = response.bytes().await?.to_vec();
    Ok(ExecResponse { payload, status })
}

pub(crate) fn body_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_override() {
        let mut auth = Auth::new("a", "openai");
        assert_eq!(
            endpoint_for(&auth, "https://api.openai.com"),
            "https://api.openai.com"
        );
        auth.attributes.insert(
            "endpoint".to_string(),
            "https://proxy.example.com/".to_string(),
        );
        assert_eq!(
            endpoint_for(&auth, "https://api.openai.com"),
            "https://proxy.example.com"
        );
    }

    #[test]
    fn test_build_client_ignores_non_http_proxy() {
        let mut auth = Auth::new("a", "openai");
        auth.proxy_url = Some("socks5://localhost:1080".to_string());
        // Unsupported scheme is skipped rather than failing the call.
        assert!(build_client(&auth, None).is_ok());
    }
}
