use super::*;
use crate::error::GatewayError;
use crate::provider::auth::Auth;
use crate::stream::scanner::ByteStream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiExecutor;

impl GeminiExecutor {
    fn url(&self, auth: &Auth, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            endpoint_for(auth, DEFAULT_ENDPOINT),
            model,
            method
        )
    }

    fn post(
        &self,
        auth: &Auth,
        url: String,
        payload: &[u8],
        opts: &ExecOptions,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let client = build_client(auth, opts.timeout)?;
        let builder = client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        Ok(self.prepare_request(builder, auth))
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        "gemini"
    }

    fn prepare_request(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        if let Some(token) = auth.attribute("access_token") {
            builder.header("Authorization", format!("Bearer {token}"))
        } else if let Some(key) = auth.attribute("api_key") {
            builder.header("x-goog-api-key", key)
        } else {
            builder
        }
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, GatewayError> {
        let url = self.url(auth, &request.model, "generateContent");
        let builder = self.post(auth, url, &request.payload, &opts)?;
        let response = send_checked(ctx, builder).await?;
        read_body(response).await
    }

    async fn execute_stream(
        &self,
        ctx: CancellationToken,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ByteStream, GatewayError> {
        let mut url = self.url(auth, &request.model, "streamGenerateContent");
        if opts.alt_sse {
            url.push_str("?alt=sse");
        }
        let builder = self.post(auth, url, &request.payload, &opts)?;
        let response = send_checked(ctx, builder).await?;
        Ok(body_stream(response))
    }

    async fn count_tokens(
        &self,
        ctx: CancellationToken,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, GatewayError> {
        let url = self.url(auth, &request.model, "countTokens");
        let builder = self.post(auth, url, &request.payload, &opts)?;
        let response = send_checked(ctx, builder).await?;
        read_body(response).await
    }
}
