use super::*;
use crate::error::GatewayError;
use crate::provider::auth::Auth;
use crate::stream::scanner::ByteStream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicExecutor;

impl AnthropicExecutor {
    fn post(
        &self,
        auth: &Auth,
        payload: &[u8],
        opts: &ExecOptions,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let client = build_client(auth, opts.timeout)?;
        let url = format!("{}/v1/messages", endpoint_for(auth, DEFAULT_ENDPOINT));
        let builder = client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        Ok(self.prepare_request(builder, auth))
    }
}

#[async_trait]
impl Executor for AnthropicExecutor {
    fn identifier(&self) -> &'static str {
        "anthropic"
    }

    fn prepare_request(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", API_VERSION);
        // OAuth tokens ride the Authorization header, API keys use x-api-key.
        if let Some(token) = auth.attribute("access_token") {
            builder.header("Authorization", format!("Bearer {token}"))
        } else if let Some(key) = auth.attribute("api_key") {
            builder.header("x-api-key", key)
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
        let builder = self.post(auth, &request.payload, &opts)?;
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
        let builder = self.post(auth, &request.payload, &opts)?;
        let response = send_checked(ctx, builder).await?;
        Ok(body_stream(response))
    }
}
