use super::*;
use crate::error::GatewayError;
use crate::provider::auth::Auth;
use crate::stream::scanner::ByteStream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com";

pub struct OpenAIExecutor;

impl OpenAIExecutor {
    fn url(&self, auth: &Auth) -> String {
        format!("{}/v1/chat/completions", endpoint_for(auth, DEFAULT_ENDPOINT))
    }

    fn post(
        &self,
        auth: &Auth,
        payload: &[u8],
        opts: &ExecOptions,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let client = build_client(auth, opts.timeout)?;
        let builder = client
            .post(self.url(auth))
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        Ok(self.prepare_request(builder, auth))
    }
}

#[async_trait]
impl Executor for OpenAIExecutor {
    fn identifier(&self) -> &'static str {
        "openai"
    }

    fn prepare_request(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        match auth.attribute("api_key") {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
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
