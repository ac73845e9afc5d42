// Request orchestration: parse -> preprocess -> family resolve -> pick ->
// emit -> execute -> translate back -> record result. HTTP handlers stay
// thin and call into here.

use crate::config::Config;
use crate::error::GatewayError;
use crate::ir::converters::{backend_for, frontend_for};
use crate::ir::traits::StreamEmitState;
use crate::ir::types::IRRequest;
use crate::logging;
use crate::metrics;
use crate::preprocess;
use crate::provider::auth::{Auth, AuthError};
use crate::provider::{ExecResult, Manager};
use crate::registry::{FamilyMember, ModelRegistry};
use crate::stream::pipeline::{spawn_pipeline, PipelineConfig, StreamOutcome};
use crate::stream::scanner::ScannerConfig;
use crate::stream::IdleWatcher;
use crate::tokenizer;
use crate::executor::{ExecOptions, ExecRequest};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAI,
    Responses,
    Anthropic,
    Gemini,
}

impl Dialect {
    pub fn key(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "openai",
            Dialect::Responses => "openai-responses",
            Dialect::Anthropic => "anthropic",
            Dialect::Gemini => "gemini",
        }
    }

    fn message_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple();
        match self {
            Dialect::OpenAI => format!("chatcmpl-{id}"),
            Dialect::Responses => format!("resp_{id}"),
            Dialect::Anthropic => format!("msg_{id}"),
            Dialect::Gemini => format!("{id}"),
        }
    }
}

/// Routing details that ride on the URL for Gemini-dialect requests.
#[derive(Debug, Clone)]
pub struct GeminiRoute {
    pub model: String,
    pub stream: bool,
    pub alt_sse: bool,
}

pub enum ChatOutcome {
    Unary(Vec<u8>),
    Stream {
        frames: mpsc::Receiver<Result<String, GatewayError>>,
        content_type: &'static str,
    },
}

pub struct Gateway {
    pub manager: Arc<Manager>,
    pub registry: Arc<ModelRegistry>,
    pub watcher: Arc<IdleWatcher>,
    pub config: Arc<Config>,
}

impl Gateway {
    pub fn new(
        manager: Arc<Manager>,
        registry: Arc<ModelRegistry>,
        watcher: Arc<IdleWatcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            manager,
            registry,
            watcher,
            config,
        }
    }

    pub async fn handle_chat(
        &self,
        dialect: Dialect,
        body: &[u8],
        route: Option<GeminiRoute>,
    ) -> Result<ChatOutcome, GatewayError> {
        let frontend = frontend_for(dialect.key())
            .ok_or_else(|| GatewayError::Internal(format!("no frontend for {dialect:?}")))?;

        let mut ir = frontend.parse_request(body).await?;
        let mut alt_sse = true;
        if let Some(route) = &route {
            ir.model = route.model.clone();
            ir.stream = route.stream;
            alt_sse = route.alt_sse;
        }
        if ir.model.is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".to_string()));
        }
        if ir.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages cannot be empty".to_string(),
            ));
        }

        preprocess::apply(&mut ir, &self.registry);

        let candidates = self.candidates(&ir.model)?;
        let (member, auth) = self.select(&ir.model, &candidates)?;

        let executor = self.manager.executor_for(&member.provider).ok_or_else(|| {
            GatewayError::Internal(format!("no executor registered for {}", member.provider))
        })?;
        let backend = backend_for(&member.provider).ok_or_else(|| {
            GatewayError::Internal(format!("no backend converter for {}", member.provider))
        })?;

        let payload = backend.format_request(&ir, &member.model_id).await?;
        logging::thinking_trace_request(&payload, &member.model_id);

        let request = ExecRequest {
            payload,
            model: member.model_id.clone(),
        };
        let opts = ExecOptions {
            timeout: (!ir.stream).then(|| self.config.request_timeout()),
            alt_sse: true,
        };
        let ctx = CancellationToken::new();
        let started = Instant::now();

        if !ir.stream {
            return self
                .run_unary(
                    dialect, &ir, frontend, backend, executor, ctx, &member, &auth, request,
                    opts, started,
                )
                .await;
        }

        match executor
            .execute_stream(ctx.clone(), &auth, request, opts)
            .await
        {
            Ok(body) => {
                let mut emit_state = StreamEmitState::new(dialect.message_id(), ir.model.clone());
                emit_state.sse = alt_sse;

                let manager = Arc::clone(&self.manager);
                let auth_id = auth.id.clone();
                let provider = member.provider.clone();
                let provider_model = member.model_id.clone();
                let dialect_key = dialect.key();
                let on_finish = Box::new(move |outcome: StreamOutcome| {
                    let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
                        metrics::record_request(
                            dialect_key,
                            &provider,
                            outcome.success,
                            started.elapsed(),
                        );
                        metrics::record_stream_events(dialect_key, outcome.events);
                        let result = result_from_outcome(
                            &auth_id,
                            &provider,
                            &provider_model,
                            &outcome,
                            started,
                        );
                        manager.mark_result(result).await;
                    });
                    fut
                });

                let cfg = PipelineConfig {
                    channel_capacity: 128,
                    scanner: ScannerConfig {
                        idle_timeout: self.config.stream_idle_timeout(),
                        ..Default::default()
                    },
                };
                let frames = spawn_pipeline(
                    ctx, body, backend, frontend, emit_state, &self.watcher, cfg, on_finish,
                );

                let content_type = if dialect == Dialect::Gemini && !alt_sse {
                    "application/json"
                } else {
                    "text/event-stream"
                };
                Ok(ChatOutcome::Stream {
                    frames,
                    content_type,
                })
            }
            Err(e) => {
                self.record_error(&member, &auth, &e, started).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_unary(
        &self,
        dialect: Dialect,
        ir: &IRRequest,
        frontend: Arc<dyn crate::ir::traits::FrontendConverter>,
        backend: Arc<dyn crate::ir::traits::BackendConverter>,
        executor: Arc<dyn crate::executor::Executor>,
        ctx: CancellationToken,
        member: &FamilyMember,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
        started: Instant,
    ) -> Result<ChatOutcome, GatewayError> {
        let response = match executor.execute(ctx, auth, request, opts).await {
            Ok(response) => response,
            Err(e) => {
                self.record_error(member, auth, &e, started).await;
                metrics::record_request(dialect.key(), &member.provider, false, started.elapsed());
                return Err(e);
            }
        };

        let mut ir_response = backend.parse_response(&response.payload, &ir.model).await?;
        if ir_response.id.is_empty() {
            ir_response.id = dialect.message_id();
        }
        let out = frontend.format_response(&ir_response).await?;

        let mut result = ExecResult::success(&auth.id, &member.provider, &member.model_id);
        result.latency = Some(started.elapsed());
        result.bytes = response.payload.len() as u64;
        self.manager.mark_result(result).await;
        metrics::record_request(dialect.key(), &member.provider, true, started.elapsed());

        Ok(ChatOutcome::Unary(out))
    }

    /// Gemini countTokens: ask the provider when it can, else estimate.
    pub async fn handle_count_tokens(
        &self,
        model: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        let frontend = frontend_for("gemini")
            .ok_or_else(|| GatewayError::Internal("no gemini frontend".to_string()))?;
        let mut ir = frontend.parse_request(body).await?;
        ir.model = model.to_string();

        let candidates = self.candidates(&ir.model)?;
        if let Ok((member, auth)) = self.select(&ir.model, &candidates) {
            if let Some(executor) = self.manager.executor_for(&member.provider) {
                let request = ExecRequest {
                    payload: body.to_vec(),
                    model: member.model_id.clone(),
                };
                let opts = ExecOptions {
                    timeout: Some(self.config.request_timeout()),
                    alt_sse: false,
                };
                match executor
                    .count_tokens(CancellationToken::new(), &auth, request, opts)
                    .await
                {
                    Ok(response) => return Ok(response.payload),
                    Err(GatewayError::NotImplemented(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let total = tokenizer::estimate_tokens(&ir);
        Ok(serde_json::to_vec(&json!({ "totalTokens": total }))?)
    }

    /// The ordered (provider, provider_model) candidates for a client model:
    /// family resolution for canonical names, a direct mapping otherwise.
    fn candidates(&self, model: &str) -> Result<Vec<FamilyMember>, GatewayError> {
        if self.registry.is_canonical(model) {
            let available = self.manager.available_providers();
            let resolved = self.registry.resolve_family(model, &available);
            if !resolved.is_empty() {
                return Ok(resolved);
            }
            return Err(GatewayError::NoCredentials {
                provider: "any".to_string(),
                model: model.to_string(),
            });
        }
        if let Some(info) = self.registry.model_info(model) {
            return Ok(vec![FamilyMember {
                provider: info.provider,
                model_id: model.to_string(),
                priority: 1,
            }]);
        }
        Err(GatewayError::InvalidRequest(format!(
            "unknown model: {model}"
        )))
    }

    fn select(
        &self,
        model: &str,
        candidates: &[FamilyMember],
    ) -> Result<(FamilyMember, Auth), GatewayError> {
        for member in candidates {
            if let Some(auth) = self.manager.pick(&member.provider, &member.model_id) {
                info!(
                    model,
                    provider = %member.provider,
                    provider_model = %member.model_id,
                    auth = %auth.id,
                    "selected credential"
                );
                return Ok((member.clone(), auth));
            }
        }
        Err(GatewayError::NoCredentials {
            provider: candidates
                .first()
                .map(|m| m.provider.clone())
                .unwrap_or_else(|| "any".to_string()),
            model: model.to_string(),
        })
    }

    async fn record_error(
        &self,
        member: &FamilyMember,
        auth: &Auth,
        error: &GatewayError,
        started: Instant,
    ) {
        let (status, message, retry_after) = match error {
            GatewayError::Upstream {
                status,
                message,
                retry_after,
            } => (*status, message.clone(), *retry_after),
            other => (0, other.to_string(), None),
        };
        metrics::record_upstream_error(&member.provider, status);

        let mut result = ExecResult::failure(
            &auth.id,
            &member.provider,
            &member.model_id,
            AuthError {
                http_status: status,
                message,
            },
        );
        result.retry_after = retry_after;
        result.latency = Some(started.elapsed());
        self.manager.mark_result(result).await;
    }

    /// OpenAI-style model listing: canonical families plus provider models.
    pub fn list_models_openai(&self) -> serde_json::Value {
        let mut data = Vec::new();
        for canonical in self.registry.list_canonical() {
            data.push(json!({
                "id": canonical,
                "object": "model",
                "owned_by": "llmux",
            }));
        }
        for model in self.registry.list_models() {
            data.push(json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.provider,
            }));
        }
        json!({ "object": "list", "data": data })
    }

    /// Gemini-style model listing.
    pub fn list_models_gemini(&self) -> serde_json::Value {
        let models: Vec<serde_json::Value> = self
            .registry
            .list_models()
            .into_iter()
            .map(|m| {
                json!({
                    "name": format!("models/{}", m.id),
                    "displayName": m.display_name,
                    "outputTokenLimit": m.output_token_limit,
                    "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
                })
            })
            .collect();
        json!({ "models": models })
    }

    /// Re-dialects an error body for the client.
    pub fn error_body(&self, dialect: Dialect, error: &GatewayError) -> (u16, Vec<u8>) {
        let status = error.status_code().as_u16();
        let body = frontend_for(dialect.key())
            .map(|f| f.format_error_body(status, &error.to_string()))
            .unwrap_or_default();
        (status, body)
    }
}

fn result_from_outcome(
    auth_id: &str,
    provider: &str,
    model: &str,
    outcome: &StreamOutcome,
    started: Instant,
) -> ExecResult {
    let mut result = if outcome.success {
        ExecResult::success(auth_id, provider, model)
    } else {
        ExecResult::failure(
            auth_id,
            provider,
            model,
            AuthError {
                http_status: outcome.error_status.unwrap_or(0),
                message: outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "stream failed".to_string()),
            },
        )
    };
    result.latency = Some(started.elapsed());
    result.bytes = outcome.bytes;
    result
}
