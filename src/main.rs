use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use llmux::config::Config;
use llmux::error::GatewayError;
use llmux::executor::{AnthropicExecutor, GeminiExecutor, OpenAIExecutor};
use llmux::logging;
use llmux::metrics;
use llmux::orchestrator::{ChatOutcome, Dialect, Gateway, GeminiRoute};
use llmux::provider::{Auth, FileTokenStore, Manager, ManagerConfig, TokenStore};
use llmux::registry::ModelRegistry;
use llmux::stream::{IdleWatcher, RecorderConfig};

#[derive(Parser, Debug)]
#[command(name = "llmux")]
#[command(about = "LLM multiplexing gateway: one API surface, many upstream accounts")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = "config.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve {
        /// Port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Store an API-key credential for a provider
    Login {
        /// Provider key: openai, anthropic or gemini
        provider: String,
        #[arg(long)]
        api_key: String,
        /// Base URL override for this credential
        #[arg(long)]
        endpoint: Option<String>,
        /// HTTP(S) proxy for this credential
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Import credential JSON files from a file or directory
    Import { path: String },
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    metrics_handle: Option<Arc<metrics_exporter_prometheus::PrometheusHandle>>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        info!(
            "Could not load config file '{}': {}. Using defaults.",
            cli.config, e
        );
        Config::default()
    });

    let result = match cli.command {
        None => serve(config, None).await,
        Some(Command::Serve { port }) => serve(config, port).await,
        Some(Command::Login {
            provider,
            api_key,
            endpoint,
            proxy,
        }) => login(&config, &provider, &api_key, endpoint, proxy),
        Some(Command::Import { path }) => import(&config, &path),
    };

    if let Err(e) = result {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn serve(config: Config, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    info!("Starting llmux gateway");

    let metrics_handle = if config.performance.enable_metrics {
        match metrics::init() {
            Ok(handle) => {
                info!("Prometheus metrics available at /metrics");
                Some(Arc::new(handle))
            }
            Err(e) => {
                warn!("metrics disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let registry = Arc::new(ModelRegistry::new());
    let store = Arc::new(FileTokenStore::new(&config.auth_dir));
    let manager = Arc::new(Manager::new(
        Arc::clone(&store) as Arc<dyn TokenStore>,
        Arc::clone(&registry),
        None,
        ManagerConfig {
            recorder: RecorderConfig {
                queue_size: config.performance.result_queue_size,
                workers: config.performance.result_workers,
            },
            quota_ladder: config.quota_ladder(),
        },
    ));

    manager.register_executor(Arc::new(OpenAIExecutor));
    manager.register_executor(Arc::new(AnthropicExecutor));
    manager.register_executor(Arc::new(GeminiExecutor));

    let mut loaded = 0usize;
    for auth in store.list()? {
        info!(auth = %auth.id, provider = %auth.provider, "loaded credential");
        manager.register(auth);
        loaded += 1;
    }
    register_config_credentials(&config, &manager);
    if loaded == 0 && config.providers.is_empty() {
        warn!("no credentials configured; requests will fail until `llmux login` is run");
    }

    let watcher = Arc::new(IdleWatcher::new(Duration::from_millis(250)));
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&manager),
        registry,
        Arc::clone(&watcher),
        Arc::clone(&config),
    ));

    let state = AppState {
        gateway,
        metrics_handle,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // OpenAI dialects
        .route("/v1/models", get(list_models_openai))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/responses", post(handle_responses))
        // Anthropic dialect
        .route("/v1/messages", post(handle_anthropic_messages))
        // Gemini dialect
        .route("/v1beta/models", get(list_models_gemini))
        .route("/v1beta/models/*path", post(handle_gemini_model_call))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = port_override.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    // Drain pending result records before exit.
    manager.stop().await;
    watcher.shutdown();
    Ok(())
}

fn register_config_credentials(config: &Config, manager: &Manager) {
    let existing: Vec<String> = manager.list().iter().map(|a| a.provider.clone()).collect();
    for (provider, pc) in &config.providers {
        let Some(api_key) = &pc.api_key else { continue };
        if existing.iter().any(|p| p == provider) {
            continue;
        }
        let mut auth = Auth::new(format!("config-{provider}"), provider.clone());
        auth.attributes
            .insert("api_key".to_string(), api_key.clone());
        if let Some(endpoint) = &pc.endpoint {
            auth.attributes
                .insert("endpoint".to_string(), endpoint.clone());
        }
        auth.proxy_url = pc.proxy_url.clone();
        info!(provider = %provider, "registered credential from config");
        manager.register(auth);
    }
}

fn login(
    config: &Config,
    provider: &str,
    api_key: &str,
    endpoint: Option<String>,
    proxy: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !matches!(provider, "openai" | "anthropic" | "gemini") {
        return Err(format!("unknown provider: {provider}").into());
    }
    let store = FileTokenStore::new(&config.auth_dir);
    let id = format!("{provider}-{}", uuid::Uuid::new_v4().simple());
    let mut auth = Auth::new(id.clone(), provider);
    auth.attributes
        .insert("api_key".to_string(), api_key.to_string());
    if let Some(endpoint) = endpoint {
        auth.attributes.insert("endpoint".to_string(), endpoint);
    }
    auth.proxy_url = proxy;
    store.save(&auth)?;
    println!("saved credential {id} to {}", config.auth_dir);
    Ok(())
}

fn import(config: &Config, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileTokenStore::new(&config.auth_dir);
    let source = std::path::Path::new(path);
    let files: Vec<std::path::PathBuf> = if source.is_dir() {
        std::fs::read_dir(source)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect()
    } else {
        vec![source.to_path_buf()]
    };

    let mut imported = 0usize;
    for file in files {
        let content = std::fs::read_to_string(&file)?;
        match serde_json::from_str::<Auth>(&content) {
            Ok(auth) => {
                store.save(&auth)?;
                println!("imported {}", auth.id);
                imported += 1;
            }
            Err(e) => warn!(file = %file.display(), "skipping: {e}"),
        }
    }
    println!("imported {imported} credential(s) into {}", config.auth_dir);
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "llmux" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn list_models_openai(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.list_models_openai())
}

async fn list_models_gemini(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.list_models_gemini())
}

async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch_chat(state, Dialect::OpenAI, body, None).await
}

async fn handle_responses(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch_chat(state, Dialect::Responses, body, None).await
}

async fn handle_anthropic_messages(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch_chat(state, Dialect::Anthropic, body, None).await
}

/// Gemini calls carry the model and method in the path:
/// `/v1beta/models/{model}:{generateContent|streamGenerateContent|countTokens}`.
async fn handle_gemini_model_call(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some((model, method)) = path.rsplit_once(':') else {
        return error_response(
            &state,
            Dialect::Gemini,
            &GatewayError::InvalidRequest(format!("malformed model path: {path}")),
        );
    };
    let alt_sse = params.get("alt").map(|v| v == "sse").unwrap_or(false);

    match method {
        "generateContent" | "streamGenerateContent" => {
            let route = GeminiRoute {
                model: model.to_string(),
                stream: method == "streamGenerateContent",
                alt_sse,
            };
            dispatch_chat(state, Dialect::Gemini, body, Some(route)).await
        }
        "countTokens" => match state.gateway.handle_count_tokens(model, &body).await {
            Ok(payload) => json_response(StatusCode::OK, payload),
            Err(e) => error_response(&state, Dialect::Gemini, &e),
        },
        other => error_response(
            &state,
            Dialect::Gemini,
            &GatewayError::InvalidRequest(format!("unsupported method: {other}")),
        ),
    }
}

async fn dispatch_chat(
    state: AppState,
    dialect: Dialect,
    body: Bytes,
    route: Option<GeminiRoute>,
) -> Response {
    match state.gateway.handle_chat(dialect, &body, route).await {
        Ok(ChatOutcome::Unary(payload)) => json_response(StatusCode::OK, payload),
        Ok(ChatOutcome::Stream {
            frames,
            content_type,
        }) => {
            let stream = ReceiverStream::new(frames).map(|frame| {
                frame
                    .map(Bytes::from)
                    .map_err(|e| std::io::Error::other(e.to_string()))
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => error_response(&state, dialect, &e),
    }
}

fn json_response(status: StatusCode, payload: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(state: &AppState, dialect: Dialect, error: &GatewayError) -> Response {
    let (status, body) = state.gateway.error_body(dialect, error);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let GatewayError::Upstream {
        retry_after: Some(delay),
        ..
    } = error
    {
        builder = builder.header(header::RETRY_AFTER, delay.as_secs().to_string());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
