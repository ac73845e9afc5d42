// Per-stream pipeline: idle-watched line scanner -> provider parse (inline)
// -> IR events -> client-dialect emit -> bounded channel to the HTTP writer.
// Exactly one task is spawned per stream; everything else rides on the
// shared idle watcher and the result-recorder pool.

use super::idle::IdleWatcher;
use super::scanner::{ByteStream, LineScanner, ScanError, ScannerConfig};
use crate::error::GatewayError;
use crate::ir::traits::{BackendConverter, FrontendConverter, StreamEmitState, StreamParseState};
use crate::ir::types::{IREvent, IRFinishReason, IRUsage};
use crate::logging;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the frame channel to the HTTP writer.
    pub channel_capacity: usize,
    pub scanner: ScannerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
            scanner: ScannerConfig::default(),
        }
    }
}

/// What the stream amounted to, for result recording.
#[derive(Debug, Default, Clone)]
pub struct StreamOutcome {
    pub success: bool,
    pub error_status: Option<u16>,
    pub error_message: Option<String>,
    pub bytes: u64,
    pub events: u64,
    pub usage: Option<IRUsage>,
}

pub type FinishHook = Box<dyn FnOnce(StreamOutcome) -> BoxFuture<'static, ()> + Send>;

/// Spawns the stream-processing task and returns the frame channel the HTTP
/// writer drains. The task owns the scanner and both converters; `on_finish`
/// runs once after the stream ends, successful or not.
pub fn spawn_pipeline(
    cancel: CancellationToken,
    body: ByteStream,
    backend: Arc<dyn BackendConverter>,
    frontend: Arc<dyn FrontendConverter>,
    mut emit_state: StreamEmitState,
    watcher: &IdleWatcher,
    cfg: PipelineConfig,
    on_finish: FinishHook,
) -> mpsc::Receiver<Result<String, GatewayError>> {
    let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
    let mut scanner = LineScanner::new(cancel, body, watcher, cfg.scanner);
    let model = emit_state.model.clone();

    tokio::spawn(async move {
        let mut parse_state = StreamParseState::default();
        let mut outcome = StreamOutcome {
            success: true,
            ..Default::default()
        };

        'scan: loop {
            match scanner.scan().await {
                Ok(true) => {
                    let line = scanner.line();
                    if line.is_empty() {
                        continue;
                    }
                    outcome.bytes += line.len() as u64 + 1;
                    logging::thinking_trace_line(line, &model);

                    let events = match backend.parse_stream_line(line, &mut parse_state) {
                        Ok(events) => events,
                        Err(e) => {
                            // A malformed upstream line never kills the
                            // stream; log it and keep scanning.
                            warn!(model = %model, error = %e, "skipping malformed upstream line");
                            continue;
                        }
                    };

                    for event in events {
                        logging::thinking_trace_event(&event, &model);
                        note_event(&event, &mut outcome);
                        if !emit(&frontend, &event, &mut emit_state, &tx).await {
                            break 'scan;
                        }
                    }

                    if parse_state.done {
                        break;
                    }
                }
                Ok(false) => {
                    // EOF without a terminal chunk: synthesize the finish so
                    // clients always see a proper termination.
                    if !parse_state.done && !emit_state.finish_seen {
                        let mut events = parse_state.take_tool_calls();
                        events.push(IREvent::Finish {
                            reason: parse_state.finish_reason.unwrap_or(IRFinishReason::Stop),
                            usage: Some(parse_state.usage),
                        });
                        for event in events {
                            note_event(&event, &mut outcome);
                            if !emit(&frontend, &event, &mut emit_state, &tx).await {
                                break;
                            }
                        }
                    }
                    break;
                }
                Err(ScanError::Cancelled) => {
                    outcome.success = false;
                    outcome.error_message = Some("request cancelled".to_string());
                    break;
                }
                Err(ScanError::IdleAborted) => {
                    // Idle abort is surfaced as a truncated stream, distinct
                    // from normal EOF, and recorded as a transient failure.
                    outcome.success = false;
                    outcome.error_status = Some(408);
                    outcome.error_message = Some("upstream idle timeout".to_string());
                    let event = IREvent::Error {
                        message: "stream truncated: no upstream activity within the idle timeout"
                            .to_string(),
                        status: Some(408),
                    };
                    emit(&frontend, &event, &mut emit_state, &tx).await;
                    break;
                }
                Err(e) => {
                    outcome.success = false;
                    outcome.error_message = Some(e.to_string());
                    let event = IREvent::Error {
                        message: e.to_string(),
                        status: None,
                    };
                    emit(&frontend, &event, &mut emit_state, &tx).await;
                    break;
                }
            }
        }

        if let Some(frame) = frontend.format_stream_end(&mut emit_state) {
            let _ = tx.send(Ok(frame)).await;
        }
        scanner.close();
        drop(tx);

        on_finish(outcome).await;
    });

    rx
}

fn note_event(event: &IREvent, outcome: &mut StreamOutcome) {
    outcome.events += 1;
    match event {
        IREvent::Finish { usage, .. } => outcome.usage = *usage,
        IREvent::Error { message, status } => {
            outcome.success = false;
            outcome.error_status = *status;
            outcome.error_message = Some(message.clone());
        }
        _ => {}
    }
}

/// Emits one event through the frontend. Returns false when the client went
/// away and the pipeline should stop.
async fn emit(
    frontend: &Arc<dyn FrontendConverter>,
    event: &IREvent,
    state: &mut StreamEmitState,
    tx: &mpsc::Sender<Result<String, GatewayError>>,
) -> bool {
    match frontend.format_stream_event(event, state) {
        Ok(Some(frame)) if !frame.is_empty() => tx.send(Ok(frame)).await.is_ok(),
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "failed to translate stream event");
            tx.send(Err(e)).await.is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::converters::{GeminiBackend, OpenAIFrontend};
    use bytes::Bytes;
    use futures_util::stream;
    use std::time::Duration;

    fn body_from(lines: &'static [&'static [u8]]) -> ByteStream {
        Box::pin(stream::iter(
            lines
                .iter()
                .map(|l| Ok(Bytes::from_static(l)))
                .collect::<Vec<Result<Bytes, std::io::Error>>>(),
        ))
    }

    #[tokio::test]
    async fn test_pipeline_translates_gemini_to_openai() {
        let watcher = IdleWatcher::new(Duration::from_millis(50));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let body = body_from(&[
            br#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            b"\n",
            br#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2,"totalTokenCount":3}}"#,
            b"\n",
        ]);

        let mut rx = spawn_pipeline(
            CancellationToken::new(),
            body,
            Arc::new(GeminiBackend),
            Arc::new(OpenAIFrontend),
            StreamEmitState::new("chatcmpl-1", "gemini-2.5-flash"),
            &watcher,
            PipelineConfig::default(),
            Box::new(move |outcome| {
                Box::pin(async move {
                    let _ = done_tx.send(outcome);
                })
            }),
        );

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame.unwrap());
        }

        assert!(frames.iter().any(|f| f.contains("Hel")));
        assert!(frames.iter().any(|f| f.contains(r#""finish_reason":"stop""#)));
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");

        let outcome = done_rx.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.usage.unwrap().total_tokens, 3);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_pipeline_skips_malformed_lines() {
        let watcher = IdleWatcher::new(Duration::from_millis(50));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let body = body_from(&[
            b"data: this is not json\n",
            br#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]},"finishReason":"STOP"}]}"#,
            b"\n",
        ]);

        let mut rx = spawn_pipeline(
            CancellationToken::new(),
            body,
            Arc::new(GeminiBackend),
            Arc::new(OpenAIFrontend),
            StreamEmitState::new("chatcmpl-2", "gemini-2.5-flash"),
            &watcher,
            PipelineConfig::default(),
            Box::new(move |outcome| {
                Box::pin(async move {
                    let _ = done_tx.send(outcome);
                })
            }),
        );

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame.unwrap());
        }
        assert!(frames.iter().any(|f| f.contains("ok")));

        let outcome = done_rx.await.unwrap();
        assert!(outcome.success);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_idle_abort_truncates_stream() {
        use futures_util::StreamExt;
        let watcher = IdleWatcher::new(Duration::from_millis(20));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let hanging: ByteStream = Box::pin(
            stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from_static(
                    br#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"one"}]}}]}
"#,
                ))
            })
            .chain(stream::once(async {
                futures_util::future::pending::<()>().await;
                Ok::<_, std::io::Error>(Bytes::new())
            })),
        );

        let cfg = PipelineConfig {
            channel_capacity: 16,
            scanner: ScannerConfig {
                idle_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        };

        let started = std::time::Instant::now();
        let mut rx = spawn_pipeline(
            CancellationToken::new(),
            hanging,
            Arc::new(GeminiBackend),
            Arc::new(OpenAIFrontend),
            StreamEmitState::new("chatcmpl-3", "gemini-2.5-flash"),
            &watcher,
            cfg,
            Box::new(move |outcome| {
                Box::pin(async move {
                    let _ = done_tx.send(outcome);
                })
            }),
        );

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame.unwrap());
        }

        // The one delivered event arrives, then the truncation indicator.
        assert!(frames.iter().any(|f| f.contains("one")));
        assert!(frames.iter().any(|f| f.contains("truncated")));

        let outcome = done_rx.await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_status, Some(408));
        // The stream task exits promptly after the idle fire.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(watcher.active_count(), 0);
        watcher.shutdown();
    }
}
