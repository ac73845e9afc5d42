// Streaming runtime: pooled buffers, the shared idle watcher, the
// cancellation-aware line scanner, the async result recorder, and the
// per-stream pipeline that ties them together.

pub mod idle;
pub mod pipeline;
pub mod pool;
pub mod recorder;
pub mod scanner;

pub use idle::IdleWatcher;
pub use pipeline::{spawn_pipeline, PipelineConfig, StreamOutcome};
pub use pool::{BufferPool, Chunk, ChunkPool};
pub use recorder::{RecorderConfig, ResultRecorder};
pub use scanner::{LineScanner, ScanError, ScannerConfig};
