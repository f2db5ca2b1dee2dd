//! Server-side frame analysis: transcode branch, frame delimiting, worker
//! pool and the per-room pipeline tying them together.

pub mod analyzer;
pub mod codec;
pub mod pipeline;
pub mod pool;
pub mod transcoder;

pub use analyzer::{AnalyzerFactory, factory_for};
pub use pipeline::AnalysisPipeline;
pub use pool::WorkerPool;
pub use transcoder::{FfmpegTranscoder, Transcoder};
