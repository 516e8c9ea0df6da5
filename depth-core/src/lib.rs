pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod video;

/// Initializes ffmpeg's global state and the tracing subscriber. Call once
/// at process startup; safe to call more than once (logging init no-ops
/// after the first call).
pub fn init(default_log_level: &str) {
    ffmpeg::init().expect("failed to init ffmpeg");
    telemetry::log::init(default_log_level);
}
