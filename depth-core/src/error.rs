use thiserror::Error;

/// Error taxonomy for the streaming pipeline's disposition rules.
///
/// Most of these are caught at a task boundary and logged rather than
/// propagated; see `pipeline` for where each variant is handled.
#[derive(Debug, Error)]
pub enum DepthError {
    #[error("end of stream")]
    EndOfStream,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, DepthError>;
