use thiserror::Error;

/// Failures that can happen while bringing a stream pipeline up.
///
/// These surface as HTTP 500 from the playlist route; everything that goes
/// wrong after startup is handled inside the worker (skip packet, abandon
/// segment, wait for the next keyframe) and never reaches a client directly.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("failed to open upstream: {0}")]
    UpstreamOpen(String),

    #[error("upstream has no usable audio or video stream")]
    MissingStream,

    #[error("codec setup failed: {0}")]
    CodecInit(String),

    #[error("stream registry is full")]
    CapacityExhausted,
}
