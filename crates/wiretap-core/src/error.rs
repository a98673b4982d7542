use thiserror::Error;

/// Error taxonomy shared by every plugin seam (spec.md §7).
///
/// `Stopped` and `ClosedPipe` are control-flow signals, not failures: the
/// emitter's copy loop treats them specially rather than propagating them.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The reader has been closed; treated as clean end-of-stream.
    #[error("reading stopped")]
    Stopped,
    /// One writer among several is gone; logged, never fatal to the copier.
    #[error("write on closed pipe")]
    ClosedPipe,
    /// Meta had fewer than 3 fields, or a frame failed to hex-decode.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Connection reset, EOF mid-read, dial failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Bad cert path, bad address, unparseable URL — fatal at start-up.
    #[error("configuration error: {0}")]
    Config(String),
    /// A byte limit configured on the plugin was crossed on this write.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

pub type PluginResult<T> = Result<T, PluginError>;
