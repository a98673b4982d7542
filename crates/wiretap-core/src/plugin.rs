//! Plugin capability traits (spec.md §2.3, §6, §9).
//!
//! The reference dispatches on a source-language interface value; here that
//! becomes a pair of narrow async traits plus an optional `Closer` — the
//! emitter only ever needs `read`, `write`, `close`, `describe` (§9 design
//! note). Trait objects (`Box<dyn Reader>`/`Box<dyn Writer>`) are what the
//! emitter actually stores, so the traits are made object-safe with
//! `async-trait`.

use async_trait::async_trait;

use crate::error::PluginError;
use crate::message::Message;

/// Produces [`Message`]s. Returning [`PluginError::Stopped`] terminates the
/// emitter's copier for this reader (treated the same as clean end-of-stream).
#[async_trait]
pub trait Reader: Send + Sync {
    async fn read(&mut self) -> Result<Option<Message>, PluginError>;
}

/// Consumes [`Message`]s. [`PluginError::ClosedPipe`] is logged and does not
/// end the copier; any other error does.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError>;
}

/// Optional teardown; implementations must make repeated calls a no-op.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> Result<(), PluginError>;
}

/// Human-readable identity for logs, mirroring the reference's `String()`.
pub trait Describe {
    fn describe(&self) -> String;
}

/// Implemented by outputs with `TrackResponses` enabled (HTTP, Binary):
/// lets the Emitter also register the output as an Input, so replayed
/// responses flow back through the pipeline to other outputs (e.g. a file
/// sink recording what origin servers answered).
#[async_trait]
pub trait ResponseSource: Send + Sync {
    async fn next_response(&self) -> Option<Message>;
}
