//! Discards nothing — logs every write at debug level. Used for smoke-testing
//! an Input/Modifier chain without a real sink.

use async_trait::async_trait;

use wiretap_core::{Closer, Describe, Message, PluginError, Writer};

#[derive(Default)]
pub struct DummyOutput;

impl DummyOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Writer for DummyOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        tracing::debug!(bytes = msg.len(), "dummy output received message");
        Ok(msg.len())
    }
}

#[async_trait]
impl Closer for DummyOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for DummyOutput {
    fn describe(&self) -> String {
        "dummy output".to_string()
    }
}
