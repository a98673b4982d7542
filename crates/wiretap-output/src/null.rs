//! Discards every message silently, no logging. Useful for measuring an
//! Input/Modifier chain's own overhead in isolation.

use async_trait::async_trait;

use wiretap_core::{Closer, Describe, Message, PluginError, Writer};

#[derive(Default)]
pub struct NullOutput;

impl NullOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Writer for NullOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        Ok(msg.len())
    }
}

#[async_trait]
impl Closer for NullOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for NullOutput {
    fn describe(&self) -> String {
        "null output".to_string()
    }
}
