//! In-memory plugin doubles for exercising the emitter and modifiers without
//! real sockets or files, mirroring `bootstrap.NewTestOutput`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::PluginError;
use crate::message::Message;
use crate::plugin::{Closer, Describe, Reader, Writer};

/// Records every [`Message`] written to it for later assertion.
#[derive(Clone, Default)]
pub struct TestOutput {
    received: Arc<Mutex<Vec<Message>>>,
}

impl TestOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a [`Writer`] handle backed by this recorder. Cloning keeps
    /// the same underlying buffer, so the handle can be moved into an
    /// emitter while the test keeps `self` to inspect what arrived.
    pub fn writer(&self) -> TestOutputWriter {
        TestOutputWriter(self.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.received.lock().expect("poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct TestOutputWriter(TestOutput);

#[async_trait]
impl Writer for TestOutputWriter {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        let len = msg.len();
        self.0.received.lock().expect("poisoned").push(msg.clone());
        Ok(len)
    }
}

#[async_trait]
impl Closer for TestOutputWriter {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for TestOutputWriter {
    fn describe(&self) -> String {
        "test output".to_string()
    }
}

/// Replays a fixed queue of messages, then signals [`PluginError::Stopped`].
pub struct TestInput {
    queue: VecDeque<Message>,
}

impl TestInput {
    pub fn new(messages: impl IntoIterator<Item = Message>) -> Self {
        Self {
            queue: messages.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Reader for TestInput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        Ok(self.queue.pop_front())
    }
}

impl Describe for TestInput {
    fn describe(&self) -> String {
        "test input".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PayloadType;
    use crate::proto::payload_header;

    fn sample() -> Message {
        Message::new(
            payload_header(PayloadType::Request, &[b'a'; 40], 0, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )
    }

    #[tokio::test]
    async fn output_records_writes() {
        let out = TestOutput::new();
        let w = out.writer();
        w.write(&sample()).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn input_replays_then_drains() {
        let mut input = TestInput::new([sample(), sample()]);
        assert!(input.read().await.unwrap().is_some());
        assert!(input.read().await.unwrap().is_some());
        assert!(input.read().await.unwrap().is_none());
    }
}
