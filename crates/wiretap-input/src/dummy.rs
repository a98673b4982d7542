//! Synthetic traffic source for smoke-testing a pipeline without a real
//! capture source (spec.md Non-goal list implies Dummy exists purely for
//! that purpose — see `original_source/goreplay/input/input_dummy.go`).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Interval};

use wiretap_core::message::{PayloadType, Uuid};
use wiretap_core::proto::payload_header;
use wiretap_core::time::now_ns;
use wiretap_core::{Describe, Message, PluginError, Reader};

const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Emits one GET request followed by its 200 response, once per tick.
pub struct DummyInput {
    ticker: Interval,
    pending: VecDeque<Message>,
}

impl DummyInput {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_PERIOD)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            ticker: time::interval(period),
            pending: VecDeque::new(),
        }
    }
}

impl Default for DummyInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reader for DummyInput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        self.ticker.tick().await;

        let uuid = Uuid::random();
        let ts = now_ns();
        let request = Message::new(
            payload_header(PayloadType::Request, uuid.hex().as_bytes(), ts, 0),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec(),
        );
        let response = Message::new(
            payload_header(PayloadType::Response, uuid.hex().as_bytes(), now_ns(), 0),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        self.pending.push_back(response);
        Ok(Some(request))
    }
}

impl Describe for DummyInput {
    fn describe(&self) -> String {
        "dummy input".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_a_request_response_pair_per_tick() {
        let mut input = DummyInput::with_period(Duration::from_millis(1));
        let first = input.read().await.unwrap().unwrap();
        let second = input.read().await.unwrap().unwrap();
        assert!(wiretap_core::proto::is_request_payload(&first.meta));
        assert!(wiretap_core::proto::is_response_payload(&second.meta));
        assert_eq!(
            wiretap_core::proto::payload_id(&first.meta),
            wiretap_core::proto::payload_id(&second.meta)
        );
    }
}
