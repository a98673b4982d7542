//! WebSocket replay output (spec.md §4.10): same worker/routing/reconnect
//! shape as [`crate::tcp::TcpOutput`], framed as one binary WS message per
//! captured payload instead of a length-delimited byte stream. Grounded on
//! `original_source/goreplay/output/output_ws.go`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use wiretap_core::hash::fnv1a32;
use wiretap_core::proto::{is_replayed_response_payload, payload_id};
use wiretap_core::{Closer, Describe, Message, PluginError, Writer};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct WebSocketOutputConfig {
    pub url: String,
    pub workers: usize,
    pub sticky: bool,
    pub headers: Vec<(String, String)>,
}

pub struct WebSocketOutput {
    config: WebSocketOutputConfig,
    senders: Vec<mpsc::Sender<Message>>,
    round_robin: AtomicUsize,
}

impl WebSocketOutput {
    pub async fn connect(config: WebSocketOutputConfig) -> Result<Self, PluginError> {
        let workers = config.workers.max(1);
        let request = build_request(&config.url, &config.headers)?;

        let mut senders = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            tokio::spawn(worker_loop(request_template(&request), rx));
            senders.push(tx);
        }

        Ok(Self {
            config,
            senders,
            round_robin: AtomicUsize::new(0),
        })
    }

    fn pick_worker(&self, msg: &Message) -> usize {
        let n = self.senders.len();
        if self.config.sticky {
            let id = payload_id(&msg.meta);
            if id.is_empty() {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % n
            } else {
                fnv1a32(wiretap_core::session_prefix(id)) as usize % n
            }
        } else {
            self.round_robin.fetch_add(1, Ordering::Relaxed) % n
        }
    }
}

/// Basic-auth-from-userinfo plus arbitrary configured headers (spec.md §4.10).
fn build_request(url: &str, headers: &[(String, String)]) -> Result<Request<()>, PluginError> {
    let (auth, stripped) = extract_userinfo(url);
    let mut builder = Request::builder().uri(stripped.clone());
    if let Some(auth) = auth {
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth);
        builder = builder.header("Authorization", format!("Basic {encoded}"));
    }
    for (k, v) in headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    builder
        .body(())
        .map_err(|e| PluginError::Config(format!("invalid websocket url {url}: {e}")))
}

fn extract_userinfo(url: &str) -> (Option<String>, String) {
    let Some(scheme_end) = url.find("://") else {
        return (None, url.to_string());
    };
    let (scheme, rest) = url.split_at(scheme_end + 3);
    match rest.find('@') {
        Some(at) => {
            let userinfo = &rest[..at];
            let host_and_path = &rest[at + 1..];
            (Some(userinfo.to_string()), format!("{scheme}{host_and_path}"))
        }
        None => (None, url.to_string()),
    }
}

/// `tungstenite::Request` isn't `Clone`; rebuild per reconnect from the
/// pieces that matter.
fn request_template(req: &Request<()>) -> (String, Vec<(String, String)>) {
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    (uri, headers)
}

fn rebuild_request(template: &(String, Vec<(String, String)>)) -> Result<Request<()>, PluginError> {
    let mut builder = Request::builder().uri(template.0.clone());
    for (k, v) in &template.1 {
        builder = builder.header(k.as_str(), v.as_str());
    }
    builder.body(()).map_err(|e| PluginError::Config(e.to_string()))
}

async fn worker_loop(template: (String, Vec<(String, String)>), mut rx: mpsc::Receiver<Message>) {
    let mut pending: VecDeque<Message> = VecDeque::new();

    'outer: loop {
        let socket = loop {
            let request = match rebuild_request(&template) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket output bad request, giving up");
                    return;
                }
            };
            match tokio_tungstenite::connect_async(request).await {
                Ok((socket, _)) => break socket,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket output connect failed, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        };
        let (mut sink, mut stream) = socket.split();
        tokio::spawn(async move { while stream.next().await.is_some() {} });

        loop {
            let msg = match pending.pop_front() {
                Some(m) => m,
                None => match rx.recv().await {
                    Some(m) => m,
                    None => return,
                },
            };
            let mut frame = Vec::with_capacity(msg.len());
            frame.extend_from_slice(&msg.meta);
            frame.extend_from_slice(&msg.data);
            if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                pending.push_front(msg);
                continue 'outer;
            }
        }
    }
}

#[async_trait]
impl Writer for WebSocketOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        if is_replayed_response_payload(&msg.meta) {
            return Ok(0);
        }
        let idx = self.pick_worker(msg);
        self.senders[idx]
            .send(msg.clone())
            .await
            .map_err(|_| PluginError::ClosedPipe)?;
        Ok(msg.len())
    }
}

#[async_trait]
impl Closer for WebSocketOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for WebSocketOutput {
    fn describe(&self) -> String {
        format!("websocket output {}", self.config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userinfo_is_extracted_and_stripped() {
        let (auth, stripped) = extract_userinfo("ws://alice:secret@example.com/path");
        assert_eq!(auth.as_deref(), Some("alice:secret"));
        assert_eq!(stripped, "ws://example.com/path");
    }

    #[test]
    fn plain_url_has_no_userinfo() {
        let (auth, stripped) = extract_userinfo("ws://example.com/path");
        assert!(auth.is_none());
        assert_eq!(stripped, "ws://example.com/path");
    }
}
