//! Opaque TCP request/response replay (spec.md §4.11), grounded on
//! `original_source/goreplay/output/output_binary_pro.go`'s dynamic,
//! idle-culled worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use wiretap_core::message::PayloadType;
use wiretap_core::proto::payload_header;
use wiretap_core::time::now_ns;
use wiretap_core::{Closer, Describe, Message, PluginError, Reader, ResponseSource, Writer};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// ~2s of consecutive empty polls before a worker (above the first) exits.
const DEATH_POLLS: u32 = 20;
const DEFAULT_RESPONSE_BUFFER: usize = 100 * 1024;

#[derive(Debug, Clone)]
pub struct BinaryOutputConfig {
    pub addr: String,
    pub track_responses: bool,
    pub response_buffer_size: usize,
    pub max_response_size: usize,
    pub chunk_deadline: Duration,
}

impl Default for BinaryOutputConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            track_responses: false,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER,
            max_response_size: 1024 * 1024,
            chunk_deadline: Duration::from_millis(500),
        }
    }
}

pub struct BinaryOutput {
    config: BinaryOutputConfig,
    tx: mpsc::Sender<Message>,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    responses: Option<Mutex<mpsc::Receiver<Message>>>,
    response_tx: Option<mpsc::Sender<Message>>,
}

impl BinaryOutput {
    pub fn new(config: BinaryOutputConfig) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let (responses, response_tx) = if config.track_responses {
            let (tx, rx) = mpsc::channel(1000);
            (Some(Mutex::new(rx)), Some(tx))
        } else {
            (None, None)
        };

        spawn_worker(config.clone(), rx.clone(), pending.clone(), active.clone(), response_tx.clone());

        Self {
            config,
            tx,
            rx,
            pending,
            active,
            responses,
            response_tx,
        }
    }
}

fn spawn_worker(
    config: BinaryOutputConfig,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    response_tx: Option<mpsc::Sender<Message>>,
) {
    active.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let mut conn: Option<TcpStream> = None;
        let mut idle_polls: u32 = 0;

        loop {
            let msg = {
                let mut guard = rx.lock().await;
                tokio::time::timeout(POLL_INTERVAL, guard.recv()).await
            };

            let msg = match msg {
                Ok(Some(msg)) => {
                    idle_polls = 0;
                    pending.fetch_sub(1, Ordering::Relaxed);
                    msg
                }
                Ok(None) => {
                    active.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                Err(_elapsed) => {
                    idle_polls += 1;
                    if idle_polls > DEATH_POLLS && active.load(Ordering::Relaxed) > 1 {
                        active.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                    continue;
                }
            };

            if conn.is_none() {
                conn = TcpStream::connect(&config.addr).await.ok();
            }
            let Some(stream) = conn.as_mut() else {
                continue;
            };

            match send_and_receive(stream, &msg, &config).await {
                Ok(response) => {
                    if let (Some(tx), Some(body)) = (&response_tx, response) {
                        let uuid_hex = wiretap_core::proto::payload_id(&msg.meta).to_vec();
                        let out = Message::new(
                            payload_header(PayloadType::ReplayedResponse, &uuid_hex, now_ns(), 0),
                            body,
                        );
                        let _ = tx.try_send(out);
                    }
                }
                Err(_) => conn = None,
            }
        }
    });
}

async fn send_and_receive(
    stream: &mut TcpStream,
    msg: &Message,
    config: &BinaryOutputConfig,
) -> std::io::Result<Option<Vec<u8>>> {
    stream.write_all(&msg.data).await?;

    if !config.track_responses {
        return Ok(None);
    }

    let mut buf = Vec::with_capacity(config.response_buffer_size.min(config.max_response_size));
    let mut chunk = [0u8; 8192];
    loop {
        if buf.len() >= config.max_response_size {
            break;
        }
        match tokio::time::timeout(config.chunk_deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let remaining = config.max_response_size - buf.len();
                buf.extend_from_slice(&chunk[..n.min(remaining)]);
                if buf.len() >= config.response_buffer_size {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_timeout) => break,
        }
    }
    Ok(Some(buf))
}

#[async_trait]
impl Writer for BinaryOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        self.tx.send(msg.clone()).await.map_err(|_| PluginError::ClosedPipe)?;
        self.pending.fetch_add(1, Ordering::Relaxed);

        let active = self.active.load(Ordering::Relaxed);
        let pending = self.pending.load(Ordering::Relaxed);
        if pending > active {
            for _ in 0..(pending - active) {
                spawn_worker(
                    self.config.clone(),
                    self.rx.clone(),
                    self.pending.clone(),
                    self.active.clone(),
                    self.response_tx.clone(),
                );
            }
        }
        Ok(msg.len())
    }
}

#[async_trait]
impl Reader for BinaryOutput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        match &self.responses {
            Some(_) => Ok(self.next_response().await),
            None => Err(PluginError::Stopped),
        }
    }
}

#[async_trait]
impl wiretap_core::ResponseSource for BinaryOutput {
    async fn next_response(&self) -> Option<Message> {
        match &self.responses {
            Some(rx) => rx.lock().await.recv().await,
            None => None,
        }
    }
}

#[async_trait]
impl Closer for BinaryOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for BinaryOutput {
    fn describe(&self) -> String {
        format!("binary output {}", self.config.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wiretap_core::proto::payload_header;

    #[tokio::test]
    async fn forwards_request_bytes_and_tracks_the_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            stream.write_all(b"pong").await.unwrap();
        });

        let mut out = BinaryOutput::new(BinaryOutputConfig {
            addr: addr.to_string(),
            track_responses: true,
            chunk_deadline: Duration::from_millis(200),
            ..Default::default()
        });

        let msg = Message::new(payload_header(PayloadType::Request, &[b'f'; 40], 0, 0), b"ping".to_vec());
        out.write(&msg).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), out.read()).await.unwrap().unwrap();
        assert_eq!(response.unwrap().data.as_ref(), b"pong");
    }
}
