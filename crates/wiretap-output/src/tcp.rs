//! Fixed-pool TCP replay output (spec.md §4.9), grounded on
//! `original_source/goreplay/output/output_tcp.go`'s worker/reconnect model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use wiretap_core::hash::fnv1a32;
use wiretap_core::message::PAYLOAD_SEPARATOR;
use wiretap_core::proto::{is_replayed_response_payload, payload_id};
use wiretap_core::{Closer, Describe, Message, PluginError, Writer};

use crate::tls::client_config;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct TcpOutputConfig {
    pub addr: String,
    pub workers: usize,
    pub tls: bool,
    pub insecure_skip_verify: bool,
    pub sticky: bool,
    pub init_message: Option<Vec<u8>>,
    pub write_before_message: Option<Vec<u8>>,
}

impl Default for TcpOutputConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            workers: 1,
            tls: false,
            insecure_skip_verify: false,
            sticky: false,
            init_message: None,
            write_before_message: None,
        }
    }
}

pub struct TcpOutput {
    config: TcpOutputConfig,
    senders: Vec<mpsc::Sender<Message>>,
    round_robin: AtomicUsize,
}

impl TcpOutput {
    pub async fn connect(config: TcpOutputConfig) -> Result<Self, PluginError> {
        let workers = config.workers.max(1);
        let tls_config = if config.tls { Some(client_config(config.insecure_skip_verify)?) } else { None };
        let server_name = host_of(&config.addr)?;

        let mut senders = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            tokio::spawn(worker_loop(
                config.addr.clone(),
                tls_config.clone(),
                server_name.clone(),
                config.init_message.clone(),
                config.write_before_message.clone(),
                rx,
            ));
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

fn host_of(addr: &str) -> Result<ServerName<'static>, PluginError> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    ServerName::try_from(host.to_string()).map_err(|e| PluginError::Config(format!("invalid tls server name {host}: {e}")))
}

async fn dial(
    addr: &str,
    tls_config: &Option<Arc<ClientConfig>>,
    server_name: &ServerName<'static>,
) -> std::io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    let tcp = TcpStream::connect(addr).await?;
    match tls_config {
        Some(cfg) => {
            let connector = TlsConnector::from(cfg.clone());
            let stream = connector.connect(server_name.clone(), tcp).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

fn frame(msg: &Message, preamble: &Option<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + PAYLOAD_SEPARATOR.len());
    if let Some(p) = preamble {
        out.extend_from_slice(p);
    }
    out.extend_from_slice(&msg.meta);
    out.extend_from_slice(&msg.data);
    out.extend_from_slice(PAYLOAD_SEPARATOR);
    out
}

async fn worker_loop(
    addr: String,
    tls_config: Option<Arc<ClientConfig>>,
    server_name: ServerName<'static>,
    init_message: Option<Vec<u8>>,
    write_before_message: Option<Vec<u8>>,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut pending: VecDeque<Message> = VecDeque::new();
    let mut conn: Option<Box<dyn AsyncWrite + Unpin + Send>> = None;

    loop {
        if conn.is_none() {
            loop {
                match dial(&addr, &tls_config, &server_name).await {
                    Ok(mut stream) => {
                        if let Some(init) = &init_message {
                            if stream.write_all(init).await.is_err() {
                                continue;
                            }
                        }
                        conn = Some(stream);
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, addr = %addr, "tcp output dial failed, retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }

        let msg = match pending.pop_front() {
            Some(m) => m,
            None => match rx.recv().await {
                Some(m) => m,
                None => return,
            },
        };

        let stream = conn.as_mut().expect("connected above");
        let bytes = frame(&msg, &write_before_message);
        if stream.write_all(&bytes).await.is_err() {
            pending.push_front(msg);
            conn = None;
        }
    }
}

#[async_trait]
impl Writer for TcpOutput {
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
impl Closer for TcpOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for TcpOutput {
    fn describe(&self) -> String {
        format!("tcp output {}", self.config.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wiretap_core::message::PayloadType;
    use wiretap_core::proto::payload_header;

    #[tokio::test]
    async fn forwards_origin_payloads_to_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let out = TcpOutput::connect(TcpOutputConfig {
            addr: addr.to_string(),
            workers: 1,
            ..Default::default()
        })
        .await
        .unwrap();

        let msg = Message::new(
            payload_header(PayloadType::Request, &[b'd'; 40], 0, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        );
        out.write(&msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(received.ends_with(PAYLOAD_SEPARATOR));
    }

    #[tokio::test]
    async fn replayed_responses_are_dropped() {
        let out = TcpOutput::connect(TcpOutputConfig {
            addr: "127.0.0.1:1".to_string(),
            workers: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        let msg = Message::new(
            payload_header(PayloadType::ReplayedResponse, &[b'e'; 40], 0, 0),
            b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
        );
        assert_eq!(out.write(&msg).await.unwrap(), 0);
    }
}
