//! TCP capture input (spec.md §4.12), grounded on
//! `original_source/goreplay/input/input_tcp.go`'s accept-and-split loop.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use wiretap_core::message::PAYLOAD_SEPARATOR;
use wiretap_core::proto::payload_meta_with_body;
use wiretap_core::{Closer, Describe, Message, PluginError, Reader};

const CHANNEL_CAPACITY: usize = 1000;

pub struct TlsIdentity {
    pub cert_path: String,
    pub key_path: String,
}

pub struct TcpInput {
    rx: Mutex<mpsc::Receiver<Message>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
    local_addr: std::net::SocketAddr,
}

impl TcpInput {
    pub async fn bind(addr: &str, tls: Option<TlsIdentity>) -> Result<Self, PluginError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PluginError::Config(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PluginError::Config(format!("local_addr: {e}")))?;
        let acceptor = match tls {
            Some(identity) => Some(build_acceptor(&identity)?),
            None => None,
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(listener, acceptor, tx, shutdown_rx));

        Ok(Self {
            rx: Mutex::new(rx),
            shutdown: Mutex::new(Some(shutdown_tx)),
            closed: AtomicBool::new(false),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    tx: mpsc::Sender<Message>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let Ok((stream, _peer)) = accepted else { continue };
                let tx = tx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(tls_stream) = acceptor.accept(stream).await {
                                handle_connection(tls_stream, tx).await;
                            }
                        }
                        None => handle_connection(stream, tx).await,
                    }
                });
            }
        }
    }
}

async fn handle_connection<S: tokio::io::AsyncRead + Unpin>(mut stream: S, tx: mpsc::Sender<Message>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(idx) = find_subslice(&buf, PAYLOAD_SEPARATOR) {
            let frame: Vec<u8> = buf.drain(..idx + PAYLOAD_SEPARATOR.len()).collect();
            let frame = &frame[..frame.len() - PAYLOAD_SEPARATOR.len()];
            if frame.is_empty() {
                continue;
            }
            let (meta, data) = payload_meta_with_body(frame);
            if tx.send(Message::new(meta.to_vec(), data.to_vec())).await.is_err() {
                return;
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn build_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor, PluginError> {
    let certs = load_certs(Path::new(&identity.cert_path))?;
    let key = load_key(Path::new(&identity.key_path))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| PluginError::Config(format!("tls config: {e}")))?;
    Ok(TlsAcceptor::from(std::sync::Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, PluginError> {
    let bytes = std::fs::read(path).map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PluginError::Config(format!("parse cert: {e}")))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, PluginError> {
    let bytes = std::fs::read(path).map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| PluginError::Config(format!("parse key: {e}")))?
        .ok_or_else(|| PluginError::Config(format!("no private key in {}", path.display())))
}

#[async_trait]
impl Reader for TcpInput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[async_trait]
impl Closer for TcpInput {
    async fn close(&self) -> Result<(), PluginError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

impl Describe for TcpInput {
    fn describe(&self) -> String {
        format!("tcp input {}", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use wiretap_core::message::PayloadType;
    use wiretap_core::proto::payload_header;

    #[tokio::test]
    async fn splits_frames_on_the_payload_separator() {
        let mut input = TcpInput::bind("127.0.0.1:0", None).await.unwrap();
        let addr = input.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut frame = payload_header(PayloadType::Request, &[b'c'; 40], 0, 0);
        frame.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        client.write_all(&frame).await.unwrap();
        client.write_all(PAYLOAD_SEPARATOR).await.unwrap();
        client.flush().await.unwrap();

        let msg = input.read().await.unwrap().expect("message");
        assert!(wiretap_core::proto::is_request_payload(&msg.meta));

        Closer::close(&input).await.unwrap();
        Closer::close(&input).await.unwrap();
    }
}
