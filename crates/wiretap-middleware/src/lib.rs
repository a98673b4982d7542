//! External-process modifier bridge (spec.md §4.4).
//!
//! Spawns a child process and exchanges frames over its stdio: every message
//! read from any Input is hex-encoded as `meta ∥ data ∥ "\n"` and written to
//! the child's stdin; lines the child writes to stdout are hex-decoded back
//! into [`Message`]s and become the Emitter's sole effective input. A
//! bounded channel (capacity 1000) separates the feeding side from the
//! reading side so a slow child can't block every Input's copier.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use wiretap_core::{Closer, Message, PluginError, Reader};

const CHANNEL_CAPACITY: usize = 1000;

pub struct Middleware {
    child: Mutex<Child>,
    feed_tx: mpsc::Sender<Message>,
    read_rx: Mutex<mpsc::Receiver<Message>>,
    closed: AtomicBool,
}

impl Middleware {
    /// Spawns `command` (split on whitespace, first token is the program)
    /// and wires its stdio to the feed/read channels.
    pub async fn spawn(command: &str) -> Result<Self, PluginError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PluginError::Config("empty middleware command".into()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PluginError::Config(format!("spawn middleware: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Config("middleware stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Config("middleware stdout unavailable".into()))?;

        let (feed_tx, mut feed_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let (read_tx, read_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = feed_rx.recv().await {
                let frame = encode_frame(&msg);
                if stdin.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(msg) = decode_frame(line.as_bytes()) {
                            if read_tx.send(msg).await.is_err() {
                                break;
                            }
                        } else {
                            tracing::debug!("middleware: dropping malformed frame");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "middleware stdout read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            feed_tx,
            read_rx: Mutex::new(read_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Queues a message read from some Input to be rewritten by the child.
    pub async fn feed(&self, msg: &Message) -> Result<(), PluginError> {
        self.feed_tx
            .send(msg.clone())
            .await
            .map_err(|_| PluginError::ClosedPipe)
    }
}

#[async_trait]
impl Reader for Middleware {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        let mut rx = self.read_rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[async_trait]
impl Closer for Middleware {
    /// Idempotent: a SIGKILL'd child exiting is treated as a clean stop, not
    /// an error, matching the reference's tolerance for signal-based teardown.
    async fn close(&self) -> Result<(), PluginError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }
}

fn encode_frame(msg: &Message) -> Vec<u8> {
    let mut raw = Vec::with_capacity(msg.len() + 1);
    raw.extend_from_slice(&msg.meta);
    raw.extend_from_slice(&msg.data);
    raw.push(b'\n');
    let mut out = hex::encode(raw).into_bytes();
    out.push(b'\n');
    out
}

fn decode_frame(line: &[u8]) -> Option<Message> {
    let raw = hex::decode(line).ok()?;
    let trimmed = raw.strip_suffix(b"\n").unwrap_or(&raw);
    let nl = trimmed.iter().position(|&b| b == b'\n')?;
    let (meta, data) = (&trimmed[..=nl], &trimmed[nl + 1..]);
    Some(Message::new(meta.to_vec(), data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::PayloadType;
    use wiretap_core::proto::payload_header;

    #[test]
    fn frame_round_trips_through_hex() {
        let msg = Message::new(
            payload_header(PayloadType::Request, &[b'a'; 40], 1, 2),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        );
        let encoded = encode_frame(&msg);
        let line = &encoded[..encoded.len() - 1];
        let decoded = decode_frame(line).unwrap();
        assert_eq!(decoded.meta, msg.meta);
        assert_eq!(decoded.data, msg.data);
    }

    #[tokio::test]
    async fn cat_echoes_fed_messages() {
        let mw = Middleware::spawn("cat").await.unwrap();
        let msg = Message::new(
            payload_header(PayloadType::Request, &[b'b'; 40], 1, 2),
            b"GET /echo HTTP/1.1\r\n\r\n".to_vec(),
        );
        mw.feed(&msg).await.unwrap();
        let mut mw = mw;
        let got = mw.read().await.unwrap().expect("cat should echo the frame back");
        assert_eq!(got.data, msg.data);
        Closer::close(&mw).await.unwrap();
    }
}
