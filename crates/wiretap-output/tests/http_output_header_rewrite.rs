//! HTTP output header rewrite (spec.md §4.7): the captured `Host` header is
//! dropped in favor of the target's own host unless `original_host` is set,
//! in which case it is forwarded untouched.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use wiretap_core::proto::payload_header;
use wiretap_core::{Message, PayloadType, Writer};
use wiretap_output::{HttpOutput, HttpOutputConfig};

fn captured_request(host: &str) -> Message {
    let data = format!("GET /hit HTTP/1.1\r\nHost: {host}\r\n\r\n");
    Message::new(
        payload_header(PayloadType::Request, &[b'a'; 40], 0, 0),
        data.into_bytes(),
    )
}

fn host_header(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with("host:"))
        .map(|line| line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
}

async fn serve_once(listener: TcpListener, report: oneshot::Sender<String>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let host = host_header(&buf[..n]).unwrap_or_default();
    stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
    let _ = report.send(host);
}

#[tokio::test]
async fn drops_the_captured_host_header_by_default() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(serve_once(listener, tx));

    let out = HttpOutput::new(HttpOutputConfig {
        url: format!("http://{addr}"),
        workers_min: 1,
        workers_max: 1,
        original_host: false,
        ..Default::default()
    })
    .unwrap();

    out.write(&captured_request("captured-host.example")).await.unwrap();

    let seen_host = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(seen_host, addr.to_string());
}

#[tokio::test]
async fn forwards_the_captured_host_header_when_original_host_is_set() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(serve_once(listener, tx));

    let out = HttpOutput::new(HttpOutputConfig {
        url: format!("http://{addr}"),
        workers_min: 1,
        workers_max: 1,
        original_host: true,
        ..Default::default()
    })
    .unwrap();

    out.write(&captured_request("captured-host.example")).await.unwrap();

    let seen_host = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(seen_host, "captured-host.example");
}
