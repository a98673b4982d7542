//! File sink round trip (spec.md §4.5/§4.6): writes past the chunk limit
//! rotate into `base_0.ext..base_k.ext`, and replaying the glob back through
//! `FileInput` recovers every message in its original order.

use std::time::Duration;

use wiretap_core::proto::{payload_header, payload_meta};
use wiretap_core::{Message, PayloadType, Reader, Writer};
use wiretap_input::FileInput;
use wiretap_output::file::{FileOutput, FileOutputConfig};

fn req(ts_ns: i64) -> Message {
    Message::new(
        payload_header(PayloadType::Request, &[b'a'; 40], ts_ns, 0),
        b"GET / HTTP/1.1\r\n\r\n".to_vec(),
    )
}

#[tokio::test]
async fn chunked_writes_replay_in_order_through_a_glob() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("capture.gor");

    let mut cfg = FileOutputConfig::default();
    cfg.path_template = base.to_string_lossy().to_string();
    cfg.queue_limit = 2;
    let out = FileOutput::new(cfg);

    const MESSAGE_COUNT: i64 = 5;
    const CHUNK_SIZE: i64 = 2;
    for ts in 0..MESSAGE_COUNT {
        out.write(&req(ts)).await.unwrap();
    }
    out.flush().unwrap();

    let expected_chunks = (MESSAGE_COUNT + CHUNK_SIZE - 1) / CHUNK_SIZE;
    let mut entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());
    assert_eq!(entries.len() as i64, expected_chunks);

    let glob_pattern = dir.path().join("capture_*.gor").to_string_lossy().to_string();
    let mut input = FileInput::open(&glob_pattern, false, Duration::from_millis(0), true).await.unwrap();

    let mut seen = Vec::new();
    loop {
        match input.read().await {
            Ok(Some(msg)) => {
                let fields = payload_meta(&msg.meta);
                let ts: i64 = std::str::from_utf8(fields[2]).unwrap().parse().unwrap();
                seen.push(ts);
            }
            _ => break,
        }
    }

    assert_eq!(seen, (0..MESSAGE_COUNT).collect::<Vec<_>>());
}
