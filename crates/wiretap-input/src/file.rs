//! Capture-file replay (spec.md §4.6), grounded on
//! `original_source/goreplay/input/input_file.go`'s timing and looping
//! behavior, reworked around a preloaded message queue instead of streaming
//! file reads since the payload separator framing makes buffering simple and
//! every capture file fits comfortably in memory for this use case.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use wiretap_core::message::PAYLOAD_SEPARATOR;
use wiretap_core::proto::{payload_meta, payload_meta_with_body};
use wiretap_core::{Describe, Message, PluginError, Reader};

pub use wiretap_core::limiter::SpeedFactor;

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

pub struct FileInput {
    glob: String,
    loop_forever: bool,
    dry_run: bool,
    max_wait: Duration,
    speed_factor: SpeedFactor,
    messages: VecDeque<Message>,
    template: Vec<Message>,
    clock: Option<(Instant, i64)>,
}

impl FileInput {
    pub async fn open(glob: &str, loop_forever: bool, max_wait: Duration, dry_run: bool) -> Result<Self, PluginError> {
        let template = load_messages(glob).await?;
        Ok(Self {
            glob: glob.to_string(),
            loop_forever,
            dry_run,
            max_wait: if max_wait.is_zero() { DEFAULT_MAX_WAIT } else { max_wait },
            speed_factor: SpeedFactor::new(100),
            messages: template.clone().into(),
            template,
            clock: None,
        })
    }

    pub fn speed_factor(&self) -> SpeedFactor {
        self.speed_factor.clone()
    }

    async fn pace(&mut self, ts_ns: i64) {
        let (start, first_ts) = *self.clock.get_or_insert_with(|| (Instant::now(), ts_ns));
        let virtual_elapsed_ns = (ts_ns - first_ts).max(0) as f64;
        let factor = (self.speed_factor.get() as f64 / 100.0).max(0.001);
        let target = Duration::from_nanos((virtual_elapsed_ns / factor) as u64);
        let real_elapsed = start.elapsed();
        let wait = target.saturating_sub(real_elapsed).min(self.max_wait);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Reader for FileInput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        if self.messages.is_empty() {
            if self.loop_forever && !self.template.is_empty() {
                self.messages = self.template.clone().into();
                self.clock = None;
            } else {
                return Err(PluginError::Stopped);
            }
        }
        let msg = self.messages.pop_front().ok_or(PluginError::Stopped)?;

        if !self.dry_run {
            let fields = payload_meta(&msg.meta);
            if let Some(ts) = fields.get(2).and_then(|f| std::str::from_utf8(f).ok()).and_then(|s| s.parse::<i64>().ok()) {
                self.pace(ts).await;
            }
        }
        Ok(Some(msg))
    }
}

impl Describe for FileInput {
    fn describe(&self) -> String {
        format!("file input {}", self.glob)
    }
}

async fn load_messages(glob_pattern: &str) -> Result<Vec<Message>, PluginError> {
    let mut paths: Vec<_> = glob::glob(glob_pattern)
        .map_err(|e| PluginError::Config(e.to_string()))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PluginError::Transport(format!("{}: {e}", path.display())))?;
        for frame in split_frames(&bytes) {
            if frame.is_empty() {
                continue;
            }
            let (meta, data) = payload_meta_with_body(&frame);
            out.push(Message::new(meta.to_vec(), data.to_vec()));
        }
    }
    Ok(out)
}

fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while let Some(idx) = find_subslice(rest, PAYLOAD_SEPARATOR) {
        out.push(rest[..idx].to_vec());
        rest = &rest[idx + PAYLOAD_SEPARATOR.len()..];
    }
    if !rest.is_empty() {
        out.push(rest.to_vec());
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::message::PayloadType;
    use wiretap_core::proto::payload_header;
    use std::io::Write;

    fn frame(ts: i64) -> Vec<u8> {
        let mut out = payload_header(PayloadType::Request, &[b'a'; 40], ts, 0);
        out.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        out
    }

    #[tokio::test]
    async fn replays_messages_from_a_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture_0.gor");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&frame(0)).unwrap();
        file.write_all(PAYLOAD_SEPARATOR).unwrap();
        file.write_all(&frame(1_000_000)).unwrap();
        drop(file);

        let pattern = dir.path().join("*.gor");
        let mut input = FileInput::open(pattern.to_str().unwrap(), false, Duration::from_millis(50), true)
            .await
            .unwrap();
        assert!(input.read().await.unwrap().is_some());
        assert!(input.read().await.unwrap().is_some());
        assert!(input.read().await.is_err());
    }

    #[tokio::test]
    async fn loop_mode_wraps_to_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture_0.gor");
        std::fs::write(&path, frame(0)).unwrap();

        let pattern = dir.path().join("*.gor");
        let mut input = FileInput::open(pattern.to_str().unwrap(), true, Duration::from_millis(10), true)
            .await
            .unwrap();
        for _ in 0..3 {
            assert!(input.read().await.unwrap().is_some());
        }
    }
}
