//! Capture-to-disk sink (spec.md §4.5), grounded on
//! `original_source/goreplay/output/output_file.go`'s path templating and
//! chunk-rotation scheme.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

use wiretap_core::message::PayloadType;
use wiretap_core::proto::payload_id;
use wiretap_core::{Closer, Describe, Message, PluginError, Writer};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FileOutputConfig {
    pub path_template: String,
    pub append: bool,
    /// Max frames per chunk before rotating; 0 disables the check.
    pub queue_limit: u64,
    /// Max bytes per chunk before rotating; 0 disables the check.
    pub size_limit: u64,
    pub flush_interval: Duration,
    /// Caps total bytes written across the sink's lifetime; `None` disables it.
    pub max_total_size: Option<u64>,
    pub instance_id: u32,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        Self {
            path_template: "capture.gor".to_string(),
            append: false,
            queue_limit: 0,
            size_limit: 0,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_total_size: None,
            instance_id: 0,
        }
    }
}

enum ChunkWriter {
    Plain(std::io::BufWriter<File>),
    Gzip(GzEncoder<File>),
}

impl std::io::Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ChunkWriter::Plain(w) => w.write(buf),
            ChunkWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.flush(),
            ChunkWriter::Gzip(w) => w.flush(),
        }
    }
}

struct ChunkState {
    path: PathBuf,
    writer: ChunkWriter,
    entries: u64,
    bytes: u64,
}

pub struct FileOutput {
    config: FileOutputConfig,
    state: StdMutex<Option<ChunkState>>,
    total_bytes: StdMutex<u64>,
}

impl FileOutput {
    pub fn new(config: FileOutputConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(None),
            total_bytes: StdMutex::new(0),
        }
    }

    fn base_path(&self, msg: &Message, payload_type: Option<PayloadType>) -> PathBuf {
        PathBuf::from(expand_template(&self.config.path_template, msg, payload_type, self.config.instance_id))
    }

    fn needs_rotation(&self, state: &ChunkState) -> bool {
        (self.config.queue_limit > 0 && state.entries >= self.config.queue_limit)
            || (self.config.size_limit > 0 && state.bytes >= self.config.size_limit)
    }

    fn open_chunk(&self, base: &Path) -> Result<ChunkState, PluginError> {
        let path = if self.config.append {
            base.to_path_buf()
        } else {
            next_chunk_path(base)?
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PluginError::Transport(format!("{}: {e}", path.display())))?;
        let writer = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            ChunkWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            ChunkWriter::Plain(std::io::BufWriter::new(file))
        };
        Ok(ChunkState {
            path,
            writer,
            entries: 0,
            bytes: 0,
        })
    }

    fn write_frame(&self, base: &Path, frame: &[u8]) -> Result<usize, PluginError> {
        let mut guard = self.state.lock().expect("poisoned");

        let needs_new = match &*guard {
            Some(state) if without_index(&state.path).as_path() == base => self.needs_rotation(state),
            _ => true,
        };

        if needs_new {
            *guard = Some(self.open_chunk(base)?);
        }
        let state = guard.as_mut().expect("just opened");

        {
            let mut total = self.total_bytes.lock().expect("poisoned");
            if let Some(max) = self.config.max_total_size {
                if *total + frame.len() as u64 > max {
                    return Err(PluginError::LimitExceeded(format!(
                        "output file max size {max} bytes exceeded"
                    )));
                }
            }
            *total += frame.len() as u64;
        }

        state
            .writer
            .write_all(frame)
            .map_err(|e| PluginError::Transport(e.to_string()))?;
        state.entries += 1;
        state.bytes += frame.len() as u64;
        Ok(frame.len())
    }

    /// Flushes the active chunk's writer. Intended to be called on a
    /// periodic background task at `flush_interval`.
    pub fn flush(&self) -> Result<(), PluginError> {
        if let Some(state) = self.state.lock().expect("poisoned").as_mut() {
            state.writer.flush().map_err(|e| PluginError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}

/// Strips a rotating chunk's trailing `_N` index, recovering the template's
/// base path so the write path can tell whether the open chunk still
/// matches the current message's expanded template.
fn without_index(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|s| s.to_str());
    let stripped = match stem.rfind('_') {
        Some(idx) if stem[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < stem.len() => &stem[..idx],
        _ => stem,
    };
    let mut out = path.with_file_name(stripped);
    if let Some(ext) = ext {
        out.set_extension(ext);
    }
    out
}

fn chunk_index(path: &Path) -> u64 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match stem.rfind('_') {
        Some(idx) => stem[idx + 1..].parse().unwrap_or(0),
        None => 0,
    }
}

fn next_chunk_path(base: &Path) -> Result<PathBuf, PluginError> {
    let dir = base.parent().unwrap_or_else(|| Path::new("."));
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or_default();
    let pattern = if ext.is_empty() {
        format!("{stem}*")
    } else {
        format!("{stem}*.{ext}")
    };

    let mut candidates: Vec<PathBuf> = glob::glob(&dir.join(&pattern).to_string_lossy())
        .map_err(|e| PluginError::Config(e.to_string()))?
        .filter_map(Result::ok)
        .filter(|p| without_index(p).file_stem() == Some(std::ffi::OsStr::new(stem)))
        .collect();
    candidates.sort_by_key(|p| chunk_index(p));

    let next_index = candidates.last().map(|p| chunk_index(p) + 1).unwrap_or(0);
    let file_name = if ext.is_empty() {
        format!("{stem}_{next_index}")
    } else {
        format!("{stem}_{next_index}.{ext}")
    };
    Ok(dir.join(file_name))
}

/// Expands `%Y %m %d %H %M %S %NS %i %r %t` in a path template.
fn expand_template(template: &str, msg: &Message, payload_type: Option<PayloadType>, instance_id: u32) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = now.as_secs();
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    let time_of_day = secs % 86_400;
    let hour = time_of_day / 3600;
    let minute = (time_of_day % 3600) / 60;
    let second = time_of_day % 60;
    let nanos = now.subsec_nanos();

    let uuid_hex = std::str::from_utf8(payload_id(&msg.meta)).unwrap_or("").to_string();
    let type_char = payload_type.map(|t| (t.as_byte() as char).to_string()).unwrap_or_default();

    template
        .replace("%Y", &format!("{year:04}"))
        .replace("%m", &format!("{month:02}"))
        .replace("%d", &format!("{day:02}"))
        .replace("%H", &format!("{hour:02}"))
        .replace("%M", &format!("{minute:02}"))
        .replace("%S", &format!("{second:02}"))
        .replace("%NS", &nanos.to_string())
        .replace("%i", &instance_id.to_string())
        .replace("%r", &uuid_hex)
        .replace("%t", &type_char)
}

/// Civil (year, month, day) from a day count since the Unix epoch, using
/// Howard Hinnant's `civil_from_days` algorithm (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}

#[async_trait]
impl Writer for FileOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        let payload_type = wiretap_core::proto::payload_type(&msg.meta);
        let base = self.base_path(msg, payload_type);
        let mut frame = Vec::with_capacity(msg.len() + wiretap_core::message::PAYLOAD_SEPARATOR.len());
        frame.extend_from_slice(&msg.meta);
        frame.extend_from_slice(&msg.data);
        frame.extend_from_slice(wiretap_core::message::PAYLOAD_SEPARATOR);
        self.write_frame(&base, &frame)
    }
}

#[async_trait]
impl Closer for FileOutput {
    async fn close(&self) -> Result<(), PluginError> {
        self.flush()
    }
}

impl Describe for FileOutput {
    fn describe(&self) -> String {
        format!("file output {}", self.config.path_template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::proto::payload_header;

    fn req() -> Message {
        Message::new(
            payload_header(PayloadType::Request, &[b'a'; 40], 0, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )
    }

    #[tokio::test]
    async fn writes_create_and_append_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = FileOutputConfig::default();
        cfg.path_template = dir.path().join("out.gor").to_string_lossy().to_string();
        cfg.append = true;
        let out = FileOutput::new(cfg);

        out.write(&req()).await.unwrap();
        out.write(&req()).await.unwrap();
        out.flush().unwrap();

        let contents = std::fs::read(dir.path().join("out.gor")).unwrap();
        assert!(!contents.is_empty());
    }

    #[tokio::test]
    async fn rotation_creates_indexed_chunks_past_the_queue_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = FileOutputConfig::default();
        cfg.path_template = dir.path().join("chunk.gor").to_string_lossy().to_string();
        cfg.queue_limit = 1;
        let out = FileOutput::new(cfg);

        out.write(&req()).await.unwrap();
        out.write(&req()).await.unwrap();
        out.flush().unwrap();

        let mut entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());
        assert!(entries.len() >= 2);
    }

    #[tokio::test]
    async fn max_total_size_rejects_writes_past_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = FileOutputConfig::default();
        cfg.path_template = dir.path().join("capped.gor").to_string_lossy().to_string();
        cfg.append = true;
        cfg.max_total_size = Some(4);
        let out = FileOutput::new(cfg);

        assert!(out.write(&req()).await.is_err());
    }

    #[test]
    fn civil_date_matches_known_epoch_offsets() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2023, 12, 4));
    }
}
