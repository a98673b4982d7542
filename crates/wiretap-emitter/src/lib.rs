//! The pipeline driver (spec.md §4.2): wires Inputs, an optional Middleware,
//! an optional HTTP Modifier, and Outputs into a running set of copier
//! tasks that own their channels, drain them, and dispatch to sinks.

mod shared;

pub use shared::Shared;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use wiretap_core::filtered_set::FilteredSet;
use wiretap_core::hash::fnv1a32;
use wiretap_core::modifier::HttpModifier;
use wiretap_core::proto::{payload_id, payload_meta, payload_type};
use wiretap_core::stats::DEFAULT_REPORT_INTERVAL;
use wiretap_core::{
    Closer, CoreConfig, Describe, Message, PluginError, Reader, ResponseSource, SplitMode, Stats,
    Writer,
};
use wiretap_middleware::Middleware;

/// A `Writer + Closer + Describe` sink; every concrete output type in
/// `wiretap-output` gets this for free.
pub trait Output: Writer + Closer + Describe + Send + Sync {}
impl<T: Writer + Closer + Describe + Send + Sync + ?Sized> Output for T {}

pub struct InputPlugin {
    reader: Box<dyn Reader>,
    closer: Option<Arc<dyn Closer>>,
    label: String,
}

impl InputPlugin {
    /// An input with no external close hook (`DummyInput`, `FileInput`).
    pub fn simple<T: Reader + Describe + 'static>(input: T) -> Self {
        let label = input.describe();
        Self {
            reader: Box::new(input),
            closer: None,
            label,
        }
    }

    /// An input whose `Close()` must be reachable from [`Emitter::close`]
    /// while its `Reader` half is owned by a running copier task
    /// (`TcpInput`). Shares state through [`Shared`] rather than requiring
    /// the caller to split the two halves itself.
    pub fn closable<T: Reader + Closer + Describe + 'static>(input: T) -> Self {
        let shared = Shared::new(input);
        let label = shared.describe();
        let closer: Arc<dyn Closer> = Arc::new(shared.clone());
        Self {
            reader: Box::new(shared),
            closer: Some(closer),
            label,
        }
    }

    /// Registers an output with `TrackResponses` enabled as an additional
    /// input, so its replayed responses flow back through the pipeline
    /// (spec.md §4.7, §4.11).
    pub fn from_response_source<T: ResponseSource + 'static>(source: Arc<T>, label: impl Into<String>) -> Self {
        Self {
            reader: Box::new(ResponseSourceReader(source)),
            closer: None,
            label: label.into(),
        }
    }
}

struct ResponseSourceReader<T: ResponseSource + ?Sized>(Arc<T>);

#[async_trait]
impl<T: ResponseSource + ?Sized> Reader for ResponseSourceReader<T> {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        Ok(self.0.next_response().await)
    }
}

#[derive(Default)]
pub struct Plugins {
    pub inputs: Vec<InputPlugin>,
    pub outputs: Vec<Arc<dyn Output>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, input: InputPlugin) {
        self.inputs.push(input);
    }

    pub fn add_output<T: Output + 'static>(&mut self, output: T) -> Arc<T> {
        let output = Arc::new(output);
        self.outputs.push(output.clone());
        output
    }
}

struct MiddlewareReader(Arc<TokioMutex<Middleware>>);

#[async_trait]
impl Reader for MiddlewareReader {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        self.0.lock().await.read().await
    }
}

struct MiddlewareCloser(Arc<TokioMutex<Middleware>>);

#[async_trait]
impl Closer for MiddlewareCloser {
    async fn close(&self) -> Result<(), PluginError> {
        self.0.lock().await.close().await
    }
}

pub struct Emitter {
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
    closers: Vec<Arc<dyn Closer>>,
    stats_task: Option<JoinHandle<()>>,
}

impl Emitter {
    /// Non-blocking: spawns one copier task per effective input (spec.md
    /// §4.2). When `middleware_cmd` is set, every input instead feeds the
    /// single Middleware instance and the sole copier task reads from it.
    pub async fn start(
        mut plugins: Plugins,
        config: Arc<CoreConfig>,
        modifier: Option<Arc<HttpModifier>>,
        middleware_cmd: Option<&str>,
    ) -> Result<Self, PluginError> {
        let mut closers: Vec<Arc<dyn Closer>> = Vec::new();
        for input in &plugins.inputs {
            if let Some(c) = &input.closer {
                closers.push(c.clone());
            }
        }
        for output in &plugins.outputs {
            closers.push(output.clone() as Arc<dyn Closer>);
        }

        let outputs = plugins.outputs.clone();
        let round_robin = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        let stats = config.stats.then(|| Arc::new(Stats::new("wiretap")));
        let stats_task = stats.clone().map(|stats| tokio::spawn(report_stats(stats)));

        if let Some(cmd) = middleware_cmd {
            let mw = Arc::new(TokioMutex::new(Middleware::spawn(cmd).await?));
            closers.push(Arc::new(MiddlewareCloser(mw.clone())));

            for input in std::mem::take(&mut plugins.inputs) {
                let mw = mw.clone();
                tasks.push(tokio::spawn(feed_loop(input, mw)));
            }

            let reader: Box<dyn Reader> = Box::new(MiddlewareReader(mw));
            tasks.push(tokio::spawn(copy_loop(
                reader,
                "middleware".to_string(),
                outputs,
                config,
                modifier,
                round_robin,
                stats,
            )));
        } else {
            for input in plugins.inputs {
                tasks.push(tokio::spawn(copy_loop(
                    input.reader,
                    input.label,
                    outputs.clone(),
                    config.clone(),
                    modifier.clone(),
                    round_robin.clone(),
                    stats.clone(),
                )));
            }
        }

        Ok(Self {
            tasks: TokioMutex::new(tasks),
            closers,
            stats_task,
        })
    }

    /// Closes every plugin that supports closing, then waits for every
    /// copier task to exit. Safe to call more than once.
    pub async fn close(&self) {
        for closer in &self.closers {
            if let Err(e) = closer.close().await {
                tracing::warn!(error = %e, "error closing plugin");
            }
        }
        if let Some(task) = &self.stats_task {
            task.abort();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Ticks a shared [`Stats`] accumulator on a fixed interval and logs each
/// rolled-up interval as JSON (spec.md's `--stats` flag).
async fn report_stats(stats: Arc<Stats>) {
    let mut interval = tokio::time::interval(DEFAULT_REPORT_INTERVAL);
    loop {
        interval.tick().await;
        stats.tick();
        match serde_json::to_string(&stats.snapshot()) {
            Ok(json) => tracing::info!(stats = %json, "periodic stats report"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize stats report"),
        }
    }
}

async fn feed_loop(mut input: InputPlugin, mw: Arc<TokioMutex<Middleware>>) {
    loop {
        match input.reader.read().await {
            Ok(Some(msg)) => {
                if mw.lock().await.feed(&msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(PluginError::Stopped) => break,
            Err(e) => {
                tracing::warn!(error = %e, input = %input.label, "input read failed, stopping feeder");
                break;
            }
        }
    }
}

async fn copy_loop(
    mut reader: Box<dyn Reader>,
    label: String,
    outputs: Vec<Arc<dyn Output>>,
    config: Arc<CoreConfig>,
    modifier: Option<Arc<HttpModifier>>,
    round_robin: Arc<AtomicUsize>,
    stats: Option<Arc<Stats>>,
) {
    let mut filtered = FilteredSet::new(config.filtered_request_ttl);
    loop {
        let msg = match reader.read().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(PluginError::Stopped) => break,
            Err(e) => {
                tracing::warn!(error = %e, input = %label, "input read failed, stopping copier");
                break;
            }
        };

        let Some(msg) = process_message(msg, &config, modifier.as_deref(), &mut filtered) else {
            continue;
        };

        if let Some(stats) = &stats {
            stats.track(msg.len() as i64);
        }

        if dispatch(&msg, &outputs, config.split_output, &round_robin).await {
            tracing::warn!(input = %label, "output write failed, stopping copier");
            break;
        }
    }
}

/// Copy-loop steps 1-4 (spec.md §4.2): truncate, validate meta, apply the
/// modifier and filtered-request suppression, then prettify. Returns `None`
/// when the message should be dropped.
fn process_message(
    mut msg: Message,
    config: &CoreConfig,
    modifier: Option<&HttpModifier>,
    filtered: &mut FilteredSet,
) -> Option<Message> {
    msg.truncate_data(config.copy_buffer_size);

    if payload_meta(&msg.meta).len() < 3 {
        return None;
    }

    if let Some(modifier) = modifier {
        match payload_type(&msg.meta) {
            Some(wiretap_core::PayloadType::Request) => {
                let rewritten = modifier.rewrite(&msg.data);
                if rewritten.is_empty() {
                    filtered.insert(payload_id(&msg.meta));
                    return None;
                }
                msg.data = rewritten.into();
            }
            Some(wiretap_core::PayloadType::Response) => {
                if filtered.take(payload_id(&msg.meta)) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if config.prettify_http {
        match wiretap_core::prettify_http(&msg.data) {
            Some(pretty) => msg.data = pretty.into(),
            None => return None,
        }
    }

    Some(msg)
}

/// Fan-out (spec.md §4.8). Returns `true` when the copier should stop
/// (a non-`ClosedPipe` write error occurred).
async fn dispatch(msg: &Message, outputs: &[Arc<dyn Output>], mode: SplitMode, round_robin: &AtomicUsize) -> bool {
    if outputs.is_empty() {
        return false;
    }
    match mode {
        SplitMode::Broadcast => {
            for output in outputs {
                if write_one(output, msg).await {
                    return true;
                }
            }
            false
        }
        SplitMode::RoundRobin => {
            let idx = round_robin.fetch_add(1, Ordering::Relaxed) % outputs.len();
            write_one(&outputs[idx], msg).await
        }
        SplitMode::SessionSticky => {
            let id = payload_id(&msg.meta);
            let idx = if id.is_empty() {
                round_robin.fetch_add(1, Ordering::Relaxed) % outputs.len()
            } else {
                fnv1a32(wiretap_core::session_prefix(id)) as usize % outputs.len()
            };
            write_one(&outputs[idx], msg).await
        }
    }
}

async fn write_one(output: &Arc<dyn Output>, msg: &Message) -> bool {
    match output.write(msg).await {
        Ok(_) => false,
        Err(PluginError::ClosedPipe) => {
            tracing::debug!(output = %output.describe(), "output pipe closed, dropping message");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, output = %output.describe(), "output write failed");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiretap_core::message::PayloadType;
    use wiretap_core::modifier::ModifierConfig;
    use wiretap_core::proto::payload_header;
    use wiretap_core::testutil::{TestInput, TestOutput};
    use wiretap_input::DummyInput;

    fn req(uuid: &[u8; 40]) -> Message {
        Message::new(
            payload_header(PayloadType::Request, uuid, 0, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )
    }

    #[tokio::test]
    async fn broadcasts_every_message_to_every_output() {
        let out = TestOutput::new();
        let mut plugins = Plugins::new();
        plugins.add_input(InputPlugin::simple(TestInput::new([req(&[b'a'; 40]), req(&[b'b'; 40])])));
        plugins.add_output(out.writer());

        let config = Arc::new(CoreConfig::default());
        let emitter = Emitter::start(plugins, config, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        emitter.close().await;

        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn dummy_input_drives_an_output_over_several_ticks() {
        let out = TestOutput::new();
        let mut plugins = Plugins::new();
        plugins.add_input(InputPlugin::simple(DummyInput::with_period(Duration::from_millis(1))));
        plugins.add_output(out.writer());

        let config = Arc::new(CoreConfig::default());
        let emitter = Emitter::start(plugins, config, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        emitter.close().await;

        assert!(out.len() >= 2);
    }

    #[tokio::test]
    async fn round_robin_split_alternates_outputs() {
        let out_a = TestOutput::new();
        let out_b = TestOutput::new();
        let mut plugins = Plugins::new();
        plugins.add_input(InputPlugin::simple(TestInput::new([
            req(&[b'a'; 40]),
            req(&[b'b'; 40]),
            req(&[b'c'; 40]),
            req(&[b'd'; 40]),
        ])));
        plugins.add_output(out_a.writer());
        plugins.add_output(out_b.writer());

        let mut config = CoreConfig::default();
        config.split_output = SplitMode::RoundRobin;
        let emitter = Emitter::start(plugins, Arc::new(config), None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        emitter.close().await;

        assert_eq!(out_a.len() + out_b.len(), 4);
        assert_eq!(out_a.len(), 2);
        assert_eq!(out_b.len(), 2);
    }

    #[tokio::test]
    async fn malformed_meta_is_dropped_before_reaching_outputs() {
        let out = TestOutput::new();
        let malformed = Message::new(b"1 onlyonefield\n".to_vec(), b"GET / HTTP/1.1\r\n\r\n".to_vec());
        let mut plugins = Plugins::new();
        plugins.add_input(InputPlugin::simple(TestInput::new([malformed])));
        plugins.add_output(out.writer());

        let config = Arc::new(CoreConfig::default());
        let emitter = Emitter::start(plugins, config, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        emitter.close().await;

        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn method_filter_drops_the_disallowed_pair_but_keeps_the_allowed_one() {
        let post_uuid = [b'p'; 40];
        let get_uuid = [b'g'; 40];
        let post_req = Message::new(
            payload_header(PayloadType::Request, &post_uuid, 0, 0),
            b"POST / HTTP/1.1\r\n\r\n".to_vec(),
        );
        let post_resp = Message::new(
            payload_header(PayloadType::Response, &post_uuid, 1, 0),
            b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
        );
        let get_req = Message::new(
            payload_header(PayloadType::Request, &get_uuid, 2, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        );
        let get_resp = Message::new(
            payload_header(PayloadType::Response, &get_uuid, 3, 0),
            b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
        );

        let mut modifier_config = ModifierConfig::default();
        modifier_config.methods.push(b"GET".to_vec());
        let modifier = Arc::new(HttpModifier::build(modifier_config).unwrap());

        let out = TestOutput::new();
        let mut plugins = Plugins::new();
        plugins.add_input(InputPlugin::simple(TestInput::new([post_req, post_resp, get_req, get_resp])));
        plugins.add_output(out.writer());

        let config = Arc::new(CoreConfig::default());
        let emitter = Emitter::start(plugins, config, Some(modifier), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        emitter.close().await;

        assert_eq!(out.len(), 2);
        for msg in out.messages() {
            assert_eq!(wiretap_core::proto::payload_id(&msg.meta), get_uuid.as_slice());
        }
    }
}
