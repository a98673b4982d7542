//! Dynamic-worker-pool HTTP replay output (spec.md §4.7), grounded on
//! `original_source/goreplay/output/output_http.go`'s `httpWorker` /
//! `workerMaster` / `sessionWorkerMaster` split.
//!
//! The reference's `workerMaster` rolls back excess workers with an
//! unbounded `goto` retry; this instead adds the excess to a counter that
//! idle workers opportunistically claim one unit of, which caps each tick's
//! scale-down to the number of workers that were actually idle (the
//! redesign recorded for the capped-rollback open question).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex};

use wiretap_core::message::PayloadType;
use wiretap_core::proto::{payload_header, payload_id};
use wiretap_core::time::now_ns;
use wiretap_core::{Closer, Describe, Message, PluginError, Reader, ResponseSource, Writer};

const DEFAULT_QUEUE_LEN: usize = 1000;
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct HttpOutputConfig {
    pub url: String,
    pub workers_min: usize,
    pub workers_max: usize,
    pub queue_len: usize,
    pub worker_timeout: Duration,
    pub timeout: Duration,
    pub redirect_limit: usize,
    pub track_responses: bool,
    pub original_host: bool,
    pub skip_verify: bool,
    /// Selects the `sessionWorkerMaster` variant.
    pub sticky: bool,
}

impl Default for HttpOutputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            workers_min: 1,
            workers_max: 1000,
            queue_len: DEFAULT_QUEUE_LEN,
            worker_timeout: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
            redirect_limit: 0,
            track_responses: false,
            original_host: false,
            skip_verify: false,
            sticky: false,
        }
    }
}

enum Pool {
    Dynamic(DynamicPool),
    Sticky(StickyPool),
}

struct DynamicPool {
    tx: mpsc::Sender<Message>,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    should_stop: Arc<AtomicUsize>,
    workers_min: usize,
    workers_max: usize,
}

struct StickyPool {
    sessions: Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Message>>>>,
}

pub struct HttpOutput {
    config: HttpOutputConfig,
    client: Client,
    pool: Pool,
    responses: Option<Mutex<mpsc::Receiver<Message>>>,
    response_tx: Option<mpsc::Sender<Message>>,
}

impl HttpOutput {
    pub fn new(config: HttpOutputConfig) -> Result<Self, PluginError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.skip_verify)
            .redirect(if config.redirect_limit == 0 {
                Policy::none()
            } else {
                Policy::limited(config.redirect_limit)
            })
            .build()
            .map_err(|e| PluginError::Config(e.to_string()))?;

        let (responses, response_tx) = if config.track_responses {
            let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_LEN);
            (Some(Mutex::new(rx)), Some(tx))
        } else {
            (None, None)
        };

        let pool = if config.sticky {
            Pool::Sticky(StickyPool {
                sessions: Arc::new(Mutex::new(HashMap::new())),
            })
        } else {
            let (tx, rx) = mpsc::channel(config.queue_len.max(1));
            let rx = Arc::new(Mutex::new(rx));
            let pending = Arc::new(AtomicUsize::new(0));
            let active = Arc::new(AtomicUsize::new(0));
            let should_stop = Arc::new(AtomicUsize::new(0));

            for _ in 0..config.workers_min {
                spawn_dynamic_worker(
                    client.clone(),
                    config.clone(),
                    rx.clone(),
                    pending.clone(),
                    active.clone(),
                    should_stop.clone(),
                    response_tx.clone(),
                );
            }
            spawn_master(pending.clone(), active.clone(), should_stop.clone(), config.workers_min, config.worker_timeout);

            Pool::Dynamic(DynamicPool {
                tx,
                rx,
                pending,
                active,
                should_stop,
                workers_min: config.workers_min,
                workers_max: config.workers_max,
            })
        };

        Ok(Self {
            config,
            client,
            pool,
            responses,
            response_tx,
        })
    }
}

fn spawn_master(
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    should_stop: Arc<AtomicUsize>,
    workers_min: usize,
    worker_timeout: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(worker_timeout);
        loop {
            interval.tick().await;
            let current = active.load(Ordering::Relaxed);
            if pending.load(Ordering::Relaxed) == 0 && current > workers_min {
                should_stop.fetch_add(current - workers_min, Ordering::Relaxed);
            }
        }
    });
}

fn spawn_dynamic_worker(
    client: Client,
    config: HttpOutputConfig,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    should_stop: Arc<AtomicUsize>,
    response_tx: Option<mpsc::Sender<Message>>,
) {
    active.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        loop {
            let mut claimed = should_stop.load(Ordering::Relaxed);
            while claimed > 0 {
                match should_stop.compare_exchange(claimed, claimed - 1, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        active.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                    Err(v) => claimed = v,
                }
            }

            let msg = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            match msg {
                Some(msg) => {
                    pending.fetch_sub(1, Ordering::Relaxed);
                    dispatch(&client, &config, &msg, response_tx.as_ref()).await;
                }
                None => {
                    active.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    });
}

/// Applies the "fix #862" URL merge rule: if the configured target has
/// neither a path nor a query, keep the captured request's path and query
/// and only override scheme + host; otherwise the configured URL fully
/// replaces the captured one.
fn resolve_url(base: &str, captured_path_and_query: &str) -> String {
    match reqwest::Url::parse(base) {
        Ok(parsed) if parsed.path() == "/" && parsed.query().is_none() => {
            let mut out = format!("{}://{}", parsed.scheme(), parsed.authority());
            out.push_str(captured_path_and_query);
            out
        }
        _ => base.to_string(),
    }
}

async fn dispatch(client: &Client, config: &HttpOutputConfig, msg: &Message, response_tx: Option<&mpsc::Sender<Message>>) {
    let Some(parsed) = parse_http_request(&msg.data) else {
        tracing::debug!("http output: dropping unparsable request");
        return;
    };
    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        return;
    }

    let url = resolve_url(&config.url, &parsed.path_and_query);
    let method = reqwest::Method::from_bytes(parsed.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, &url);

    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("host") && !config.original_host {
            continue;
        }
        builder = builder.header(name, value.as_slice());
    }
    if !parsed.body.is_empty() {
        builder = builder.body(parsed.body.clone());
    }

    let started = now_ns();
    let start_instant = Instant::now();
    let result = builder.send().await;

    if let (true, Some(tx)) = (config.track_responses, response_tx) {
        if let Ok(response) = result {
            let rtt_ns = start_instant.elapsed().as_nanos() as i64;
            if let Ok(body) = response.bytes().await {
                let uuid_hex = payload_id(&msg.meta).to_vec();
                let response_msg = Message::new(
                    payload_header(PayloadType::ReplayedResponse, &uuid_hex, started, rtt_ns),
                    body.to_vec(),
                );
                let _ = tx.try_send(response_msg);
            }
        }
    }
}

struct ParsedRequest {
    method: String,
    path_and_query: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
}

fn parse_http_request(raw: &[u8]) -> Option<ParsedRequest> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_buf);
    let status = req.parse(raw).ok()?;
    let header_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => raw.len(),
    };
    let method = req.method?.to_string();
    let path_and_query = req.path?.to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();
    let body = raw.get(header_len..).unwrap_or(&[]).to_vec();
    Some(ParsedRequest {
        method,
        path_and_query,
        headers,
        body,
    })
}

#[async_trait]
impl Writer for HttpOutput {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        if !wiretap_core::proto::is_request_payload(&msg.meta) {
            return Ok(0);
        }
        match &self.pool {
            Pool::Dynamic(pool) => {
                pool.tx.send(msg.clone()).await.map_err(|_| PluginError::ClosedPipe)?;
                pool.pending.fetch_add(1, Ordering::Relaxed);

                let active = pool.active.load(Ordering::Relaxed);
                let pending = pool.pending.load(Ordering::Relaxed);
                if pending > active && pool.workers_max > pool.workers_min {
                    let to_spawn = (pending - active + 1).min(pool.workers_max - active);
                    for _ in 0..to_spawn {
                        spawn_dynamic_worker(
                            self.client.clone(),
                            self.config.clone(),
                            pool.rx.clone(),
                            pool.pending.clone(),
                            pool.active.clone(),
                            pool.should_stop.clone(),
                            self.response_tx.clone(),
                        );
                    }
                }
            }
            Pool::Sticky(pool) => {
                let id = payload_id(&msg.meta);
                if id.is_empty() {
                    return Ok(0);
                }
                let session = wiretap_core::session_prefix(id).to_vec();
                let mut sessions = pool.sessions.lock().await;
                let tx = sessions.entry(session.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(self.config.queue_len.max(1));
                    spawn_session_worker(self.client.clone(), self.config.clone(), rx, self.response_tx.clone());
                    tx
                });
                if tx.send(msg.clone()).await.is_err() {
                    // the idle janitor culled this session's worker; respawn once.
                    let (tx, rx) = mpsc::channel(self.config.queue_len.max(1));
                    spawn_session_worker(self.client.clone(), self.config.clone(), rx, self.response_tx.clone());
                    tx.send(msg.clone()).await.map_err(|_| PluginError::ClosedPipe)?;
                    sessions.insert(session, tx);
                }
            }
        }
        Ok(msg.len())
    }
}

fn spawn_session_worker(
    client: Client,
    config: HttpOutputConfig,
    mut rx: mpsc::Receiver<Message>,
    response_tx: Option<mpsc::Sender<Message>>,
) {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(SESSION_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(msg)) => dispatch(&client, &config, &msg, response_tx.as_ref()).await,
                Ok(None) | Err(_) => return,
            }
        }
    });
}

#[async_trait]
impl Reader for HttpOutput {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        match &self.responses {
            Some(_) => Ok(self.next_response().await),
            None => Err(PluginError::Stopped),
        }
    }
}

#[async_trait]
impl wiretap_core::ResponseSource for HttpOutput {
    async fn next_response(&self) -> Option<Message> {
        match &self.responses {
            Some(rx) => rx.lock().await.recv().await,
            None => None,
        }
    }
}

#[async_trait]
impl Closer for HttpOutput {
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl Describe for HttpOutput {
    fn describe(&self) -> String {
        format!("http output {}", self.config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_keeps_captured_path_when_target_is_bare() {
        let url = resolve_url("http://example.com", "/a/b?x=1");
        assert_eq!(url, "http://example.com/a/b?x=1");
    }

    #[test]
    fn resolve_url_replaces_fully_when_target_has_a_path() {
        let url = resolve_url("http://example.com/fixed", "/a/b?x=1");
        assert_eq!(url, "http://example.com/fixed");
    }

    #[test]
    fn parses_method_path_and_headers() {
        let raw = b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n";
        let parsed = parse_http_request(raw).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path_and_query, "/a?x=1");
        assert!(parsed.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")));
    }
}
