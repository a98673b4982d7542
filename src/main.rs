//! Wires CLI flags into `CoreConfig`, the configured input/output plugins,
//! an optional `HttpModifier` and external middleware, and a running
//! `Emitter`. Flag surface follows spec.md §6's "typical" list.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use wiretap_core::config::SplitMode;
use wiretap_core::modifier::{self, HttpModifier, ModifierConfig};
use wiretap_core::CoreConfig;
use wiretap_emitter::{Emitter, InputPlugin, Plugins};
use wiretap_input::{DummyInput, FileInput, TcpInput, TlsIdentity};
use wiretap_output::{
    BinaryOutput, BinaryOutputConfig, DummyOutput, FileOutput, FileOutputConfig, HttpOutput,
    HttpOutputConfig, NullOutput, TcpOutput, TcpOutputConfig, WebSocketOutput, WebSocketOutputConfig,
};

#[derive(Parser)]
#[command(name = "wiretap", about = "HTTP/TCP traffic capture and replay pipeline", version)]
struct Cli {
    /// Adds one synthetic DummyInput (repeatable).
    #[arg(long, action = clap::ArgAction::Count)]
    input_dummy: u8,

    /// Replays capture files matching GLOB (repeatable).
    #[arg(long = "input-file", value_name = "GLOB")]
    input_file: Vec<String>,
    #[arg(long = "input-file-loop")]
    input_file_loop: bool,
    #[arg(long = "input-file-dry-run")]
    input_file_dry_run: bool,
    #[arg(long = "input-file-max-wait-seconds", default_value_t = 5)]
    input_file_max_wait_seconds: u64,

    /// Listens for raw capture traffic on ADDR (repeatable).
    #[arg(long = "input-tcp", value_name = "ADDR")]
    input_tcp: Vec<String>,
    #[arg(long = "input-tcp-tls-cert")]
    input_tcp_tls_cert: Option<PathBuf>,
    #[arg(long = "input-tcp-tls-key")]
    input_tcp_tls_key: Option<PathBuf>,

    /// Adds one output that discards messages with a debug log (repeatable).
    #[arg(long, action = clap::ArgAction::Count)]
    output_dummy: u8,
    /// Adds one output that discards messages silently (repeatable).
    #[arg(long, action = clap::ArgAction::Count)]
    output_null: u8,

    #[arg(long = "output-file", value_name = "PATH_TEMPLATE")]
    output_file: Vec<String>,
    #[arg(long = "output-file-append")]
    output_file_append: bool,
    #[arg(long = "output-file-flush-interval-ms", default_value_t = 100)]
    output_file_flush_interval_ms: u64,
    #[arg(long = "output-file-size-limit", default_value_t = 0)]
    output_file_size_limit: u64,
    #[arg(long = "output-file-queue-limit", default_value_t = 0)]
    output_file_queue_limit: u64,
    #[arg(long = "output-file-max-size-limit")]
    output_file_max_size_limit: Option<u64>,

    #[arg(long = "output-tcp", value_name = "ADDR")]
    output_tcp: Vec<String>,
    #[arg(long = "output-tcp-workers", default_value_t = 1)]
    output_tcp_workers: usize,
    #[arg(long = "output-tcp-secure")]
    output_tcp_secure: bool,
    #[arg(long = "output-tcp-skip-verify")]
    output_tcp_skip_verify: bool,
    #[arg(long = "output-tcp-sticky")]
    output_tcp_sticky: bool,

    #[arg(long = "output-ws", value_name = "URL")]
    output_ws: Vec<String>,
    #[arg(long = "output-ws-workers", default_value_t = 1)]
    output_ws_workers: usize,
    #[arg(long = "output-ws-sticky")]
    output_ws_sticky: bool,

    #[arg(long = "output-http", value_name = "URL")]
    output_http: Vec<String>,
    #[arg(long = "output-http-workers", default_value_t = 1000)]
    output_http_workers: usize,
    #[arg(long = "output-http-workers-min", default_value_t = 1)]
    output_http_workers_min: usize,
    #[arg(long = "output-http-queue-len", default_value_t = 1000)]
    output_http_queue_len: usize,
    #[arg(long = "output-http-timeout-seconds", default_value_t = 1)]
    output_http_timeout_seconds: u64,
    #[arg(long = "output-http-worker-timeout-seconds", default_value_t = 2)]
    output_http_worker_timeout_seconds: u64,
    #[arg(long = "output-http-track-response")]
    output_http_track_response: bool,
    #[arg(long = "output-http-redirect-limit", default_value_t = 0)]
    output_http_redirect_limit: usize,
    #[arg(long = "output-http-skip-verify")]
    output_http_skip_verify: bool,
    #[arg(long = "output-http-original-host")]
    output_http_original_host: bool,
    #[arg(long = "output-http-sticky")]
    output_http_sticky: bool,

    #[arg(long = "output-binary", value_name = "ADDR")]
    output_binary: Vec<String>,
    #[arg(long = "output-binary-track-response")]
    output_binary_track_response: bool,

    /// Runs every message through an external process before modification.
    #[arg(long)]
    middleware: Option<String>,

    #[arg(long = "split-output", value_enum, default_value_t = SplitOutputArg::Broadcast)]
    split_output: SplitOutputArg,
    /// Required for `session-sticky` to route on TCP session id rather than
    /// falling back to round robin.
    #[arg(long)]
    recognize_tcp_sessions: bool,

    #[arg(long = "copy-buffer-size", default_value_t = 5 * 1024 * 1024)]
    copy_buffer_size: usize,
    #[arg(long)]
    prettify_http: bool,

    #[arg(long = "exit-after-seconds")]
    exit_after_seconds: Option<u64>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(long)]
    stats: bool,

    #[arg(long = "http-allow-method", value_name = "METHOD")]
    http_allow_method: Vec<String>,
    #[arg(long = "http-set-header", value_parser = modifier::parse_header_set, value_name = "Key: Value")]
    http_set_header: Vec<modifier::HeaderSet>,
    #[arg(long = "http-set-param", value_parser = modifier::parse_param_set, value_name = "key=value")]
    http_set_param: Vec<modifier::ParamSet>,
    #[arg(long = "http-allow-url", value_parser = modifier::parse_url_regexp, value_name = "REGEX")]
    http_allow_url: Vec<regex::bytes::Regex>,
    #[arg(long = "http-disallow-url", value_parser = modifier::parse_url_regexp, value_name = "REGEX")]
    http_disallow_url: Vec<regex::bytes::Regex>,
    #[arg(long = "http-allow-header", value_parser = modifier::parse_header_filter, value_name = "Name:REGEX")]
    http_allow_header: Vec<modifier::HeaderFilter>,
    #[arg(long = "http-disallow-header", value_parser = modifier::parse_header_filter, value_name = "Name:REGEX")]
    http_disallow_header: Vec<modifier::HeaderFilter>,
    #[arg(long = "http-basic-auth-filter", value_parser = modifier::parse_basic_auth_filter, value_name = "REGEX")]
    http_basic_auth_filter: Vec<modifier::BasicAuthFilter>,
    #[arg(long = "http-header-limiter", value_parser = modifier::parse_hash_filter, value_name = "Name:P%")]
    http_header_limiter: Vec<modifier::HashFilter>,
    #[arg(long = "http-param-limiter", value_parser = modifier::parse_hash_filter, value_name = "Name:P%")]
    http_param_limiter: Vec<modifier::HashFilter>,
    #[arg(long = "http-rewrite-url", value_parser = modifier::parse_url_rewrite, value_name = "SRC_REGEX:TARGET")]
    http_rewrite_url: Vec<modifier::UrlRewrite>,
    #[arg(long = "http-rewrite-header", value_parser = modifier::parse_header_rewrite, value_name = "Name: SRC_REGEX,TARGET")]
    http_rewrite_header: Vec<modifier::HeaderRewrite>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SplitOutputArg {
    Broadcast,
    RoundRobin,
    SessionSticky,
}

fn build_core_config(cli: &Cli) -> CoreConfig {
    let split_output = match (cli.split_output, cli.recognize_tcp_sessions) {
        (SplitOutputArg::SessionSticky, false) => {
            tracing::warn!("split-output=session-sticky without recognize-tcp-sessions, falling back to round-robin");
            SplitMode::RoundRobin
        }
        (SplitOutputArg::SessionSticky, true) => SplitMode::SessionSticky,
        (SplitOutputArg::RoundRobin, _) => SplitMode::RoundRobin,
        (SplitOutputArg::Broadcast, _) => SplitMode::Broadcast,
    };

    CoreConfig {
        copy_buffer_size: cli.copy_buffer_size,
        prettify_http: cli.prettify_http,
        split_output,
        exit_after: cli.exit_after_seconds.map(Duration::from_secs),
        verbose: cli.verbose.min(3),
        stats: cli.stats,
        ..CoreConfig::default()
    }
}

fn build_modifier(cli: &Cli) -> Option<Arc<HttpModifier>> {
    let config = ModifierConfig {
        methods: cli.http_allow_method.iter().map(|m| m.as_bytes().to_vec()).collect(),
        headers: cli.http_set_header.clone(),
        params: cli.http_set_param.clone(),
        url_regexp: cli.http_allow_url.clone(),
        url_negative_regexp: cli.http_disallow_url.clone(),
        header_filters: cli.http_allow_header.clone(),
        header_negative_filters: cli.http_disallow_header.clone(),
        header_basic_auth_filters: cli.http_basic_auth_filter.clone(),
        header_hash_filters: cli.http_header_limiter.clone(),
        param_hash_filters: cli.http_param_limiter.clone(),
        url_rewrite: cli.http_rewrite_url.clone(),
        header_rewrite: cli.http_rewrite_header.clone(),
    };
    HttpModifier::build(config).map(Arc::new)
}

async fn build_plugins(cli: &Cli) -> anyhow::Result<Plugins> {
    let mut plugins = Plugins::new();

    for _ in 0..cli.input_dummy {
        plugins.add_input(InputPlugin::simple(DummyInput::new()));
    }
    for glob in &cli.input_file {
        let max_wait = Duration::from_secs(cli.input_file_max_wait_seconds);
        let input = FileInput::open(glob, cli.input_file_loop, max_wait, cli.input_file_dry_run).await?;
        plugins.add_input(InputPlugin::simple(input));
    }
    for addr in &cli.input_tcp {
        let tls = match (&cli.input_tcp_tls_cert, &cli.input_tcp_tls_key) {
            (Some(cert), Some(key)) => Some(TlsIdentity {
                cert_path: cert.display().to_string(),
                key_path: key.display().to_string(),
            }),
            _ => None,
        };
        let input = TcpInput::bind(addr, tls).await?;
        plugins.add_input(InputPlugin::closable(input));
    }

    for _ in 0..cli.output_dummy {
        plugins.add_output(DummyOutput::new());
    }
    for _ in 0..cli.output_null {
        plugins.add_output(NullOutput::new());
    }

    for path_template in &cli.output_file {
        plugins.add_output(FileOutput::new(FileOutputConfig {
            path_template: path_template.clone(),
            append: cli.output_file_append,
            queue_limit: cli.output_file_queue_limit,
            size_limit: cli.output_file_size_limit,
            flush_interval: Duration::from_millis(cli.output_file_flush_interval_ms),
            max_total_size: cli.output_file_max_size_limit,
            instance_id: 0,
        }));
    }

    for addr in &cli.output_tcp {
        let output = TcpOutput::connect(TcpOutputConfig {
            addr: addr.clone(),
            workers: cli.output_tcp_workers,
            tls: cli.output_tcp_secure,
            insecure_skip_verify: cli.output_tcp_skip_verify,
            sticky: cli.output_tcp_sticky,
            init_message: None,
            write_before_message: None,
        })
        .await?;
        plugins.add_output(output);
    }

    for url in &cli.output_ws {
        let output = WebSocketOutput::connect(WebSocketOutputConfig {
            url: url.clone(),
            workers: cli.output_ws_workers,
            sticky: cli.output_ws_sticky,
            headers: Vec::new(),
        })
        .await?;
        plugins.add_output(output);
    }

    for url in &cli.output_http {
        let output = HttpOutput::new(HttpOutputConfig {
            url: url.clone(),
            workers_min: cli.output_http_workers_min,
            workers_max: cli.output_http_workers,
            queue_len: cli.output_http_queue_len,
            worker_timeout: Duration::from_secs(cli.output_http_worker_timeout_seconds),
            timeout: Duration::from_secs(cli.output_http_timeout_seconds),
            redirect_limit: cli.output_http_redirect_limit,
            track_responses: cli.output_http_track_response,
            original_host: cli.output_http_original_host,
            skip_verify: cli.output_http_skip_verify,
            sticky: cli.output_http_sticky,
        })?;
        let output = plugins.add_output(output);
        if cli.output_http_track_response {
            plugins.add_input(InputPlugin::from_response_source(output, format!("http response {url}")));
        }
    }

    for addr in &cli.output_binary {
        let output = plugins.add_output(BinaryOutput::new(BinaryOutputConfig {
            addr: addr.clone(),
            track_responses: cli.output_binary_track_response,
            ..BinaryOutputConfig::default()
        }));
        if cli.output_binary_track_response {
            plugins.add_input(InputPlugin::from_response_source(output, format!("binary response {addr}")));
        }
    }

    Ok(plugins)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = Arc::new(build_core_config(&cli));
    let modifier = build_modifier(&cli);
    let plugins = build_plugins(&cli).await?;

    eprintln!(
        "wiretap: {} input(s), {} output(s)",
        plugins.inputs.len(),
        plugins.outputs.len()
    );

    let emitter = Emitter::start(plugins, config.clone(), modifier, cli.middleware.as_deref()).await?;

    if let Some(exit_after) = config.exit_after {
        tokio::time::sleep(exit_after).await;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    eprintln!("wiretap: shutting down");
    emitter.close().await;
    Ok(())
}
