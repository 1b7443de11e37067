use anyhow::{bail, Context, Result};
use clap::Args;
use runlens_client::{parse_base_url, ActionConfig, StreamConfig, WatchOptions};
use runlens_core::session::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS, DEFAULT_BACKOFF_MAX_SHIFT,
};
use runlens_core::BackoffPolicy;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_API_BASE: &str = "http://localhost:8000";
const DEFAULT_LOG_DIR: &str = ".runlens/logs";
const DEFAULT_POLL_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 600;
const DEFAULT_FOLLOWUP_REFRESH_MS: u64 = 800;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Backend REST base URL.
    #[arg(long, global = true)]
    pub api_base: Option<String>,
    /// WebSocket base URL; derived from the API base when unset.
    #[arg(long, global = true)]
    pub stream_base: Option<String>,
    #[arg(long, global = true)]
    pub log_dir: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[arg(long, global = true)]
    pub backoff_base_ms: Option<u64>,
    #[arg(long, global = true)]
    pub backoff_cap_ms: Option<u64>,
    #[arg(long, global = true)]
    pub backoff_max_shift: Option<u32>,
    #[arg(long, global = true)]
    pub poll_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,
    #[arg(long, global = true)]
    pub followup_refresh_ms: Option<u64>,
    #[arg(long, global = true)]
    pub request_timeout_ms: Option<u64>,
    /// Bound on one websocket connect attempt before it counts as failed.
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: Url,
    pub stream_base: Url,
    pub log_dir: PathBuf,
    pub log_stdout: bool,
    pub log_level: String,
    pub request_timeout: Duration,
    pub stream: StreamConfig,
    pub actions: ActionConfig,
}

pub fn load_config(args: &GlobalArgs) -> Result<Config> {
    load_config_with(args, &|key| std::env::var(key).ok())
}

fn load_config_with(args: &GlobalArgs, env: &dyn Fn(&str) -> Option<String>) -> Result<Config> {
    let api_base = resolve_api_base(args, env)?;
    let stream_base = resolve_stream_base(args, env, &api_base)?;
    let backoff = BackoffPolicy::new(
        resolve_millis(
            args.backoff_base_ms,
            env,
            "RUNLENS_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
        )?,
        resolve_millis(
            args.backoff_cap_ms,
            env,
            "RUNLENS_BACKOFF_CAP_MS",
            DEFAULT_BACKOFF_CAP_MS,
        )?,
        args.backoff_max_shift.unwrap_or(DEFAULT_BACKOFF_MAX_SHIFT),
    );
    let watch = WatchOptions {
        timeout: resolve_millis(
            args.poll_timeout_ms,
            env,
            "RUNLENS_POLL_TIMEOUT_MS",
            DEFAULT_POLL_TIMEOUT_MS,
        )?,
        interval: resolve_millis(
            args.poll_interval_ms,
            env,
            "RUNLENS_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?,
    };
    if watch.interval.is_zero() {
        bail!("poll interval must be greater than zero");
    }
    let followup_refresh = resolve_millis(
        args.followup_refresh_ms,
        env,
        "RUNLENS_FOLLOWUP_REFRESH_MS",
        DEFAULT_FOLLOWUP_REFRESH_MS,
    )?;
    let request_timeout = resolve_millis(
        args.request_timeout_ms,
        env,
        "RUNLENS_REQUEST_TIMEOUT_MS",
        DEFAULT_REQUEST_TIMEOUT_MS,
    )?;
    let connect_timeout = resolve_millis(
        args.connect_timeout_ms,
        env,
        "RUNLENS_CONNECT_TIMEOUT_MS",
        DEFAULT_CONNECT_TIMEOUT_MS,
    )?;
    if connect_timeout.is_zero() {
        bail!("connect timeout must be greater than zero");
    }

    Ok(Config {
        api_base,
        stream_base,
        log_dir: resolve_log_dir(args, env),
        log_stdout: env("RUNLENS_LOG_STDOUT")
            .and_then(|value| parse_bool_flag(&value))
            .unwrap_or(false),
        log_level: resolve_log_level(args, env),
        request_timeout,
        stream: StreamConfig {
            backoff,
            connect_timeout,
            ..StreamConfig::default()
        },
        actions: ActionConfig {
            watch,
            followup_refresh,
        },
    })
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn resolve_api_base(args: &GlobalArgs, env: &dyn Fn(&str) -> Option<String>) -> Result<Url> {
    let raw = non_empty(args.api_base.clone())
        .or_else(|| non_empty(env("RUNLENS_API_BASE")))
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    parse_base_url(&raw).context("invalid api base")
}

fn resolve_stream_base(
    args: &GlobalArgs,
    env: &dyn Fn(&str) -> Option<String>,
    api_base: &Url,
) -> Result<Url> {
    match non_empty(args.stream_base.clone()).or_else(|| non_empty(env("RUNLENS_STREAM_BASE"))) {
        Some(raw) => parse_base_url(&raw).context("invalid stream base"),
        None => Ok(api_base.clone()),
    }
}

fn resolve_log_dir(args: &GlobalArgs, env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    non_empty(args.log_dir.clone())
        .or_else(|| non_empty(env("RUNLENS_LOG_DIR")))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn resolve_log_level(args: &GlobalArgs, env: &dyn Fn(&str) -> Option<String>) -> String {
    if args.debug {
        return "debug".to_string();
    }
    non_empty(env("RUNLENS_LOG_LEVEL")).unwrap_or_else(|| "info".to_string())
}

fn resolve_millis(
    flag: Option<u64>,
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration> {
    if let Some(value) = flag {
        return Ok(Duration::from_millis(value));
    }
    match non_empty(env(key)) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("{key} must be a whole number of milliseconds")),
        None => Ok(Duration::from_millis(default)),
    }
}
