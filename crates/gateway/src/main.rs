mod api;
mod auth;
mod log_sink;
mod state;
mod upstream_http;

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use keygate_domain::clock::SystemClock;
use keygate_domain::config::{Config, CorsConfig};
use keygate_keys::{Key, KeyLifecycle};

use log_sink::{ErrorLogWorker, RequestLogWorker};
use state::AppState;
use upstream_http::HttpUpstreamChatService;

/// keygate — a key lifecycle gateway fronting a generative-AI provider.
#[derive(Debug, Parser)]
#[command(name = "keygate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Validate the configuration and key source, then exit.
    Doctor,
    /// Dump the resolved configuration (with defaults) as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let config = load_config()?;
            let keys = load_keys(&config);
            println!("config ok");
            println!("keys configured: {}", keys.len());
            if keys.is_empty() {
                eprintln!("warning: no keys configured — set {}", config.keys.keys_env_var);
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config) => {
            let config = load_config()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,keygate_gateway=debug")))
        .json()
        .init();
}

/// Load configuration from the path in `KEYGATE_CONFIG` (or `config.toml`
/// by default), falling back to built-in defaults if no file exists.
fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("KEYGATE_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        Config::default()
    };

    Ok(config)
}

/// Reads the key list from `keys_env_var` (comma-separated) if set, else
/// from `keys_file` (newline-separated), else an empty list.
fn load_keys(config: &Config) -> Vec<Key> {
    if let Ok(raw) = std::env::var(&config.keys.keys_env_var) {
        return raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Key::new)
            .collect();
    }
    if let Some(path) = &config.keys.keys_file {
        if let Ok(raw) = std::fs::read_to_string(path) {
            return raw
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Key::new)
                .collect();
        }
    }
    Vec::new()
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("keygate starting");

    let keys = load_keys(&config);
    if keys.is_empty() {
        tracing::warn!("no keys configured — all requests will fail until keys are provided");
    } else {
        tracing::info!(count = keys.len(), "keys loaded");
    }

    let upstream = Arc::new(HttpUpstreamChatService::new(
        config.upstream.base_url.clone(),
        std::time::Duration::from_millis(config.upstream.request_timeout_ms),
    )?);

    let error_log = Arc::new(ErrorLogWorker::spawn());
    let request_log = Arc::new(RequestLogWorker::spawn());

    let lifecycle = KeyLifecycle::new(
        keys,
        &config,
        upstream.clone(),
        error_log.clone(),
        Arc::new(SystemClock),
    );
    tracing::info!(
        pool_enabled = config.pool.enabled,
        check_interval_hours = config.verifier.check_interval_hours,
        "key lifecycle ready"
    );

    let api_token_hash = match std::env::var(&config.server.api_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = %config.server.api_token_env, "API bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.server.api_token_env,
                "API bearer-token auth DISABLED — set this env var to enable"
            );
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        lifecycle,
        upstream,
        error_log,
        request_log,
        api_token_hash,
    };

    let cors_layer = build_cors_layer(&config.server.cors);

    let app = api::router(state.clone()).layer(cors_layer).with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "keygate listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. Origins may
/// contain a trailing `:*` wildcard for the port segment; a literal `"*"`
/// allows all origins.
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
