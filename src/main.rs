//! Workbench service entry point.
//!
//! Serves the PDF workbench API over HTTP. The identity collaborator is
//! wired from a token-table file here; deployments fronted by the real
//! identity service swap that wiring without touching the engine.

use std::collections::HashMap;
use std::process;
use std::sync::Arc;

use clap::{Arg, Command, ValueEnum};
use serde::Deserialize;
use tracing::{error, info};

use acrofill::config::AppConfig;
use acrofill::guard::{Identity, IdentityProvider, Role, StaticTokenProvider};
use acrofill::http::{router, AppState};

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Info, warning, and error messages (default)
    Info,
    /// Debug and all messages
    Debug,
    /// Trace and all messages (most verbose)
    Trace,
}

/// One row of the token-table file handed to the static identity provider.
#[derive(Debug, Deserialize)]
struct TokenEntry {
    user_id: String,
    #[serde(default)]
    email: Option<String>,
    role: String,
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let log_level = matches
        .get_one::<LogLevel>("verbose")
        .unwrap_or(&LogLevel::Info);
    init_logging(log_level);

    let config = match matches.get_one::<String>("config") {
        Some(path) => match AppConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("failed to load config file: {}", e);
                process::exit(1);
            }
        },
        None => AppConfig::default(),
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        process::exit(1);
    }

    let identity = match matches.get_one::<String>("tokens") {
        Some(path) => match load_token_table(path) {
            Ok(provider) => provider,
            Err(e) => {
                error!("failed to load token table: {}", e);
                process::exit(1);
            }
        },
        None => {
            error!("a token table is required (--tokens <FILE>)");
            process::exit(1);
        }
    };

    let state = match AppState::from_config(&config, identity) {
        Ok(state) => state,
        Err(e) => {
            error!("failed to initialize workbench state: {}", e);
            process::exit(1);
        }
    };

    let bind_addr = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| config.server.bind_addr.clone());

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", bind_addr, e);
            process::exit(1);
        }
    };

    info!("PDF workbench listening on {}", bind_addr);
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("server error: {}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("acrofill")
        .version("0.1.0")
        .about("PDF form discovery, fill, masking and draft versioning service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (JSON/YAML)"),
        )
        .arg(
            Arg::new("tokens")
                .short('t')
                .long("tokens")
                .value_name("FILE")
                .help("Token table file (JSON/YAML) mapping bearer tokens to identities"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Listen address, overrides the config file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .value_parser(clap::value_parser!(LogLevel))
                .default_value("info")
                .help("Set logging verbosity"),
        )
}

fn init_logging(level: &LogLevel) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter_level = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("acrofill={}", filter_level)))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

fn load_token_table(path: &str) -> Result<Arc<dyn IdentityProvider>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read token table: {e}"))?;

    let entries: HashMap<String, TokenEntry> = serde_json::from_str(&content)
        .or_else(|_| serde_yaml::from_str(&content))
        .map_err(|e| format!("token table parsing error: {e}"))?;

    let mut provider = StaticTokenProvider::new();
    for (token, entry) in entries {
        let role = match entry.role.as_str() {
            "admin" => Role::Admin,
            "staff" => Role::Staff,
            _ => Role::Client,
        };
        provider = provider.with_token(
            token,
            Identity {
                user_id: entry.user_id,
                email: entry.email,
                role,
            },
        );
    }
    Ok(Arc::new(provider))
}
