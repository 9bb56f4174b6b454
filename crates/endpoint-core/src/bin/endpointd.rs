//! Endpoint adapter daemon
//!
//! Loads a TOML configuration, starts every configured device slot against
//! the in-process session runtime and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, info_span, Instrument};

use rvoip_endpoint_core::config::EndpointConfig;
use rvoip_endpoint_core::lifecycle::Endpoint;
use rvoip_endpoint_core::logging::{log_welcome, setup_logging};
use rvoip_endpoint_core::runtime::MemoryRuntime;

const APP_NAME: &str = "rvoip-endpointd";

#[derive(Parser, Debug)]
#[command(name = "rvoip-endpointd", version, about = "Telephony endpoint adapter")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log interface and connection spans as they open and close
    #[arg(long)]
    log_spans: bool,

    /// Include source file and line in log lines
    #[arg(long)]
    log_file_info: bool,

    /// Refuse new calls while this many sessions are live
    #[arg(long)]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = EndpointConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut logging = config.logging.clone();
    if let Some(level) = args.log_level {
        logging = logging.with_level(level);
    }
    if args.json_logs {
        logging = logging.with_json();
    }
    if args.log_spans {
        logging = logging.with_spans();
    }
    if args.log_file_info {
        logging = logging.with_file_info();
    }
    setup_logging(&logging)?;
    log_welcome(APP_NAME, env!("CARGO_PKG_VERSION"));

    let span = info_span!("endpoint", app = APP_NAME, profile = %config.endpoint.name);
    run(config, args.max_sessions).instrument(span).await
}

async fn run(config: EndpointConfig, max_sessions: Option<usize>) -> anyhow::Result<()> {
    let mut runtime = MemoryRuntime::new().with_auto_answer();
    if let Some(limit) = max_sessions {
        runtime = runtime.with_session_limit(limit);
    }

    let endpoint = Endpoint::start(config, Arc::new(runtime))
        .await
        .context("starting endpoint")?;
    if let Some(addr) = endpoint.listen_addr() {
        info!("Devices connect to {}", addr);
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Interrupted, shutting down");

    let report = endpoint.shutdown().await;
    if !report.is_clean() {
        info!("{} tasks had to be aborted", report.aborted);
    }
    Ok(())
}
