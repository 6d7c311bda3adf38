use anyhow::Context;
use clap::Parser;
use nbflow_core::frame::DEFAULT_MAX_FRAME_BYTES;
use nbflow_core::logging::{init_logging, LogConfig};
use nbflow_core::settings::env_value;
use nbflow_relay::{serve, RelayConfig, RelayState, DEFAULT_RELAY_ADDR};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nbflow-relay", about = "Collaboration relay: one broadcast room per notebook")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_message_bytes: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value("NBFLOW_RELAY_ADDR").unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("NBFLOW_LOG_DIR").unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&LogConfig {
        component: "nbflow-relay".to_string(),
        debug: args.debug,
        log_dir: resolve_log_dir(&args.log_dir),
        stderr: false,
    });

    let addr_text = resolve_addr(&args.addr);
    let addr: SocketAddr = addr_text
        .parse()
        .with_context(|| format!("invalid relay address {addr_text}"))?;
    let config = RelayConfig {
        max_message_bytes: args.max_message_bytes,
        write_timeout: Duration::from_secs(args.write_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        queue_capacity: args.queue_capacity,
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        event = "relay_config",
        addr = %addr,
        max_message_bytes = config.max_message_bytes,
        ping_interval_secs = args.ping_interval
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "relay_shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    serve(listener, Arc::new(RelayState::new(config)), shutdown_rx)
        .await
        .context("relay server failed")
}
