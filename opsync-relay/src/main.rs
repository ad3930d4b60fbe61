//! `opsync-relay`: in-memory realtime row store for opsync clients.
//!
//! ```bash
//! opsync-relay --bind 127.0.0.1:9000 --max-fetch-rows 500
//! OPSYNC_RELAY_ADDR=0.0.0.0:9000 RUST_LOG=opsync_relay=debug opsync-relay
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use opsync_relay::config::{RelayCliArgs, RelayConfig};
use opsync_relay::relay::{self, RelayState};
use opsync_relay::store::TableStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RelayConfig::load(&RelayCliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("opsync-relay: {e}");
            return ExitCode::from(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = Arc::new(RelayState::with_limits(config.limits, TableStore::new()));
    let (addr, server) = match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "cannot bind");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(%addr, limits = ?config.limits, "relay listening");

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server task ended");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            state.close_all_connections().await;
        }
    }
    ExitCode::SUCCESS
}
