//! `ChatSync` harness server -- in-memory backend collaborator.
//!
//! Serves the WebSocket event channel and the HTTP request/response routes
//! the synchronization engine expects, entirely in memory.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8001
//! cargo run --bin chatsync-harness
//!
//! # Run on custom address
//! cargo run --bin chatsync-harness -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;

use chatsync_harness::config::{HarnessCliArgs, HarnessConfig};
use chatsync_harness::server;
use chatsync_harness::state::HarnessState;

#[tokio::main]
async fn main() {
    let cli = HarnessCliArgs::parse();

    let config = match HarnessConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting chatsync harness");

    let state = Arc::new(HarnessState::with_max_upload_size(config.max_upload_size));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "harness listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "harness task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start harness");
            std::process::exit(1);
        }
    }
}
