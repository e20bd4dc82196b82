//! Cowatch - Room Relay Server
//!
//! A WebSocket relay for watch party rooms with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Environment: RELAY_BIND, RELAY_PORT, AUTH_URL, ROOMS_URL,
//! RECONNECT_GRACE_SECS, BULK_QUEUE_DEPTH

mod dashboard;
mod metrics;
mod network;

use parking_lot::RwLock;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.iter().any(|a| a == "--no-dashboard");

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(metrics).await
    } else {
        network::run_with_logging(metrics).await
    }
}
