//! Tandem relay: development room server for tandem workspaces.
//!
//! Environment:
//! - `TANDEM_BIND`: listen address (default `127.0.0.1:9090`)
//! - `TANDEM_MAX_USERS`: members allowed per room
//! - `RUST_LOG`: log filter, e.g. `info` or `tandem_sync=debug`

use log::{error, info, warn};
use tandem_sync::{Relay, RelayConfig};

fn config_from_env() -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_BIND") {
        config.bind_addr = addr;
    }
    if let Ok(max) = std::env::var("TANDEM_MAX_USERS") {
        match max.parse() {
            Ok(max) => config.max_users_per_room = max,
            Err(e) => warn!("Ignoring TANDEM_MAX_USERS={max}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting tandem relay on {}...", config.bind_addr);
    let relay = Relay::new(config);

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats().await;
            info!(
                "Shutting down: {} connections served, {} frames relayed",
                stats.total_connections, stats.total_frames
            );
        }
    }
}
