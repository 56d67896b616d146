//! Standalone signaling relay.
//!
//! ```text
//! PEER_RELAY_ADDR=0.0.0.0:4444 RUST_LOG=debug peer-relay
//! ```

use peer_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("PEER_RELAY_ADDR") {
        config.bind_addr = addr;
    }

    RelayServer::new(config).run().await
}
