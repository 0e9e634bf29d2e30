//! Relay command implementation.

use scribe_sync::{Relay, RelayConfig};

/// Run a relay until interrupted.
pub async fn run(bind: String, capacity: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig {
        bind_addr: bind,
        channel_capacity: capacity,
    };
    let relay = Relay::bind(config).await?;
    println!("Relay listening on {}", relay.base_url()?);
    println!("Clients join with: scribe connect --url {}", relay.base_url()?);

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats().await;
            println!(
                "Shutting down: {} connections served, {} frames relayed, {} dropped",
                stats.total_connections, stats.rooms.frames_relayed, stats.rooms.frames_dropped
            );
        }
    }

    Ok(())
}
