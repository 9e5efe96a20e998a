//! Standalone collaboration server.

use clap::Parser;
use coedit::{CollabServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "coedit-server",
    version,
    about = "Real-time collaborative plain-text editing server"
)]
struct Args {
    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1:9400")]
    bind: String,

    /// Connection silence before a keepalive ping, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    stale_threshold_ms: u64,

    /// Connection silence before eviction, in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    evict_threshold_ms: u64,

    /// How long to retain empty document sessions, in milliseconds.
    #[arg(long, default_value_t = 0)]
    session_cleanup_delay_ms: u64,

    /// Inbound frame size limit in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_frame_bytes: usize,

    /// Maximum number of concurrent document sessions.
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,

    /// Maximum peers per document session.
    #[arg(long, default_value_t = 100)]
    max_peers_per_session: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        stale_threshold_ms: args.stale_threshold_ms,
        evict_threshold_ms: args.evict_threshold_ms,
        session_cleanup_delay_ms: args.session_cleanup_delay_ms,
        max_frame_bytes: args.max_frame_bytes,
        max_concurrent_sessions: args.max_sessions,
        max_peers_per_session: args.max_peers_per_session,
        ..ServerConfig::default()
    };

    let server = CollabServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            server.shutdown().await;
        }
    }
    Ok(())
}
