//! Roomgate: room gateway server
//!
//! Front door of a multiplayer room server: HTTP matchmaking under
//! `/matchmake` and WebSocket connections that join rooms through seat
//! reservations. Rooms are relayed in-process by the local matchmaker.
//!
//! Usage:
//!   roomgate                                     # Default port 2567, room "lobby"
//!   roomgate --port 8080 --room battle:4         # Custom port, 4-player rooms
//!   roomgate --port /tmp/roomgate.sock           # Listen on a Unix socket
//!   roomgate --tls-cert cert.pem --tls-key key.pem

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gate_rooms::{LocalMatchmaker, LocalMatchmakerConfig, RoomDefinition};
use gate_transport::{ListenEndpoint, TlsConfig, TransportConfig, TransportServer};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "roomgate", about = "Roomgate: room matchmaking gateway")]
struct Cli {
    /// TCP port (0 for OS-assigned) or Unix socket path
    #[arg(long, default_value = "2567")]
    port: String,

    /// Hostname to bind to (TCP only)
    #[arg(long, default_value = "0.0.0.0")]
    hostname: String,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<u32>,

    /// Path to TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Maximum inbound message and matchmaking body size, in bytes
    #[arg(long, default_value = "1048576")]
    max_payload: usize,

    /// Maximum bytes buffered per socket before writes fail
    #[arg(long, default_value = "1048576")]
    max_backpressure: usize,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Heartbeat interval in milliseconds (0 disables heartbeats)
    #[arg(long, default_value = "0")]
    ping_interval: u64,

    /// Unanswered pings before a connection is dropped
    #[arg(long, default_value = "2")]
    ping_max_retries: u32,

    /// Delay every outbound message by this many milliseconds
    #[arg(long)]
    simulate_latency: Option<u64>,

    /// Seconds a seat reservation stays valid
    #[arg(long, default_value = "15")]
    seat_reservation_time: u64,

    /// Room type to offer, as `name` or `name:max_clients` (repeatable)
    #[arg(long = "room", default_value = "lobby")]
    rooms: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Write logs to a file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let log_file = cli.log_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some((path, file)),
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", path.display());
                None
            }
        }
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (log_file, cli.json_logs) {
        (Some((path, file)), json) => {
            let builder = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            eprintln!("Logging to {}", path.display());
        }
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let matchmaker = Arc::new(LocalMatchmaker::new(LocalMatchmakerConfig {
        seat_reservation_time: Duration::from_secs(cli.seat_reservation_time),
    }));
    for room in &cli.rooms {
        match RoomDefinition::parse(room) {
            Some(definition) => {
                matchmaker.define(&definition.name, definition.max_clients);
            }
            None => warn!("Ignoring invalid room definition \"{room}\""),
        }
    }

    let tls = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: cert.clone(),
            key_path: key.clone(),
        }),
        _ => None,
    };

    let config = TransportConfig {
        max_backpressure: cli.max_backpressure,
        max_payload_length: cli.max_payload,
        ping_interval: (cli.ping_interval > 0).then(|| Duration::from_millis(cli.ping_interval)),
        ping_max_retries: cli.ping_max_retries,
        simulate_latency: cli.simulate_latency.map(Duration::from_millis),
        max_connections: cli.max_connections,
        tls,
        ..TransportConfig::default()
    };

    let mut transport = TransportServer::with_matchmaker(config, matchmaker.clone());
    let endpoint = ListenEndpoint::parse(&cli.port, Some(&cli.hostname));
    let bound = match transport.listen(endpoint, cli.backlog).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    let scheme = if transport.is_tls() { "https" } else { "http" };
    println!();
    println!("  Roomgate listening on {bound}");
    println!("  Matchmaking:  {scheme}://{bound}/matchmake/<method>/<roomName>");
    println!("  Rooms:        {}", cli.rooms.join(", "));
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    println!();
    println!("  Shutting down...");
    matchmaker.begin_graceful_shutdown();
    transport.shutdown().await;
    println!("  Server stopped.");
}
