//! Echo server driving the reactor library.

use std::net::Ipv4Addr;

use clap::Parser;
use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "Multi-reactor TCP echo server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    ip: Ipv4Addr,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Number of worker event loops
    #[arg(long, default_value_t = 3)]
    threads: usize,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Share the port across processes via SO_REUSEPORT
    #[arg(long)]
    reuse_port: bool,
}

/// RUST_LOG takes precedence over the CLI-selected level.
fn init_logging(level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let option = if args.reuse_port {
        ServerOption::ReusePort
    } else {
        ServerOption::NoReusePort
    };

    let event_loop = EventLoop::new()?;
    let addr = InetAddress::new(args.ip, args.port);
    let mut server = TcpServer::new(&event_loop, &addr, "echo", option)?;
    server.set_thread_num(args.threads);

    server.set_connection_callback(|conn| {
        if conn.connected() {
            tracing::info!(peer = %conn.peer_address(), "connection up");
        } else {
            tracing::info!(peer = %conn.peer_address(), "connection down");
        }
    });
    server.set_message_callback(|conn, buf, _receive_time| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    });

    server.start()?;
    tracing::info!(
        addr = %server.listen_address(),
        workers = args.threads,
        "echo server running"
    );
    event_loop.run();
    Ok(())
}
