//! RUDP Node - line-oriented messaging peer
//!
//! Every line read from stdin is sent as a text signal to each configured
//! peer; lines received from peers are printed to stdout. A line starting
//! with `/reply ` goes back over the connection of the last received line.

use clap::Parser;
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use rudp::{ConnectionUid, SendOptions, Service};
use rudp_cli::{logging, text_registry, Incoming, NodeConfig, TextSignal};
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "rudp-node")]
#[command(about = "Reliable UDP messaging peer", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local base address (overrides the config file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Peer base address; may be repeated (adds to the config file)
    #[arg(short, long = "peer")]
    peers: Vec<SocketAddr>,

    /// Keepalive interval in milliseconds, 0 to disable
    #[arg(long)]
    keepalive_ms: Option<u64>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&NodeConfig::example())?);
        return Ok(());
    }

    logging::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load '{}': {}", path.display(), e))?,
        None => NodeConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    config.peers.extend(args.peers.iter().copied());
    if let Some(keepalive_ms) = args.keepalive_ms {
        config.session.keepalive_ms = keepalive_ms;
    }

    let (inbox, incoming) = unbounded::<Incoming>();
    let service = Service::start(config.service_config()?, text_registry(inbox))?;
    tracing::info!("Listening on: {}", service.base_addr());
    for peer in &config.peers {
        tracing::info!("Peer: {}", peer);
    }

    let last_sender: Arc<Mutex<Option<ConnectionUid>>> = Arc::new(Mutex::new(None));

    let printer_last = last_sender.clone();
    let printer = thread::spawn(move || {
        let stdout = io::stdout();
        for message in incoming.iter() {
            *printer_last.lock() = Some(message.peer.connection);
            let mut out = stdout.lock();
            if writeln!(out, "[{}] {}", message.peer.addr, message.text).is_err() {
                break;
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Some(reply) = line.strip_prefix("/reply ") {
            let connection = *last_sender.lock();
            match connection {
                Some(connection) => {
                    if let Err(e) = service.send_to(connection, Box::new(TextSignal::new(reply))) {
                        tracing::warn!("Reply failed: {}", e);
                    }
                }
                None => tracing::warn!("Nothing to reply to"),
            }
            continue;
        }

        for peer in &config.peers {
            let signal = Box::new(TextSignal::new(line.as_str()));
            if let Err(e) = service.send_signal(*peer, signal, SendOptions::default()) {
                tracing::warn!("Send to {} failed: {}", peer, e);
            }
        }
    }

    tracing::info!("Input closed, shutting down");
    service.shutdown();
    // The registry, and with it the last inbox sender, lives in the service
    let _ = printer.join();
    Ok(())
}
