//! pokeyd: run a Pokey fleet and take operator commands on stdin.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{select, Receiver};
use pokey_fleet::{
    EventLatch, Fleet, FleetConfig, FleetError, FleetResult, FleetService, OperatorCommand,
    OperatorReply, TokioTransport, TransportOptions,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pokeyd", version, about = "Discover, poll and map a fleet of Pokey I/O units")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print operator replies as JSON.
    #[arg(long)]
    json: bool,

    /// Start with discovery broadcasts disabled.
    #[arg(long)]
    no_discovery: bool,

    /// Start with polling disabled.
    #[arg(long)]
    no_poll: bool,

    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "prometheus")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args) {
        error!("pokeyd failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> FleetResult<()> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::load(path)?,
        None => FleetConfig::default(),
    };
    if args.no_discovery {
        config.discovery_enabled = false;
    }
    if args.no_poll {
        config.poll_enabled = false;
    }

    #[cfg(feature = "prometheus")]
    {
        if let Some(addr) = args.metrics_addr {
            pokey_metrics::install_prometheus(addr)
                .map_err(|e| FleetError::Io(std::io::Error::other(e)))?;
            info!(%addr, "serving metrics");
        }
    }
    pokey_metrics::describe_metrics();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let transport = Arc::new(TokioTransport::new(
        runtime.handle().clone(),
        inbound_tx,
        TransportOptions::from(&config),
    )?);
    let latch = Arc::new(EventLatch::new(config.peek_expiry()));
    let fleet = Arc::new(Fleet::new(config, transport, latch));
    fleet.bootstrap()?;

    let service = FleetService::start(fleet, inbound_rx)?;

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| FleetError::Io(std::io::Error::other(e)))?;

    let lines = spawn_stdin_reader()?;
    loop {
        let line = select! {
            recv(shutdown_rx) -> _ => None,
            recv(lines) -> line => Some(line),
        };
        let Some(line) = line else {
            break;
        };
        let Ok(line) = line else {
            // stdin closed; keep running until signalled.
            let _ = shutdown_rx.recv();
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            break;
        }

        let reply = match line.parse::<OperatorCommand>() {
            Ok(command) => service.execute(command),
            Err(e) => OperatorReply::error(e),
        };
        print_reply(&reply, args.json);
    }

    service.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn print_reply(reply: &OperatorReply, json: bool) {
    if !json {
        println!("{}", reply);
        return;
    }
    match reply.to_json() {
        Ok(text) => println!("{}", text),
        Err(e) => error!("cannot serialize reply: {}", e),
    }
}

/// Read stdin lines on a thread of their own.
fn spawn_stdin_reader() -> std::io::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("pokey-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}
