//! dispatch-ng: SOCKS5 proxy with outbound interface load balancing.
//!
//! Parses the command line, populates the balancer, starts the listeners
//! and runs until every listener is gone or a termination signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_balancer::Balancer;
use dispatch_proxy::{Runtime, Server};

const DEFAULT_BINDS: [&str; 2] = ["127.0.0.1:1080", "[::1]:1080"];

#[derive(Parser)]
#[command(
    name = "dispatch-ng",
    about = "SOCKS5 proxy that balances outbound connections across multiple source addresses"
)]
struct Args {
    /// Listen on HOST:PORT (repeatable; default 127.0.0.1:1080 and [::1]:1080)
    #[arg(long = "bind", value_name = "HOST:PORT")]
    bind: Vec<String>,

    /// Outbound source addresses to dispatch across
    #[arg(value_name = "ADDR[@METRIC]", required = true)]
    ifaces: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let balancer = Balancer::new();
    for spec in &args.ifaces {
        let iface = balancer
            .add_from_spec(spec)
            .with_context(|| format!("invalid interface {spec:?}"))?;
        info!("dispatching via {} metric {}", iface.addr(), iface.metric());
    }

    let runtime = Runtime::new(balancer);

    let binds: Vec<String> = if args.bind.is_empty() {
        DEFAULT_BINDS.iter().map(|s| s.to_string()).collect()
    } else {
        args.bind.clone()
    };
    let mut servers = Vec::new();
    for bind in &binds {
        let server = Server::bind(&runtime, bind)
            .map_err(|e| anyhow::anyhow!("cannot listen on {bind}: {e}"))?;
        servers.push(server);
    }

    info!("running...");
    tokio::select! {
        _ = runtime.idle() => {}
        _ = shutdown_signal() => info!("shutting down"),
    }

    drop(servers);
    runtime.balancer().shutdown();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
