use std::{net::IpAddr, process::ExitCode};

use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

use sc_relay::{broker::Broker, http, BrokerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "SecureChat relay server", long_about = None)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    addr: String,

    /// Port to bind.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let addr: IpAddr = match cli.addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %cli.addr, error = %e, "invalid bind address");
            return ExitCode::from(2);
        }
    };

    let listener = match TcpListener::bind((addr, cli.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, port = cli.port, error = %e, "failed to bind");
            return ExitCode::from(1);
        }
    };

    let broker = Broker::start(BrokerConfig::default());
    info!(%addr, port = cli.port, "starting relay");

    tokio::select! {
        result = http::serve(listener, broker) => {
            if let Err(e) = result {
                error!(error = %e, "listener failed");
                return ExitCode::from(1);
            }
            ExitCode::SUCCESS
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            ExitCode::SUCCESS
        }
        _ = terminate() => {
            info!("received SIGTERM, shutting down");
            ExitCode::SUCCESS
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
