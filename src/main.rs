mod broker;
mod capture;
mod cli;
mod client;
mod config;
mod ipc;
mod rpc;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use crate::capture::AppInfo;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Broker {
            socket,
            app_id,
            app_key,
            developer_id,
            bundle_id,
            open_retries,
            devices,
        } => {
            let socket_path = config::resolve_socket_path(socket).unwrap_or_else(|e| {
                eprintln!("capbroker broker: {e}");
                std::process::exit(1);
            });
            let config = config::BrokerConfig {
                socket_path,
                app_info: AppInfo {
                    app_id,
                    app_key,
                    developer_id,
                },
                bundle_id,
                open_retries,
                devices,
            };
            if let Err(e) = broker::run(config).await {
                tracing::error!(error = %e, "broker failed");
                eprintln!("capbroker broker: {e}");
                std::process::exit(1);
            }
        }
        Command::Page {
            socket,
            url,
            focus,
            wait_ms,
            requests,
        } => {
            let script = client::PageScript {
                socket,
                url,
                focus,
                wait: Duration::from_millis(wait_ms),
                requests,
            };
            if let Err(e) = client::run(script).await {
                tracing::error!(error = %e, "page failed");
                eprintln!("capbroker page: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate { socket, action } => {
            if let Err(e) = client::simulate(socket, action.into()).await {
                tracing::error!(error = %e, "simulate failed");
                eprintln!("capbroker simulate: {e}");
                std::process::exit(1);
            }
        }
    }
}
