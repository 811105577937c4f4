//! `page` subcommand: a scriptable stand-in for one web page.
//!
//! Attaches to the broker as a transport, optionally takes the foreground,
//! posts each request in order and prints every delivery until the broker
//! goes quiet.

mod format;
mod page_client;

use std::path::PathBuf;
use std::time::Duration;

use page_client::PageClient;

use crate::capture::simulated::SimulateAction;
use crate::config;

/// URL the simulator connection attaches with. It never opens sessions.
const SIMULATOR_URL: &str = "capbroker:simulator";

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broker: {0}")]
    Broker(String),
    #[error("request is not JSON: {0}")]
    BadRequest(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// What the page should do once attached.
pub struct PageScript {
    pub socket: Option<PathBuf>,
    pub url: String,
    pub focus: bool,
    pub wait: Duration,
    pub requests: Vec<String>,
}

/// Run the page client. Called from `main.rs` for `Command::Page`.
pub async fn run(script: PageScript) -> Result<(), ClientError> {
    // Reject bad input before touching the broker.
    for request in &script.requests {
        serde_json::from_str::<serde_json::Value>(request)?;
    }

    let socket_path = config::resolve_socket_path(script.socket)?;
    let mut page = PageClient::attach(&socket_path, &script.url).await?;

    if script.focus {
        page.focus().await?;
    }
    for request in &script.requests {
        page.post(request).await?;
    }

    while let Some(call) = page.next_call(script.wait).await? {
        format::print_call(&call);
    }
    Ok(())
}

/// Send one simulated hardware action to the broker. Called from `main.rs`
/// for `Command::Simulate`.
pub async fn simulate(socket: Option<PathBuf>, action: SimulateAction) -> Result<(), ClientError> {
    let socket_path = config::resolve_socket_path(socket)?;
    let mut client = PageClient::attach(&socket_path, SIMULATOR_URL).await?;
    client.simulate(action).await
}
