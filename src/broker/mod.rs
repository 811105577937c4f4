//! Broker daemon: sessions, ownership arbitration, event fan-out.
//!
//! The broker sits between attached host transports (browser tabs, web
//! views) and the single shared capture layer. It listens on a Unix domain
//! socket; each connection is one transport.
//!
//! Architecture: channel-based actor. A single broker loop owns all
//! mutable state ([`state::BrokerState`]). Per-connection tasks forward
//! host frames via mpsc channels. Capture events and property call
//! completions arrive on their own channels and are handled by the same
//! loop, so every core operation runs to completion before the next.

mod connection;
mod fanout;
pub mod handle;
mod interpreter;
pub mod outbox;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::{BrokerCommand, DisconnectNotice};
use outbox::CallCompletion;
use registry::Registry;
use state::BrokerState;
use transport::TransportId;

use crate::capture::simulated::SimulatedCapture;
use crate::capture::{self, CaptureLayer, EventReceiver};
use crate::config::BrokerConfig;
use crate::rpc::error::BrokerError;

/// Broker startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerSetupError {
    #[error("broker already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("socket path {0} has no parent directory")]
    NoSocketDir(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("capture layer: {0}")]
    Capture(#[from] BrokerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the broker daemon until SIGTERM or SIGINT.
///
/// Opens the capture layer (with bounded retries) before binding the
/// socket and closes it after the loop exits.
///
/// # Errors
///
/// Returns `BrokerSetupError` if the capture layer cannot be opened or
/// closed, socket bind fails, or another broker is already running.
pub async fn run(config: BrokerConfig) -> Result<(), BrokerSetupError> {
    let (simulated, events) = SimulatedCapture::new();
    for device in &config.devices {
        simulated.seed(device.clone());
    }
    let capture: Arc<dyn CaptureLayer> = Arc::new(simulated.clone());

    capture::open_with_retries(capture.as_ref(), &config.app_info, config.open_retries).await?;

    let listener = bind_socket(&config.socket_path).await?;
    tracing::info!(path = %config.socket_path.display(), "broker listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    let registry = Registry::new(config.bundle_id.clone());
    serve(listener, Arc::clone(&capture), Some(simulated), events, registry, shutdown).await;

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(error = %e, path = %config.socket_path.display(), "failed to remove socket");
    }

    capture::close(capture.as_ref()).await?;
    tracing::info!("broker stopped");
    Ok(())
}

/// The broker loop. Returns once `shutdown` resolves.
///
/// `simulator`, when given, receives the actions of `simulate` frames.
async fn serve<F>(
    listener: UnixListener,
    capture: Arc<dyn CaptureLayer>,
    simulator: Option<SimulatedCapture>,
    mut events: EventReceiver,
    registry: Registry,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<BrokerCommand>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DisconnectNotice>();
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<CallCompletion>();

    let mut state = BrokerState::new(capture, registry, completion_tx);
    if let Some(simulator) = simulator {
        state = state.with_simulator(simulator);
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        accept_connection(stream, &mut state, &cmd_tx, &disconnect_tx);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Frame from a connection task --
            Some(cmd) = cmd_rx.recv() => {
                let response = state.handle_message(cmd.transport_id, cmd.request);
                if let (Some(tx), Some(response)) = (cmd.response_tx, response) {
                    let _ = tx.send(response);
                }
            }

            // -- Connection disconnected --
            Some(notice) = disconnect_rx.recv() => {
                state.remove_transport(notice.transport_id);
                tracing::debug!(transport = ?notice.transport_id, "connection cleaned up");
            }

            // -- Hardware event --
            Some(event) = events.recv() => {
                state.handle_capture_event(event);
            }

            // -- Property call finished --
            Some(completion) = completion_rx.recv() => {
                state.handle_completion(completion);
            }

            () = &mut shutdown => break,
        }
    }
}

/// Accept a new connection: register its transport and spawn its task.
fn accept_connection(
    stream: UnixStream,
    state: &mut BrokerState,
    cmd_tx: &mpsc::UnboundedSender<BrokerCommand>,
    disconnect_tx: &mpsc::UnboundedSender<DisconnectNotice>,
) {
    let transport_id = TransportId::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state.add_transport(transport_id, outbound_tx);

    connection::spawn_connection(
        stream,
        transport_id,
        cmd_tx.clone(),
        outbound_rx,
        disconnect_tx.clone(),
    );

    tracing::debug!(?transport_id, "accepted connection");
}

// -- Socket setup --

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another broker
/// is running. If it fails, the socket is stale and is removed.
async fn bind_socket(path: &Path) -> Result<UnixListener, BrokerSetupError> {
    let parent = path
        .parent()
        .ok_or_else(|| BrokerSetupError::NoSocketDir(path.to_path_buf()))?;
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| BrokerSetupError::MkdirFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            BrokerSetupError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            }
        })?;
    }

    let bind_failed = |source| BrokerSetupError::BindFailed {
        path: path.to_path_buf(),
        source,
    };

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => match UnixStream::connect(path).await {
            Ok(_) => Err(BrokerSetupError::AlreadyRunning(path.to_path_buf())),
            Err(_) => {
                tracing::info!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path).map_err(bind_failed)?;
                UnixListener::bind(path).map_err(bind_failed)
            }
        },
        Err(e) => Err(bind_failed(e)),
    }
}
