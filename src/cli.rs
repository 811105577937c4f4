use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::capture::simulated::SimulateAction;
use crate::capture::{DEFAULT_OPEN_RETRIES, DeviceInfo};
use crate::config;

#[derive(Parser)]
#[command(name = "capbroker", about = "Capture hardware broker for web pages")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker daemon
    Broker {
        /// Socket path (default: $XDG_RUNTIME_DIR/capbroker/broker.sock)
        #[arg(long, env = "CAPBROKER_SOCKET")]
        socket: Option<PathBuf>,

        /// Embedding application id, `<platform>:<identifier>`
        #[arg(long, env = "CAPBROKER_APP_ID")]
        app_id: String,

        /// Embedding application key
        #[arg(long, env = "CAPBROKER_APP_KEY")]
        app_key: String,

        /// Embedding application developer id (UUID)
        #[arg(long, env = "CAPBROKER_DEVELOPER_ID")]
        developer_id: String,

        /// Identifier page app ids must match
        #[arg(long, env = "CAPBROKER_BUNDLE_ID")]
        bundle_id: Option<String>,

        /// Extra attempts when opening the capture layer fails
        #[arg(long, default_value_t = DEFAULT_OPEN_RETRIES)]
        open_retries: u32,

        /// Simulated device, `GUID=NAME` (repeatable)
        #[arg(long = "device", value_parser = config::parse_device)]
        devices: Vec<DeviceInfo>,
    },

    /// Act as one web page attached to the broker
    Page {
        /// Socket path (default: $XDG_RUNTIME_DIR/capbroker/broker.sock)
        #[arg(long, env = "CAPBROKER_SOCKET")]
        socket: Option<PathBuf>,

        /// URL the page displays
        #[arg(long)]
        url: String,

        /// Bring the page to the foreground after attaching
        #[arg(long)]
        focus: bool,

        /// Stop after this many milliseconds without traffic
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,

        /// JSON-RPC requests to post, in order
        requests: Vec<String>,
    },

    /// Raise a hardware event on a running broker's simulated devices
    Simulate {
        /// Socket path (default: $XDG_RUNTIME_DIR/capbroker/broker.sock)
        #[arg(long, env = "CAPBROKER_SOCKET")]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: SimulateCommand,
    },
}

#[derive(Subcommand)]
pub enum SimulateCommand {
    /// Plug in a device
    Connect {
        guid: String,
        name: String,
        #[arg(long, default_value_t = 0)]
        device_type: u32,
        /// Announce it as a device manager
        #[arg(long)]
        manager: bool,
    },
    /// Unplug a device
    Disconnect { guid: String },
    /// Decode `data` on a device
    Scan {
        guid: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        source_id: i32,
        #[arg(long, default_value = "")]
        source_name: String,
    },
    Power {
        guid: String,
        #[arg(allow_negative_numbers = true)]
        state: i32,
    },
    Battery {
        guid: String,
        level: i32,
    },
    Buttons {
        guid: String,
        state: i32,
    },
    /// Report a capture layer error code
    Error {
        #[arg(allow_negative_numbers = true)]
        code: i32,
    },
}

impl From<SimulateCommand> for SimulateAction {
    fn from(cmd: SimulateCommand) -> Self {
        match cmd {
            SimulateCommand::Connect {
                guid,
                name,
                device_type,
                manager,
            } => Self::Connect {
                guid,
                name,
                device_type,
                manager,
            },
            SimulateCommand::Disconnect { guid } => Self::Disconnect { guid },
            SimulateCommand::Scan {
                guid,
                data,
                source_id,
                source_name,
            } => Self::Scan {
                guid,
                data,
                source_id,
                source_name,
            },
            SimulateCommand::Power { guid, state } => Self::Power { guid, state },
            SimulateCommand::Battery { guid, level } => Self::Battery { guid, level },
            SimulateCommand::Buttons { guid, state } => Self::Buttons { guid, state },
            SimulateCommand::Error { code } => Self::Error { code },
        }
    }
}
