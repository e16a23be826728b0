//! CLI definition using clap derive.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "artsync", about = "Keep frame displays in art mode unless their source is in use")]
pub struct Cli {
    /// UDS socket path (default: $XDG_RUNTIME_DIR/artsync/artsyncd.sock)
    #[arg(long, short = 's', global = true, env = "ARTSYNC_SOCKET")]
    pub socket_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (pair controllers + control socket)
    Daemon(DaemonOpts),
    /// Validate a config file and print the pairs it defines
    CheckConfig(ConfigOpts),
    /// List running pairs
    ListPairs,
    /// Show pair status (all pairs when --pair is omitted)
    Status(StatusOpts),
    /// Show a pair's recent events, newest first
    Events(EventsOpts),
    /// Put the display into art mode now
    ForceArt(PairOpts),
    /// Switch the display to the source input now
    ForceSource(PairOpts),
    /// Turn the display fully off now
    ForceOff(PairOpts),
    /// Run a drift check now
    Resync(PairOpts),
    /// End the drift override and re-enforce
    ClearOverride(PairOpts),
    /// Close the command-rate breaker
    ClearBreaker(PairOpts),
    /// Resume source reconnection after re-pairing the device
    RepairSource(PairOpts),
}

#[derive(Args)]
pub struct DaemonOpts {
    #[command(flatten)]
    pub config: ConfigOpts,
}

#[derive(Args)]
pub struct ConfigOpts {
    /// Config file path (default: $XDG_CONFIG_HOME/artsync/artsync.toml)
    #[arg(long, short = 'c', env = "ARTSYNC_CONFIG")]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct PairOpts {
    /// Pair id; may be omitted when the daemon runs a single pair
    #[arg(long, short = 'p')]
    pub pair: Option<String>,
}

#[derive(Args)]
pub struct StatusOpts {
    #[command(flatten)]
    pub pair: PairOpts,

    /// Print raw JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct EventsOpts {
    #[command(flatten)]
    pub pair: PairOpts,

    /// Maximum number of entries
    #[arg(long, short = 'n', default_value = "20")]
    pub limit: usize,

    /// Print raw JSON
    #[arg(long)]
    pub json: bool,
}

/// Default socket path using $USER for per-user isolation.
pub fn default_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/artsync/artsyncd.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/artsync-{user}/artsyncd.sock")
}

pub fn default_config_path() -> String {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return format!("{dir}/artsync/artsync.toml");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.config/artsync/artsync.toml")
}
