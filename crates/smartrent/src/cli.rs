//! Clap derive structures for the `smartrent` CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use smartrent_core::{DeviceKind, FanMode, HvacMode};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// smartrent -- control SmartRent locks and thermostats
#[derive(Debug, Parser)]
#[command(
    name = "smartrent",
    version,
    about = "Control SmartRent locks and thermostats from the command line",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Account profile to use
    #[arg(long, short = 'p', env = "SMARTRENT_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Account email (overrides profile)
    #[arg(long, env = "SMARTRENT_EMAIL", global = true)]
    pub email: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SMARTRENT_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Seconds to wait for the session to subscribe
    #[arg(long, env = "SMARTRENT_TIMEOUT", default_value = "30", global = true)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Lock,
    Thermostat,
}

impl From<KindArg> for DeviceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Lock => DeviceKind::Lock,
            KindArg::Thermostat => DeviceKind::Thermostat,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List locks and thermostats
    #[command(alias = "ls")]
    Devices(DevicesArgs),

    /// Show one device in detail
    Device {
        /// Device ID
        id: String,
    },

    /// Lock a door
    Lock {
        /// Lock device ID
        id: String,
    },

    /// Unlock a door
    Unlock {
        /// Lock device ID
        id: String,
    },

    /// Change thermostat settings
    #[command(alias = "t")]
    Thermostat(ThermostatArgs),

    /// Ask the server for a fresh device state
    Status {
        /// Device ID
        id: String,
    },

    /// Stream device changes until interrupted
    Watch(WatchArgs),

    /// Print the current two-factor code for the configured secret
    Totp,

    /// Manage configuration and stored secrets
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

impl Command {
    /// The single device this command targets, if any.
    pub fn target_device(&self) -> Option<&str> {
        match self {
            Self::Device { id } | Self::Lock { id } | Self::Unlock { id } | Self::Status { id } => {
                Some(id)
            }
            Self::Thermostat(args) => Some(args.command.device_id()),
            _ => None,
        }
    }
}

#[derive(Debug, Args)]
pub struct DevicesArgs {
    /// Only show devices of this kind
    #[arg(long, short = 'k')]
    pub kind: Option<KindArg>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Only show devices of this kind
    #[arg(long, short = 'k')]
    pub kind: Option<KindArg>,

    /// Only show these device IDs
    pub ids: Vec<String>,
}

// ── Thermostat ───────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ThermostatArgs {
    #[command(subcommand)]
    pub command: ThermostatCommand,
}

#[derive(Debug, Subcommand)]
pub enum ThermostatCommand {
    /// Set the HVAC mode (cool, heat, auto, off)
    Mode { id: String, mode: HvacMode },

    /// Set the fan mode (on, auto)
    Fan { id: String, mode: FanMode },

    /// Set the cooling setpoint
    Cool { id: String, value: f64 },

    /// Set the heating setpoint
    Heat { id: String, value: f64 },

    /// Move a setpoint up or down from its current value
    Nudge {
        id: String,

        /// Degrees to add; negative lowers the setpoint
        #[arg(allow_hyphen_values = true)]
        delta: f64,

        /// Nudge the heating setpoint instead of cooling
        #[arg(long)]
        heat: bool,
    },
}

impl ThermostatCommand {
    pub fn device_id(&self) -> &str {
        match self {
            Self::Mode { id, .. }
            | Self::Fan { id, .. }
            | Self::Cool { id, .. }
            | Self::Heat { id, .. }
            | Self::Nudge { id, .. } => id,
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration with secrets masked
    Show,

    /// Print the config file location
    Path,

    /// Store the account password in the system keyring
    SetPassword,

    /// Store the two-factor TOTP secret in the system keyring
    SetTfaSecret,
}
