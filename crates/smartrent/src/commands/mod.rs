//! Command dispatch: bridges CLI args -> controller calls -> output formatting.

pub mod config_cmd;
pub mod control;
pub mod devices;
pub mod totp;
pub mod watch;

use smartrent_core::Controller;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a session-bound command to its handler.
pub async fn dispatch(
    cmd: Command,
    controller: &Controller,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Devices(args) => devices::list(controller, &args, global).await,
        Command::Device { id } => devices::show(controller, &id, global).await,
        Command::Lock { id } => control::set_locked(controller, &id, true, global).await,
        Command::Unlock { id } => control::set_locked(controller, &id, false, global).await,
        Command::Thermostat(args) => control::thermostat(controller, args.command, global).await,
        Command::Status { id } => control::status(controller, &id, global).await,
        Command::Watch(args) => watch::handle(controller, args, global).await,
        Command::Config(_) | Command::Totp | Command::Completions { .. } => Err(CliError::Internal(
            "local command reached the session dispatcher".into(),
        )),
    }
}
