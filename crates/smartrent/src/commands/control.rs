//! Lock, thermostat and status commands.

use std::fmt::Write;
use std::sync::Arc;

use smartrent_core::{Controller, DeviceKind, DeviceSnapshot};

use crate::cli::{GlobalOpts, ThermostatCommand};
use crate::error::CliError;
use crate::output;

/// One-line human summary of a device.
pub(crate) fn summary(d: &DeviceSnapshot) -> String {
    let state = match d.kind {
        DeviceKind::Lock => {
            let mut line = match d.locked() {
                Some(true) => output::status_word("locked", true),
                Some(false) => output::status_word("unlocked", false),
                None => "unknown".into(),
            };
            if let Some(level) = d.battery_level() {
                let _ = write!(line, ", battery {level}%");
            }
            line
        }
        DeviceKind::Thermostat => {
            let fmt = |v: Option<f64>| v.map_or_else(|| "-".into(), |v| format!("{v}°"));
            let mut line = format!(
                "{} (cool {}, heat {}), fan {}",
                d.mode().map_or_else(|| "-".into(), |m| m.to_string()),
                fmt(d.cooling_setpoint()),
                fmt(d.heating_setpoint()),
                d.fan_mode().map_or_else(|| "-".into(), |m| m.to_string()),
            );
            if let Some(temp) = d.current_temp() {
                let _ = write!(line, ", now {temp}°");
            }
            if let Some(op) = d.operating_state() {
                let _ = write!(line, ", {op}");
            }
            line
        }
    };
    let offline = if d.online() == Some(false) { " [offline]" } else { "" };
    format!("{}: {state}{offline}", d.display_name())
}

fn print(snapshot: &Arc<DeviceSnapshot>, global: &GlobalOpts) -> Result<(), CliError> {
    let out = output::render_single(global.output, snapshot, |d| summary(d), |d| summary(d))?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn set_locked(
    controller: &Controller,
    id: &str,
    locked: bool,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let snapshot = controller.set_locked(id, locked).await?;
    print(&snapshot, global)
}

pub async fn thermostat(
    controller: &Controller,
    command: ThermostatCommand,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let snapshot = match command {
        ThermostatCommand::Mode { id, mode } => controller.set_hvac_mode(&id, mode).await?,
        ThermostatCommand::Fan { id, mode } => controller.set_fan_mode(&id, mode).await?,
        ThermostatCommand::Cool { id, value } => controller.set_cooling_setpoint(&id, value).await?,
        ThermostatCommand::Heat { id, value } => controller.set_heating_setpoint(&id, value).await?,
        ThermostatCommand::Nudge { id, delta, heat: true } => {
            controller.adjust_heating_setpoint(&id, delta).await?
        }
        ThermostatCommand::Nudge { id, delta, heat: false } => {
            controller.adjust_cooling_setpoint(&id, delta).await?
        }
    };
    print(&snapshot, global)
}

/// Request a fresh status from the server and print it.
pub async fn status(controller: &Controller, id: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let snapshot = controller.refresh_device(id).await?;
    print(&snapshot, global)
}
