//! Stream device changes and connection state until Ctrl-C.

use tokio::sync::broadcast::error::RecvError;

use smartrent_core::{Controller, DeviceChange, DeviceFilter, DeviceKind, DeviceSnapshot};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output;

use super::control;

struct Filter {
    kind: Option<DeviceKind>,
    ids: Vec<String>,
}

impl Filter {
    fn matches(&self, device: &DeviceSnapshot) -> bool {
        self.kind.is_none_or(|k| device.kind == k) && (self.ids.is_empty() || self.ids.contains(&device.id))
    }
}

fn render(change: &DeviceChange, format: OutputFormat) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json | OutputFormat::JsonCompact => serde_json::to_string(change)?,
        OutputFormat::Plain => format!("{} {} {}", change.device_id, change.cause, change.snapshot.version),
        OutputFormat::Table => format!(
            "{}  {:<10} {}",
            change.snapshot.updated_at.format("%H:%M:%S"),
            change.cause.to_string(),
            control::summary(&change.snapshot)
        ),
    })
}

pub async fn handle(controller: &Controller, args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let filter = Filter {
        kind: args.kind.map(Into::into),
        ids: args.ids,
    };
    let mut updates = controller.updates();
    let mut states = controller.state_changes();

    // Current state first, then changes as they arrive.
    controller.refresh_all().await?;
    if global.output == OutputFormat::Table {
        for device in controller.devices_matching(DeviceFilter::All) {
            if filter.matches(&device) {
                output::print_output(&control::summary(&device), global.quiet);
            }
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if !global.quiet {
                    eprintln!("-- {state}");
                }
            }
            update = updates.recv() => match update {
                Ok(change) if filter.matches(&change.snapshot) => {
                    output::print_output(&render(&change, global.output)?, global.quiet);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "watch fell behind; some changes were skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
