//! Device listing and detail views.

use std::fmt::Write;
use std::sync::Arc;

use tabled::Tabled;

use smartrent_core::{Controller, DeviceFilter, DeviceSnapshot, DeviceSummary};

use crate::cli::{DevicesArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Online")]
    online: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Pending")]
    pending: String,
}

impl From<&DeviceSummary> for DeviceRow {
    fn from(d: &DeviceSummary) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone().unwrap_or_default(),
            kind: d.kind.to_string(),
            online: match d.online {
                Some(true) => output::status_word("yes", true),
                Some(false) => output::status_word("no", false),
                None => "-".into(),
            },
            version: d.version,
            pending: if d.pending { "yes".into() } else { String::new() },
        }
    }
}

/// Multi-line detail view. Attributes awaiting acknowledgement are starred.
fn detail(d: &Arc<DeviceSnapshot>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ID:       {}", d.id);
    let _ = writeln!(out, "Name:     {}", d.name.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "Kind:     {}", d.kind);
    let _ = writeln!(out, "Version:  {}", d.version);
    let _ = writeln!(out, "Updated:  {}", d.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let width = d.attributes.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in &d.attributes {
        let marker = if d.is_pending(name) { " *" } else { "" };
        let _ = write!(out, "\n  {name:<width$}  {value}{marker}");
    }
    if !d.pending.is_empty() {
        let _ = write!(out, "\n\n* awaiting acknowledgement");
    }
    out
}

pub async fn list(controller: &Controller, args: &DevicesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    controller.refresh_all().await?;

    let devices: Vec<DeviceSummary> = match args.kind {
        Some(kind) => controller
            .devices_matching(DeviceFilter::ByKind(kind.into()))
            .iter()
            .map(|d| d.summary())
            .collect(),
        None => controller.list_devices(),
    };

    let out = output::render_list(global.output, &devices, |d| DeviceRow::from(d), |d| d.id.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn show(controller: &Controller, id: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let snapshot = controller.refresh_device(id).await?;
    print_snapshot(&snapshot, global)
}

fn print_snapshot(snapshot: &Arc<DeviceSnapshot>, global: &GlobalOpts) -> Result<(), CliError> {
    let out = output::render_single(global.output, snapshot, detail, |d| d.id.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}
