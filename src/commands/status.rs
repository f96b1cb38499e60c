use anyhow::{bail, Context, Result};
use colored::{ColoredString, Colorize};

use crate::config::Config;
use crate::store::{AppId, BackendRecord, BackendState, BackendStore, FileStore};

/// Print the recorded backend state of one app, or of every app.
pub async fn run(config: &Config, app_id: Option<String>) -> Result<()> {
    let store = FileStore::new(config.paths.records_dir());

    match app_id {
        Some(raw) => {
            let app_id: AppId = raw.parse().with_context(|| format!("Invalid app id '{raw}'"))?;
            let Some(record) = store
                .load(&app_id)
                .await
                .context("Failed to read app record")?
            else {
                bail!("App not found: {app_id}");
            };
            let storage_exists = config.paths.storage_path(&app_id).exists();
            print!("{}", format_record(&record, storage_exists));
        }
        None => {
            let records = store.list().await.context("Failed to list app records")?;
            print!("{}", format_records(&records));
        }
    }

    Ok(())
}

fn colored_state(state: BackendState) -> ColoredString {
    match state {
        BackendState::Running => state.as_str().green().bold(),
        BackendState::Starting | BackendState::Stopping => state.as_str().yellow(),
        BackendState::FailedToStart => state.as_str().red().bold(),
        BackendState::Stopped => state.as_str().dimmed(),
    }
}

pub fn format_record(record: &BackendRecord, storage_exists: bool) -> String {
    let rule = "━".repeat(50).dimmed();
    let mut out = format!("\n{rule}\n");
    out.push_str(&format!(
        "{}\n",
        format!("   Backend of {}", record.app_id).yellow().bold()
    ));
    out.push_str(&format!("{rule}\n"));
    out.push_str(&format!("  State:      {}\n", colored_state(record.backend_state)));
    out.push_str(&format!(
        "  Port:       {}\n",
        record
            .backend_port
            .map_or_else(|| "-".to_string(), |p| p.to_string())
            .cyan()
    ));
    out.push_str(&format!(
        "  Code:       {}\n",
        if record.has_backend() {
            format!("{} bytes", record.backend_source().map_or(0, str::len)).cyan()
        } else {
            "none".red()
        }
    ));
    out.push_str(&format!(
        "  Wallet:     {}\n",
        if record.wallet_connection_url.is_some() {
            "configured".cyan()
        } else {
            "default".dimmed()
        }
    ));
    out.push_str(&format!(
        "  Storage:    {}\n",
        if storage_exists {
            "present".cyan()
        } else {
            "empty".dimmed()
        }
    ));
    out.push_str(&format!(
        "  Updated:    {}\n",
        record
            .updated_at
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .cyan()
    ));
    out.push_str(&format!("{rule}\n"));
    out
}

pub fn format_records(records: &[BackendRecord]) -> String {
    if records.is_empty() {
        return format!(
            "\n{} No apps registered.\n  Run {} to add one.\n",
            "ℹ".blue(),
            "lnfly-backend register <APP_ID> --source <FILE>".green()
        );
    }

    let mut out = format!("\n{:<24} {:<16} {:<7} {}\n", "APP", "STATE", "PORT", "CODE");
    for record in records {
        out.push_str(&format!(
            "{:<24} {:<16} {:<7} {}\n",
            record.app_id.as_str(),
            colored_state(record.backend_state),
            record
                .backend_port
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            if record.has_backend() { "yes" } else { "no" }
        ));
    }
    out
}
