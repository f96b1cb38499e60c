use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use crate::config::Config;
use crate::store::{AppId, BackendRecord, BackendStore, FileStore};

/// Create or update an app record from a backend source file.
pub async fn run(
    config: &Config,
    app_id: String,
    source: Option<PathBuf>,
    wallet_url: Option<String>,
) -> Result<()> {
    let app_id: AppId = app_id
        .parse()
        .with_context(|| format!("Invalid app id '{app_id}'"))?;

    let source_code = match &source {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read backend source: {}", path.display()))?,
        ),
        None => None,
    };

    let store = FileStore::new(config.paths.records_dir());
    let existing = store
        .load(&app_id)
        .await
        .context("Failed to read app record")?;
    let created = existing.is_none();

    let record = apply_registration(existing, app_id, source_code, wallet_url);
    store.save(&record).await.context("Failed to save app record")?;

    let verb = if created { "Registered" } else { "Updated" };
    println!("{} {} {}", "✓".green(), verb, record.app_id.as_str().cyan());
    if !record.has_backend() {
        println!("  {} no backend code; proxy requests will be refused", "⚠".yellow());
    }
    if record.backend_state.is_active() {
        println!(
            "  {} backend is {}; the new code takes effect on its next start",
            "ℹ".blue(),
            record.backend_state
        );
    }

    Ok(())
}

/// Merge a registration into the existing record. Lifecycle fields are left
/// alone; only code and wallet change, and only when given.
pub fn apply_registration(
    existing: Option<BackendRecord>,
    app_id: AppId,
    source_code: Option<String>,
    wallet_url: Option<String>,
) -> BackendRecord {
    let mut record = existing.unwrap_or_else(|| BackendRecord::new(app_id, None));
    if let Some(code) = source_code {
        record.backend_source_code = Some(code);
    }
    if let Some(url) = wallet_url.filter(|url| !url.trim().is_empty()) {
        record.wallet_connection_url = Some(url);
    }
    record.updated_at = chrono::Utc::now();
    record
}
