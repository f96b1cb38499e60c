use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::io::ErrorKind;

use crate::config::Config;
use crate::store::{AppId, BackendStore, FileStore};

/// Delete an app's backend storage file.
///
/// This runs outside the server process, so the recorded state stands in
/// for the live registry: an app recorded as active is refused.
pub async fn run(config: &Config, app_id: String) -> Result<()> {
    let app_id: AppId = app_id
        .parse()
        .with_context(|| format!("Invalid app id '{app_id}'"))?;

    let store = FileStore::new(config.paths.records_dir());
    let Some(record) = store
        .load(&app_id)
        .await
        .context("Failed to read app record")?
    else {
        bail!("App not found: {app_id}");
    };

    if record.backend_state.is_active() {
        bail!(
            "Backend of {app_id} is {}; stop it before clearing its storage",
            record.backend_state
        );
    }

    let path = config.paths.storage_path(&app_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => println!(
            "{} Cleared storage of {} ({})",
            "✓".green(),
            app_id.as_str().cyan(),
            path.display()
        ),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            println!("{} {} has no stored data", "ℹ".blue(), app_id.as_str().cyan());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    }

    Ok(())
}
