// Inspect and clear the step cache

use chrono::Utc;
use clap::{Args, Subcommand};
use color_eyre::Result;
use pipe_core::{cache, CacheStore, Paths};

use crate::output;

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List cached step results
    List,

    /// Remove one step's cache entry, or everything
    Clear {
        /// Step id to clear; clears the whole cache when omitted
        step_id: Option<String>,
    },
}

pub fn execute(args: CacheArgs) -> Result<()> {
    let store = CacheStore::new(&Paths::resolve());

    match args.command {
        CacheCommand::List => {
            let entries = store.list()?;
            if entries.is_empty() {
                output::dim("cache is empty");
                return Ok(());
            }

            let now = Utc::now();
            let width = entries.iter().map(|e| e.step_id.len()).max().unwrap_or(0);
            for entry in entries {
                let expiry = match entry.expires_at {
                    None => "never expires".to_string(),
                    Some(at) if now < at => format!("expires {}", at.to_rfc3339()),
                    Some(_) => "expired".to_string(),
                };
                let valid = if cache::is_valid(&entry, now) {
                    "\x1b[32mvalid\x1b[0m"
                } else {
                    "\x1b[31mstale\x1b[0m"
                };
                println!(
                    "{:<width$}  {valid}  cached {}  ({expiry})",
                    entry.step_id,
                    entry.cached_at.to_rfc3339(),
                );
            }
        }

        CacheCommand::Clear { step_id: Some(id) } => {
            store.clear(&id)?;
            output::success(&format!("cleared cache for {id:?}"));
        }

        CacheCommand::Clear { step_id: None } => {
            store.clear_all()?;
            output::success("cleared all cache entries");
        }
    }
    Ok(())
}
