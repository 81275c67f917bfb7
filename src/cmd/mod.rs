//! CLI command implementations.
//!
//! | Module     | Commands handled                         |
//! |------------|------------------------------------------|
//! | `setup`    | `Init`, `Serve`                          |
//! | `orders`   | `Steps`, `Order`                         |
//! | `simulate` | `Tick`, `View`, `Reset`, `State`, `Run`  |

pub mod orders;
pub mod setup;
pub mod simulate;

pub use orders::{cmd_order, cmd_steps};
pub use setup::{cmd_init, cmd_serve};
pub use simulate::{cmd_reset, cmd_run, cmd_state, cmd_tick, cmd_view};

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use factory_line::config::{FACTORY_DIR, FactoryConfig};
use factory_line::factory::db::FactoryDb;

use super::Cli;

/// Resolve configuration: file, then environment, then CLI flags.
pub fn load_config(cli: &Cli) -> Result<FactoryConfig> {
    let mut config = match &cli.config {
        Some(path) => FactoryConfig::load(path)?,
        None => FactoryConfig::load_or_default(Path::new(FACTORY_DIR))?,
    };
    config.apply_env_overrides()?;
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    Ok(config)
}

/// Open (and migrate) the configured database, creating its directory.
pub fn open_db(config: &FactoryConfig) -> Result<FactoryDb> {
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    FactoryDb::with_busy_timeout(path, Duration::from_millis(config.database.busy_timeout_ms))
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
