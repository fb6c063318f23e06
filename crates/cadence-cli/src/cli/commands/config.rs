//! Config command handlers.

use anyhow::{Context, Result};
use cadence_core::config;

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

pub fn generate() -> Result<()> {
    let toml = config::Config::generate()?;
    print!("{toml}");
    Ok(())
}

pub fn auto_approval(enabled: bool) -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::save_auto_approval(enabled)
        .with_context(|| format!("update config at {}", config_path.display()))?;
    println!(
        "Auto-approval {} in {}",
        if enabled { "enabled" } else { "disabled" },
        config_path.display()
    );
    Ok(())
}
