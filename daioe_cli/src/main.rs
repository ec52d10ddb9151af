mod cli;
mod display;
mod error;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Cli, RunCommand};
use daioe::config::Config;
use log::debug;

const DEFAULT_LOGGING_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to `DEFAULT_LOGGING_LEVEL` if not set
    let _ =
        std::env::var("RUST_LOG").map_err(|_| std::env::set_var("RUST_LOG", DEFAULT_LOGGING_LEVEL));
    pretty_env_logger::init_timed();
    let args = Cli::parse();
    debug!("args: {args:?}");
    let config: Config = read_config_from_toml()?;
    debug!("config: {config:?}");

    if let Some(command) = args.command {
        command.run(config).await?;
    }
    Ok(())
}

fn read_config_from_toml() -> Result<Config> {
    // Linux: ~/.config/daioe/config.toml
    // macOS: ~/Library/Application Support/daioe/config.toml
    let file_path = dirs::config_dir()
        .ok_or_else(|| anyhow!("No config directory on this platform"))?
        .join("daioe")
        .join("config.toml");
    match std::fs::read_to_string(&file_path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML in config file {}", file_path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => {
            Err(e).with_context(|| format!("Error reading config file {}", file_path.display()))
        }
    }
}
