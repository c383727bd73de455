//! Command-line interface and config loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use tg_domain::config::{Config, ConfigSeverity};

#[derive(Debug, Parser)]
#[command(name = "toolgate", about = "Multi-tenant MCP tools gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the TOML config file. Falls back to `$TG_CONFIG`, then
    /// `./toolgate.toml`, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Config utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report every issue.
    Validate,
    /// Print the effective config as TOML.
    Show,
}

/// Load the config from the given path, `$TG_CONFIG`, or `./toolgate.toml`.
/// A missing file yields the built-in defaults.
pub fn load_config(cli_path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = cli_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("TG_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("toolgate.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok((config, path))
}

/// `toolgate config validate`: print every issue, return overall validity.
pub fn validate(config: &Config, path: &Path) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: OK", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
}

/// `toolgate config show`: print the effective config.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
