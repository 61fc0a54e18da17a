//! Command-line front end for Quarry migrations.
//!
//! `quarry [--config path] migrate up|down [step]|status [--json]|reset` and
//! `quarry [--config path] generate migration <name>`.

pub mod commands;
pub mod config;

pub use commands::{
    run, CliError, Cli, Command, GenerateTarget, MigrateAction, DEFAULT_CONFIG_PATH,
};
pub use config::{apply_env_overrides, load_config, Config, ConfigError};
