//! Command-line parsing and dispatch.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use quarry_db::{generate_migration_files, Connection, DbError, MigrationError, Migrator};
use thiserror::Error;

use crate::config::{Config, ConfigError};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "quarry.toml";

/// Errors surfaced by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Parser)]
#[command(name = "quarry")]
#[command(about = "Versioned schema migrations for MySQL, PostgreSQL and SQLite")]
#[command(version)]
pub struct Cli {
    /// Path to TOML configuration file [default: quarry.toml]
    #[arg(short, long, env = "QUARRY_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// The configuration path to load.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Apply, revert or inspect migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Create new files
    Generate {
        #[command(subcommand)]
        target: GenerateTarget,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum MigrateAction {
    /// Apply every pending migration
    Up,

    /// Revert the most recent migrations
    Down {
        /// Number of migrations to revert
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        step: i64,
    },

    /// List migrations and whether they are applied
    Status {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Revert everything, then apply everything
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum GenerateTarget {
    /// Create an empty up/down migration pair
    Migration {
        /// Migration name, snake-cased into the file names
        name: String,
    },
}

/// Runs `command`, writing human-readable output to `out`.
///
/// # Errors
///
/// Fails when the database cannot be reached or a migration fails.
pub fn run(command: &Command, config: &Config, out: &mut impl Write) -> Result<(), CliError> {
    match command {
        Command::Generate {
            target: GenerateTarget::Migration { name },
        } => {
            let (up, down) =
                generate_migration_files(&config.migrations.path, name, "sql", Utc::now())?;
            writeln!(out, "created {}", up.display())?;
            writeln!(out, "created {}", down.display())?;
            Ok(())
        }
        Command::Migrate { action } => {
            let mut conn = Connection::new(config.database.clone())?;
            conn.open()?;
            let result = migrate(action, config, &conn, out);
            conn.close()?;
            result
        }
    }
}

fn migrate(
    action: &MigrateAction,
    config: &Config,
    conn: &Connection,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let migrator = Migrator::from_dir(conn, &config.migrations.path)?;
    match action {
        MigrateAction::Up => {
            let applied = migrator.up()?;
            writeln!(out, "applied {applied} migration(s)")?;
        }
        MigrateAction::Down { step } => {
            let reverted = migrator.down(*step)?;
            writeln!(out, "reverted {reverted} migration(s)")?;
        }
        MigrateAction::Reset => {
            let applied = migrator.reset()?;
            writeln!(out, "reset; applied {applied} migration(s)")?;
        }
        MigrateAction::Status { json: true } => {
            let status = migrator.status()?;
            writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?;
        }
        MigrateAction::Status { json: false } => {
            let status = migrator.status()?;
            let width = status
                .iter()
                .map(|s| s.version.len())
                .max()
                .unwrap_or(0)
                .max("Version".len());
            writeln!(out, "{:<width$}  {:<8}  Name", "Version", "Status")?;
            for s in status {
                let state = if s.applied { "Applied" } else { "Pending" };
                writeln!(out, "{:<width$}  {:<8}  {}", s.version, state, s.name)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::CommandFactory;
    use quarry_db::ConnectionDetails;

    use super::*;

    // ── parsing ──

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("quarry").chain(args.iter().copied()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_migrate_actions() {
        let cli = parse(&["migrate", "up"]).expect("should parse");
        assert_eq!(
            cli.command,
            Command::Migrate {
                action: MigrateAction::Up
            }
        );

        let cli = parse(&["migrate", "down"]).expect("should parse");
        assert_eq!(
            cli.command,
            Command::Migrate {
                action: MigrateAction::Down { step: 1 }
            }
        );

        let cli = parse(&["migrate", "status", "--json"]).expect("should parse");
        assert_eq!(
            cli.command,
            Command::Migrate {
                action: MigrateAction::Status { json: true }
            }
        );
    }

    #[test]
    fn config_flag_and_generate() {
        let cli = parse(&["--config", "db/quarry.toml", "migrate", "down", "3"])
            .expect("should parse");
        assert_eq!(cli.config_path(), PathBuf::from("db/quarry.toml"));
        assert_eq!(
            cli.command,
            Command::Migrate {
                action: MigrateAction::Down { step: 3 }
            }
        );

        let cli = parse(&["-c", "q.toml", "generate", "migration", "AddUsers"])
            .expect("should parse");
        assert_eq!(
            cli.command,
            Command::Generate {
                target: GenerateTarget::Migration {
                    name: "AddUsers".into()
                }
            }
        );
    }

    #[test]
    fn help_is_not_a_config_path() {
        let err = parse(&["--help"]).expect_err("help exits early");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["migrate", "sideways"]).is_err());
        assert!(parse(&["migrate", "down", "two"]).is_err());
        assert!(parse(&["migrate", "down", "0"]).is_err());
        assert!(parse(&["migrate", "down", "--", "-1"]).is_err());
        assert!(parse(&["generate", "migration"]).is_err());
    }

    // ── running ──

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.database =
            ConnectionDetails::sqlite(dir.join("app.db").to_string_lossy().into_owned());
        config.migrations.path = dir.join("migrations").to_string_lossy().into_owned();
        config
    }

    fn write_pair(dir: &std::path::Path, version: &str, table: &str) {
        let migrations = dir.join("migrations");
        fs::create_dir_all(&migrations).expect("mkdir");
        fs::write(
            migrations.join(format!("{version}_create_{table}.up.sql")),
            format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"),
        )
        .expect("write up");
        fs::write(
            migrations.join(format!("{version}_create_{table}.down.sql")),
            format!("DROP TABLE {table};"),
        )
        .expect("write down");
    }

    fn migrate_cmd(action: MigrateAction) -> Command {
        Command::Migrate { action }
    }

    fn run_to_string(command: Command, config: &Config) -> String {
        let mut out = Vec::new();
        run(&command, config, &mut out).expect("command should succeed");
        String::from_utf8(out).expect("utf8 output")
    }

    #[test]
    fn migrate_up_down_and_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_pair(dir.path(), "1", "users");
        write_pair(dir.path(), "2", "orders");
        let config = config_in(dir.path());

        let out = run_to_string(migrate_cmd(MigrateAction::Up), &config);
        assert!(out.contains("applied 2"), "got: {out}");

        let out = run_to_string(migrate_cmd(MigrateAction::Down { step: 1 }), &config);
        assert!(out.contains("reverted 1"), "got: {out}");

        let out = run_to_string(migrate_cmd(MigrateAction::Status { json: false }), &config);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("Applied") && lines[1].contains("create_users"));
        assert!(lines[2].contains("Pending") && lines[2].contains("create_orders"));

        let out = run_to_string(migrate_cmd(MigrateAction::Status { json: true }), &config);
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid json");
        assert_eq!(parsed[0]["applied"], true);
        assert_eq!(parsed[1]["applied"], false);
    }

    #[test]
    fn generate_creates_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());

        let out = run_to_string(
            Command::Generate {
                target: GenerateTarget::Migration {
                    name: "AddWidgets".into(),
                },
            },
            &config,
        );
        assert_eq!(out.lines().count(), 2);

        let mut names: Vec<String> = fs::read_dir(dir.path().join("migrations"))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names[0].ends_with("_add_widgets.down.sql"));
        assert!(names[1].ends_with("_add_widgets.up.sql"));
    }

    #[test]
    fn unknown_dialect_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        config.database.dialect = "oracle".into();
        let mut out = Vec::new();
        assert!(matches!(
            run(&migrate_cmd(MigrateAction::Up), &config, &mut out),
            Err(CliError::Db(_))
        ));
    }
}
