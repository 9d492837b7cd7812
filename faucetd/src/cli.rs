//! `faucetd config {create,dump,process}`, `faucetd db {create,sql}`, and
//! `faucetd serve`.

use std::path::PathBuf;

use clap::Subcommand;

use crate::config::{default_config, load_yaml, store_yaml, ConfigError};
use crate::db::{Db, CREATE_SQL};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, dump or reformat a YAML configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Create the claim-log database, or print its schema.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Run the HTTP server.
    Serve {
        /// Path to the YAML configuration file.
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a fresh configuration file with a newly generated token key.
    Create { out: PathBuf },
    /// Read a configuration file and print it back out with defaults filled in.
    Dump { config: PathBuf },
    /// Read a configuration file and rewrite it, filling in any missing defaults.
    Process { config: PathBuf, out: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum DbAction {
    /// Create the claims table in the database named by the config file.
    Create { config: PathBuf },
    /// Print the schema creation SQL for `driver` to stdout.
    Sql { driver: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database is not configured")]
    DbNotConfigured,
    #[error("no table creation SQL for driver {0:?}")]
    UnsupportedDriver(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn cmd_config(action: ConfigAction) -> Result<(), CliError> {
    match action {
        ConfigAction::Create { out } => {
            let mut cfg = default_config();
            cfg.faucet.token_key = Some(hex::encode(faucet_core::token::gen_token_key()));
            cfg.faucet.address_versions = vec![113, 196];
            cfg.rpc.cookie_file = crate::platform::default_cookie_file().unwrap_or_default();
            store_yaml(&out, &cfg)?;
        }
        ConfigAction::Dump { config } => {
            let cfg = load_yaml(&config)?;
            print!("{}", serde_yaml::to_string(&cfg).expect("config always serializes"));
        }
        ConfigAction::Process { config, out } => {
            let cfg = load_yaml(&config)?;
            store_yaml(&out, &cfg)?;
        }
    }
    Ok(())
}

pub async fn cmd_db(action: DbAction) -> Result<(), CliError> {
    match action {
        DbAction::Create { config } => {
            let cfg = load_yaml(&config)?;
            if !cfg.db.configured() {
                return Err(CliError::DbNotConfigured);
            }
            let db = Db::connect(&cfg.db).await?;
            db.create_tables().await?;
            db.close().await;
        }
        DbAction::Sql { driver } => {
            if driver != "sqlite3" && driver != "sqlite" {
                return Err(CliError::UnsupportedDriver(driver));
            }
            use std::io::Write;
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            for stmt in CREATE_SQL {
                writeln!(lock, "{stmt};")?;
            }
        }
    }
    Ok(())
}
