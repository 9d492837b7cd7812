//! `faucetd config {create,dump,process}` / `faucetd db {create,sql}` / `faucetd serve config.yaml`

use std::process::ExitCode;

use clap::Parser;
use faucetd::cli::{cmd_config, cmd_db, Command};
use faucetd::config::{load_yaml, CliArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let result = match args.command {
        Command::Config { action } => cmd_config(action).map_err(|e| e.to_string()),
        Command::Db { action } => cmd_db(action).await.map_err(|e| e.to_string()),
        Command::Serve { config } => run_serve(config).await,
    };

    if let Err(e) = result {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_serve(config_path: std::path::PathBuf) -> Result<(), String> {
    let cfg = load_yaml(&config_path).map_err(|e| e.to_string())?;
    faucetd::run::init_logging(&cfg.log);
    faucetd::serve(cfg).await.map_err(|e| e.to_string())
}
