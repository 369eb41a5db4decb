#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings)]
#![allow(clippy::multiple_crate_versions)]

//! Main entry point for the `DeepChat` backend CLI.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::Config;
use std::error::Error;
use std::path::PathBuf;

mod app_state;
mod auth;
mod db;
mod handlers;
mod http;
mod middleware;
mod routes;
mod server;
mod services;

/// Main CLI structure for the `DeepChat` server.
#[derive(Parser)]
#[command(name = "DeepChat CLI")]
#[command(about = "Backend server for DeepChat", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the backend server
    Serve {
        /// The port number to bind the server to.
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a TOML configuration file; profile defaults are used
        /// when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Loads configuration and starts the server.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let resolved_config =
        Config::load_config(config, port).map_err(|err| -> Box<dyn Error> { Box::new(err) })?;
    server::run(resolved_config).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = initialize_cli();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}
