//! Command-line interface

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ralphd", version, about = "Agentic build orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator daemon (default)
    Serve(ServeArgs),
    /// Parse a plan file and check its invariants without running anything
    Validate(ValidateArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Port for the dashboard HTTP/WebSocket server
    #[arg(long, default_value_t = 3000, env = "RALPHD_PORT")]
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub hostname: String,

    /// Location of the persisted JSON document
    #[arg(long, default_value = "data/db.json")]
    pub data_file: PathBuf,

    /// Parent directory for project roots created without an explicit path
    #[arg(long)]
    pub projects_dir: Option<PathBuf>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            port: std::env::var("RALPHD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            hostname: "0.0.0.0".to_string(),
            data_file: PathBuf::from("data/db.json"),
            projects_dir: None,
        }
    }
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to a prd.json plan file
    pub plan: PathBuf,
}
