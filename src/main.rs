//! briefbot - connect to the configured tool servers and drive them from the shell.
//!
//! Thin caller over `ServerManager`: every subcommand connects all servers,
//! does its work, and cleans up before exiting.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use briefbot::mcp_client::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use briefbot::mcp_client::{Outcome, ServerConfigStore, ServerManager};

/// Tool-server orchestrator for the briefbot agent
#[derive(Parser)]
#[command(name = "briefbot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server configuration document (JSON or YAML)
    #[arg(long, global = true, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured server and report its status
    Servers {
        /// Print statuses as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the aggregated tool catalog in the LLM tool shape
    Tools,

    /// Invoke one tool and print the normalized result
    Call {
        /// Tool name as listed by `briefbot tools`
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    briefbot::init_tracing();

    let specs = ServerConfigStore::new(&cli.config).load();
    if specs.is_empty() {
        eprintln!("No servers configured in {}", cli.config.display());
    }

    let mut manager = ServerManager::new(specs);
    let command = cli.command;

    manager
        .scoped(|manager| {
            Box::pin(async move {
                let summary = manager.connect_to_all().await;
                for (name, error) in &summary.failures {
                    eprintln!("warning: {name}: {error}");
                }
                run(manager, command).await
            })
        })
        .await
}

async fn run(manager: &mut ServerManager, command: Commands) -> Result<()> {
    match command {
        Commands::Servers { json } => {
            let statuses = manager.statuses();
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
                return Ok(());
            }
            for status in statuses {
                let error = status
                    .error
                    .map(|e| format!("  ({e})"))
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<14} {:>3} tools{error}",
                    status.name, status.state, status.tool_count
                );
            }
            println!("{}", manager.tools_summary());
        }
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&manager.llm_tools())?);
        }
        Commands::Call { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = manager
                .call_tool(&tool, arguments)
                .await
                .with_context(|| format!("calling tool '{tool}'"))?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.outcome == Outcome::Failure {
                anyhow::bail!("tool '{tool}' reported failure");
            }
        }
    }
    Ok(())
}
