//! courier: operator CLI for supervised A2A delegation
//!
//! Usage:
//!   courier agents
//!   courier send --url http://127.0.0.1:9000 --message "USD to GBP?"
//!   courier send --url http://127.0.0.1:9000 --message "and EUR?" --context-id <id>
//!   courier check --tool a2a_send_message --args '{"message": "hi"}'

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};

use courier_a2a::AgentRegistry;
use courier_core::{GateVerdict, ToolInvocationGate};

#[derive(Parser)]
#[command(name = "courier", version, about = "Supervised delegation to remote A2A agents")]
struct Cli {
    /// Config file (defaults to ~/.courier/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the configured agents and print their cards
    Agents,

    /// Send one message to a remote agent and print its events
    Send {
        /// Full agent URL, e.g. http://127.0.0.1:9000
        #[arg(long)]
        url: String,
        #[arg(long)]
        message: String,
        /// A2A context id from an earlier reply, to continue that conversation
        #[arg(long)]
        context_id: Option<String>,
    },

    /// Show how the gate classifies a tool invocation
    Check {
        #[arg(long)]
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config(cli.config.as_deref())?;
    debug!("courier v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Agents => {
            let registry = AgentRegistry::from_config(&config)?;
            if registry.known_urls().is_empty() {
                println!("No agents configured. Add URLs under [agents] known_urls.");
                return Ok(());
            }
            for (url, result) in registry.discover_all().await {
                match result {
                    Ok(card) => {
                        println!("{} ({})", card.name, url);
                        if !card.description.is_empty() {
                            println!("  {}", card.description);
                        }
                        println!("  streaming: {}", card.capabilities.streaming);
                        for skill in &card.skills {
                            println!("  - {}: {}", skill.name, skill.description);
                        }
                    }
                    Err(e) => println!("{} unavailable: {}", url, e),
                }
            }
        }

        Commands::Send {
            url,
            message,
            context_id,
        } => {
            let registry = AgentRegistry::from_config(&config)?;
            info!("Sending to {}", url);
            let reply = registry
                .send_message(&url, &message, context_id.as_deref())
                .await
                .with_context(|| format!("Delegation to {} failed", url))?;

            for event in &reply.events {
                let tag = match (event.is_final, event.requires_input) {
                    (true, true) => "input-required",
                    (true, false) => "final",
                    _ => "working",
                };
                println!("[{}] {}", tag, event.content);
            }
            if let Some(remote_context) = &reply.context_id {
                println!("context_id: {}", remote_context);
            }
            if reply.state.is_some_and(|s| s.is_failure()) {
                bail!(
                    "Remote task ended as {}",
                    reply.state.map(|s| s.to_string()).unwrap_or_default()
                );
            }
        }

        Commands::Check { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let gate = ToolInvocationGate::new(&config.gate);
            match gate.classify(&tool, &arguments) {
                GateVerdict::AutoApprove => println!("{}: auto-approved", tool),
                GateVerdict::RequireApproval => println!("{}: requires approval", tool),
                GateVerdict::Rejected(violation) => println!("{}: rejected ({})", tool, violation),
            }
        }
    }

    Ok(())
}
