//! Command-line interface.
//!
//! `serve` runs the HTTP server; `generate` drives one document end to end
//! from the terminal, printing progress to stderr and the final HTML to
//! stdout (or a file); `config` prints the resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::domain::EventPayload;
use crate::server;

/// Structured document generation service
#[derive(Parser, Debug)]
#[command(name = "scrivener")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (overrides BIND_ADDR)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Generate one document from a prompt and print the HTML
    Generate {
        /// Free-text description of the document to draft
        prompt: String,

        /// Write the HTML here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show resolved configuration (secrets redacted)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { address } => serve(address).await,
            Commands::Generate { prompt, output } => generate(&prompt, output).await,
            Commands::Config => show_config(),
        }
    }
}

async fn serve(address: Option<String>) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(address) = address {
        config.bind_addr = address;
    }
    server::serve(config).await
}

/// Run a single job locally, following its event stream to completion.
async fn generate(prompt: &str, output: Option<PathBuf>) -> Result<()> {
    if prompt.trim().is_empty() {
        anyhow::bail!("prompt must not be empty");
    }

    let config = Config::from_env()?;
    let state = server::build_state(&config);

    let job = state.registry.create(prompt).await;
    state.broker.open(job.id).await;
    let subscription = state.broker.attach(job.id).await?;
    let mut receiver = subscription
        .live
        .context("event channel closed before the job started")?;

    let orchestrator = Arc::clone(&state.orchestrator);
    let job_id = job.id;
    tokio::spawn(async move {
        orchestrator.run(job_id).await;
    });

    eprintln!("[job {job_id}]");
    let mut html = String::new();
    let mut failure: Option<String> = None;

    while let Some(event) = receiver.recv().await {
        match event.payload {
            EventPayload::Start => eprintln!("[start]"),
            EventPayload::Variables(vars) => {
                eprintln!(
                    "[variables] {} ({}, {})",
                    vars.title, vars.contract_type, vars.jurisdiction
                );
            }
            EventPayload::Outline(outline) => {
                eprintln!("[outline] {} sections", outline.len());
                for plan in &outline {
                    eprintln!("  {} {}", plan.number, plan.title);
                }
            }
            EventPayload::Progress(marker) => eprintln!("[progress] {}", marker.as_str()),
            EventPayload::Chunk(chunk) => html.push_str(&chunk),
            EventPayload::Error(message) => {
                failure = Some(message);
                break;
            }
            EventPayload::Done => break,
        }
    }

    if let Some(message) = failure {
        anyhow::bail!("generation failed: {message}");
    }

    match output {
        Some(path) => {
            std::fs::write(&path, &html)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("[written {} bytes to {}]", html.len(), path.display());
        }
        None => println!("{html}"),
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::from_env()?;
    println!("{config}");
    Ok(())
}
