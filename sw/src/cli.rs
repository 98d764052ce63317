//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wave-scheduled swarm orchestrator for LLM coding agents
#[derive(Debug, Parser)]
#[command(name = "sw", version, about)]
pub struct Cli {
    /// Path to a config file (otherwise .swarmd.yml, then user config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a swarm against a task prompt
    Run {
        /// The task to decompose and execute
        prompt: Vec<String>,

        /// Override the aggregate token budget
        #[arg(long)]
        budget: Option<u64>,

        /// Override the cost ceiling in USD
        #[arg(long)]
        max_cost: Option<f64>,

        /// Override the worker concurrency limit
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Disable quality gating for this run
        #[arg(long)]
        no_quality_gates: bool,

        /// Working directory for workers and artifact checks
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// Resume a checkpointed session
    Resume {
        /// Session id as shown by `sw sessions`
        session_id: String,

        /// Working directory for workers and artifact checks
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// List resumable sessions
    Sessions,

    /// Print the effective configuration as YAML
    Config,
}
