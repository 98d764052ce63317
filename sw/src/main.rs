//! Swarmd binary entry point

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use swarmd::cli::{Cli, Command};
use swarmd::config::SwarmConfig;
use swarmd::events::{EventBus, SwarmEvent};
use swarmd::orchestrator::Orchestrator;
use swarmd::pool::CommandSpawner;
use swarmd::state::CheckpointStore;

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "swarmd=info",
        1 => "swarmd=debug",
        _ => "swarmd=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let mut config = SwarmConfig::load(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            prompt,
            budget,
            max_cost,
            max_concurrency,
            no_quality_gates,
            workdir,
        } => {
            let prompt = prompt.join(" ");
            if prompt.trim().is_empty() {
                eyre::bail!("empty task prompt");
            }

            if let Some(budget) = budget {
                config.swarm.total_budget = budget;
            }
            if let Some(max_cost) = max_cost {
                config.swarm.max_cost = max_cost;
            }
            if let Some(max_concurrency) = max_concurrency {
                config.swarm.max_concurrency = max_concurrency;
            }
            if no_quality_gates {
                config.quality.enabled = false;
            }

            run_swarm(config, &prompt, workdir).await
        }

        Command::Resume { session_id, workdir } => {
            config.persistence.resume_session_id = Some(session_id);
            run_swarm(config, "", workdir).await
        }

        Command::Sessions => {
            let store = CheckpointStore::new(config.persistence.state_dir.clone());
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No resumable sessions under {}", config.persistence.state_dir.display());
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  {}  [{}] {} tasks  {}",
                    s.session_id,
                    s.timestamp.format("%Y-%m-%d %H:%M"),
                    s.phase,
                    s.tasks,
                    s.prompt_summary
                );
            }
            Ok(())
        }

        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn run_swarm(config: SwarmConfig, prompt: &str, workdir: Option<std::path::PathBuf>) -> Result<()> {
    let working_dir = match workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    let provider = swarmd::llm::create_provider(&config.provider)?;
    let spawner = Arc::new(CommandSpawner::new(config.spawner.command.clone())?);
    let bus = EventBus::with_default_capacity();

    // Print a compact progress line per event
    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut orchestrator = Orchestrator::new(config, provider, spawner, bus, working_dir)?;

    // Ctrl-C requests cooperative cancellation
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling swarm");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(prompt).await?;
    drop(printer);

    println!("\n{}", outcome.summary);
    if let Some(synthesis) = &outcome.synthesis_result {
        println!("\n{}", synthesis);
    }
    if !outcome.artifact_inventory.is_empty() {
        println!("\nArtifacts:");
        for file in &outcome.artifact_inventory {
            println!("  {}", file);
        }
    }
    if !outcome.errors.is_empty() {
        eprintln!("\nErrors:");
        for error in &outcome.errors {
            eprintln!("  {}", error);
        }
    }

    if outcome.success || outcome.partial_success {
        Ok(())
    } else {
        eyre::bail!("swarm run failed: {}", outcome.summary)
    }
}

fn print_event(event: &SwarmEvent) {
    match event {
        SwarmEvent::WaveStart { wave, task_count } => {
            println!("── wave {} ({} tasks)", wave, task_count);
        }
        SwarmEvent::TaskDispatched { task_id, model, attempt, .. } => {
            if *attempt == 0 {
                println!("  → {} [{}]", task_id, model);
            } else {
                println!("  → {} [{}] (attempt {})", task_id, model, attempt + 1);
            }
        }
        SwarmEvent::TaskCompleted { task_id, score, .. } => match score {
            Some(score) => println!("  ✓ {} (quality {}/5)", task_id, score),
            None => println!("  ✓ {}", task_id),
        },
        SwarmEvent::TaskFailed {
            task_id,
            cause,
            will_retry,
            ..
        } => {
            if *will_retry {
                println!("  ↻ {} ({})", task_id, cause);
            } else {
                println!("  ✗ {} ({})", task_id, cause);
            }
        }
        SwarmEvent::TaskSkipped { task_id, .. } => println!("  ⊘ {}", task_id),
        SwarmEvent::ModelFailover { task_id, from, to, reason } => {
            println!("  ⇄ {} {} → {} ({})", task_id, from, to, reason);
        }
        SwarmEvent::CircuitOpen { pause_ms, .. } => {
            println!("  ‖ rate-limit breaker open ({} ms)", pause_ms);
        }
        SwarmEvent::Replan { stuck, new_tasks } => {
            println!("  ⟳ replan: {} stuck, {} new tasks", stuck, new_tasks);
        }
        SwarmEvent::Complete {
            success,
            completed,
            total,
            ..
        } => {
            println!("── done: {}/{} ({})", completed, total, if *success { "success" } else { "incomplete" });
        }
        _ => {}
    }
}
