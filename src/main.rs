// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modeldepot CLI.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use modeldepot::{
    DepotConfig, ModelArtifact, ModelManager, PullJob, PullJobHandle, PullOrchestrator,
    PullRegistry, PullStatus, RuntimeClient, RuntimeSupervisor,
};

#[derive(Parser)]
#[command(name = "modeldepot", version, about = "Model acquisition and runtime supervision")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or attach to) the runtime and provision baseline models
    Up,
    /// Pull a named model
    Pull {
        /// Model identifier, e.g. "qwen2.5:0.5b"
        model: String,
    },
    /// Download a raw artifact file with resume support
    Fetch {
        /// Source URL
        url: String,
        /// Destination path (defaults to the models directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download the configured pro model artifact
    Upgrade,
    /// Show live acquisition jobs
    Status,
    /// List models available in the runtime
    Models,
    /// Cancel a live acquisition job
    Cancel {
        /// Model identifier of the job to cancel
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_target(false)
        .init();

    let config = DepotConfig::load()?;
    let client = RuntimeClient::with_url(config.runtime_url());
    let orchestrator = PullOrchestrator::new(client.clone(), PullRegistry::new());
    let manager = ModelManager::new(config.clone(), orchestrator.clone());

    match cli.command {
        Commands::Up => {
            let supervisor = RuntimeSupervisor::new(config, orchestrator);
            if let Err(e) = supervisor.start().await {
                // Degraded but alive: the runtime may appear later.
                eprintln!("{} {}", "warning:".yellow().bold(), e);
            }
            println!("{}", "modeldepot running, Ctrl+C to stop".green());

            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
                .context("Failed to set Ctrl+C handler")?;
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            supervisor.stop().await;
        }
        Commands::Pull { model } => {
            let handle = orchestrator.ensure_present(&model).await;
            let job = watch_job(handle).await;
            report_outcome(&job);
        }
        Commands::Fetch { url, output } => {
            let dest = match output {
                Some(path) => path,
                None => {
                    let name = url.rsplit('/').next().unwrap_or("artifact.bin");
                    manager.config().models_dir.join(name)
                }
            };
            println!("Fetching {} -> {}", url.cyan(), dest.display());
            let handle = orchestrator
                .acquire(ModelArtifact::raw_file(url, dest))
                .await;
            let job = watch_job(handle).await;
            report_outcome(&job);
        }
        Commands::Upgrade => {
            if manager.is_pro_available() {
                println!(
                    "{} pro model already present at {}",
                    "✓".green(),
                    manager.pro_model_path().display()
                );
                return Ok(());
            }
            let handle = manager.start_pro_download().await;
            let job = watch_job(handle).await;
            report_outcome(&job);
        }
        Commands::Status => {
            if client.check_running().await {
                println!("Runtime: {} at {}", "up".green(), client.base_url());
            } else {
                println!("Runtime: {} at {}", "down".red(), client.base_url());
            }
            let jobs = manager.jobs();
            if jobs.is_empty() {
                println!("No acquisition jobs in flight");
            }
            for job in jobs {
                let pct = job
                    .percentage()
                    .map(|p| format!("{:>5.1}%", p))
                    .unwrap_or_else(|| "    --".to_string());
                println!(
                    "{:<40} {:<12} {} {} ({})",
                    job.model,
                    format!("{:?}", job.status),
                    pct,
                    HumanBytes(job.bytes_completed),
                    job.message
                );
            }
        }
        Commands::Models => {
            let models = client
                .list_models_detailed()
                .await
                .context("Is the runtime running? Try: modeldepot up")?;
            if models.is_empty() {
                println!("No models available yet");
            }
            for model in models {
                println!("{:<40} {}", model.name.cyan(), HumanBytes(model.size));
            }
        }
        Commands::Cancel { model } => {
            if manager.cancel(&model) {
                println!("{} cancelled {}", "✓".green(), model);
            } else {
                println!("No live job for {}", model);
            }
        }
    }

    Ok(())
}

/// Render a job's progress until it reaches a terminal state.
async fn watch_job(mut handle: PullJobHandle) -> PullJob {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    loop {
        let job = handle.current();
        if let Some(pct) = job.percentage() {
            bar.set_position(pct as u64);
        }
        bar.set_message(format!("{} ({})", job.message, HumanBytes(job.bytes_completed)));
        if job.status.is_terminal() {
            break;
        }
        if handle.changed().await.is_none() {
            break;
        }
    }

    bar.finish_and_clear();
    handle.current()
}

fn report_outcome(job: &PullJob) {
    match job.status {
        PullStatus::Succeeded => println!("{} {} ({})", "✓".green(), job.model, job.message),
        PullStatus::Cancelled => println!("{} {} cancelled", "−".yellow(), job.model),
        _ => {
            eprintln!("{} {} failed: {}", "✗".red(), job.model, job.message);
            std::process::exit(1);
        }
    }
}
