// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use modelvault::config::{config_path, Config};
use modelvault::download::{CreateJobOptions, Job, JobManager, JobStatus};
use modelvault::server::Server;
use modelvault::utils::{format_bytes, mask_sensitive};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// Download failed
    pub const ERROR: i32 = 1;
    /// Unknown job or unsupported URL
    pub const USAGE: i32 = 64;
    /// Interrupted by Ctrl+C
    pub const CANCELLED: i32 = 130;
}

#[derive(Parser)]
#[command(name = "modelvault")]
#[command(version = VERSION)]
#[command(about = "Download and organize AI models from Civitai, CivArchive and Hugging Face.")]
#[command(long_about = "modelvault - local AI model library\n\n\
    Download a model:    modelvault download https://civitai.com/models/4384\n\
    Start the API:       modelvault serve\n\
    List jobs:           modelvault jobs\n\
    Retry a job:         modelvault retry <id>")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    ///
    /// Examples:
    ///   modelvault serve
    ///   modelvault serve --port 9000 --bind 0.0.0.0
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Download a model and wait for it to finish
    ///
    /// Examples:
    ///   modelvault download https://civitai.com/models/4384?modelVersionId=128713
    ///   modelvault download https://huggingface.co/org/repo --model-type VAE
    Download {
        url: String,
        /// Output directory; relative paths go under the models directory
        #[arg(short, long)]
        output_dir: Option<String>,
        #[arg(long)]
        model_type: Option<String>,
        #[arg(long)]
        base_model: Option<String>,
    },

    /// List download jobs, newest first
    Jobs {
        /// Print the raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Retry a failed or cancelled job and wait for it
    Retry { id: String },

    /// Remove finished jobs from the store
    Clear,

    /// Show the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::load()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let code = runtime.block_on(run(cli.command, config))?;
    std::process::exit(code);
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Serve { port, bind } => {
            let manager = JobManager::from_config(&config)?;
            Server::new(manager)
                .with_port(port.unwrap_or(config.port))
                .with_bind_address(bind.unwrap_or_else(|| config.bind_address.clone()))
                .start()
                .await?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Download {
            url,
            output_dir,
            model_type,
            base_model,
        } => {
            let manager = JobManager::from_config(&config)?;
            let options = CreateJobOptions {
                output_dir,
                model_type,
                base_model,
            };
            match manager.create_job(&url, options) {
                Ok(job) => follow_job(&manager, job).await,
                Err(e) => {
                    eprintln!("{} {}", "[X]".red(), e);
                    Ok(exit_codes::USAGE)
                }
            }
        }
        Commands::Jobs { json } => {
            let manager = JobManager::from_config(&config)?;
            let jobs = manager.get_all_jobs();
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::Retry { id } => {
            let manager = JobManager::from_config(&config)?;
            match manager.retry_job(&id) {
                Ok(job) => follow_job(&manager, job).await,
                Err(e) => {
                    eprintln!("{} {}", "[X]".red(), e);
                    Ok(exit_codes::USAGE)
                }
            }
        }
        Commands::Clear => {
            let manager = JobManager::from_config(&config)?;
            let removed = manager.clear_completed();
            println!("{} Removed {} finished job(s)", "[OK]".green(), removed);
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config => {
            print_config(&config);
            Ok(exit_codes::SUCCESS)
        }
    }
}

/// Show a progress bar for `job` until it finishes. Ctrl+C cancels it.
async fn follow_job(manager: &JobManager, job: Job) -> Result<i32> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let subscription = manager.subscribe(&job.id, move |update| {
        let _ = tx.send(update.clone());
    });

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    bar.set_message("Resolving".to_string());
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut last = job;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => {
                    render(&bar, &update);
                    last = update;
                    if last.status.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                manager.cancel_job(&last.id);
            }
        }
    }
    drop(subscription);

    let last = manager.get_job(&last.id).unwrap_or(last);
    bar.finish_and_clear();
    Ok(report(&last))
}

fn render(bar: &ProgressBar, job: &Job) {
    let total = job.progress.total();
    if total > 0 && bar.length() != Some(total) {
        bar.set_length(total);
    }
    bar.set_position(job.progress.downloaded());
    let label = job
        .file_name
        .clone()
        .or_else(|| job.model_name.clone())
        .unwrap_or_else(|| job.status.to_string());
    bar.set_message(label);
}

fn report(job: &Job) -> i32 {
    match job.status {
        JobStatus::Completed => {
            let path = job
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!("{} {}", "[OK]".green(), path);
            exit_codes::SUCCESS
        }
        JobStatus::Cancelled => {
            println!("{} Download cancelled (job {})", "[!]".yellow(), job.id);
            exit_codes::CANCELLED
        }
        _ => {
            eprintln!(
                "{} {}",
                "[X]".red(),
                job.error.as_deref().unwrap_or("Download failed")
            );
            eprintln!("    Retry with: modelvault retry {}", job.id);
            exit_codes::ERROR
        }
    }
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No download jobs.");
        return;
    }
    for job in jobs {
        let status = match job.status {
            JobStatus::Completed => job.status.as_str().green(),
            JobStatus::Failed => job.status.as_str().red(),
            JobStatus::Cancelled => job.status.as_str().yellow(),
            JobStatus::Downloading => job.status.as_str().cyan(),
            JobStatus::Pending => job.status.as_str().normal(),
        };
        let name = job.file_name.as_deref().unwrap_or(&job.url);
        println!(
            "{}  {:<12} {:>6.1}%  {:>10}  {}",
            job.id.dimmed(),
            status,
            job.progress.percent(),
            format_bytes(job.progress.downloaded()),
            name
        );
        if let Some(error) = &job.error {
            println!("    {}", error.dimmed());
        }
    }
}

fn print_config(config: &Config) {
    println!("{} {}", "Config file:".bold(), config_path().display());
    println!("  models_dir               {}", config.models_dir.display());
    println!("  data_dir                 {}", config.data_dir.display());
    println!("  job store                {}", config.job_store_path().display());
    println!("  max_concurrent_downloads {}", config.max_concurrent_downloads);
    println!("  listen                   {}:{}", config.bind_address, config.port);
    let mut services: Vec<_> = config.tokens.iter().collect();
    services.sort();
    for (service, token) in services {
        println!("  token[{}] {}", service, mask_sensitive(token, 4));
    }
}
