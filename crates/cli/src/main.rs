use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use restitch_config::Config;
use restitch_core::run_repair;

#[derive(Parser)]
#[command(
    name = "restitch",
    about = "Automatically repairs a repository whose test suite is failing",
    version
)]
struct Cli {
    /// Path to the version-controlled repository to repair
    repo_path: PathBuf,

    /// Maximum number of agent iterations (model turns)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Wall-clock budget for the whole run, in seconds
    #[arg(long)]
    global_timeout: Option<u64>,

    /// Timeout for a single test run, in seconds
    #[arg(long)]
    test_timeout: Option<u64>,

    /// Model identifier (e.g. gpt-4.1, claude-sonnet-4-20250514)
    #[arg(short, long)]
    model: Option<String>,

    /// Fallback model used when the primary is unavailable or mismatched
    #[arg(long)]
    model_fallback: Option<String>,

    /// Cap on changed lines per patch
    #[arg(long)]
    max_patch_lines: Option<usize>,

    /// Cap on files touched per patch
    #[arg(long)]
    max_files: Option<usize>,

    /// Run tests directly in a child process, skipping the sandbox
    #[arg(long)]
    no_sandbox: bool,

    /// Fail instead of falling back when the sandbox cannot start
    #[arg(long, conflicts_with = "no_sandbox")]
    strict_sandbox: bool,

    /// Force temperature 0.0 for reproducible runs
    #[arg(long)]
    deterministic: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "restitch=warn",
        1 => "restitch=info",
        _ => "restitch=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: &Cli, repo_path: &std::path::Path) -> Result<Config> {
    let mut config = Config::load(repo_path).context("loading configuration")?;
    if let Some(v) = cli.max_iterations {
        config.limits.max_iterations = v;
    }
    if let Some(v) = cli.global_timeout {
        config.limits.global_timeout_seconds = v;
    }
    if let Some(v) = cli.test_timeout {
        config.limits.test_timeout_seconds = v;
    }
    if let Some(model) = &cli.model {
        config.model.model_id = model.clone();
    }
    if let Some(fallback) = &cli.model_fallback {
        config.model.model_fallback_id = Some(fallback.clone());
    }
    if let Some(v) = cli.max_patch_lines {
        config.safety.max_patch_lines = v;
    }
    if let Some(v) = cli.max_files {
        config.safety.max_files = v;
    }
    if cli.no_sandbox {
        config.sandbox.use_sandbox = false;
    }
    if cli.strict_sandbox {
        config.sandbox.use_sandbox = true;
        config.sandbox.allow_local_fallback = false;
    }
    if cli.deterministic {
        config.model.deterministic_fix = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let repo_path = match cli.repo_path.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("restitch: cannot resolve {}: {e}", cli.repo_path.display());
            std::process::exit(3);
        }
    };

    let config = match build_config(&cli, &repo_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("restitch: {e:#}");
            std::process::exit(3);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, rolling back");
                cancel.cancel();
            }
        });
    }

    let outcome = run_repair(&repo_path, &config, cancel).await;
    println!("restitch: {outcome}");
    std::process::exit(outcome.exit_code());
}
