//! Blue/green rollout CLI
//!
//! Runs a rollout from a config file and records operator decisions on
//! pending promotions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use bluegreen_pipeline::report::write_report;
use bluegreen_pipeline::{
    render_markdown, ApprovalSource, AutoApprove, CommandProvisioner, Decision,
    FileApprovalSource, FileTrafficSwitch, HealthValidator, HttpProbe, PromotionGate,
    Provisioner, Result, RolloutConfig, RolloutPipeline, StaticProvisioner, Validate,
    WaveOrchestrator,
};

const DEFAULT_STATE_DIR: &str = ".bluegreen-pipeline";

#[derive(Parser)]
#[command(name = "bluegreen-pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Blue/green cluster rollouts with health-gated waves", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every wave and the promotion stage
    Run {
        /// Rollout config file (TOML or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Directory for approvals, the active pointer and the report
        #[arg(long, env = "ROLLOUT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,

        /// Approve the promotion without waiting for an operator
        #[arg(long)]
        auto_approve: bool,

        /// Assume environments already exist and only validate them
        #[arg(long)]
        skip_provision: bool,
    },

    /// Check a config file without running anything
    Check {
        /// Rollout config file (TOML or YAML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Probe a URL the way environments are validated
    Probe {
        /// URL to probe
        url: String,

        /// Maximum attempts
        #[arg(long, default_value_t = 12)]
        attempts: u32,

        /// Seconds between failed attempts
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Approve a pending promotion request
    Approve {
        /// Promotion request ID
        id: String,

        #[arg(long, env = "ROLLOUT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },

    /// Reject a pending promotion request
    Reject {
        /// Promotion request ID
        id: String,

        #[arg(long, env = "ROLLOUT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            config,
            state_dir,
            auto_approve,
            skip_provision,
        } => run(&config, &state_dir, auto_approve, skip_provision).await,
        Commands::Check { config } => check(&config),
        Commands::Probe {
            url,
            attempts,
            interval_secs,
            timeout_secs,
        } => probe(&url, attempts, interval_secs, timeout_secs).await,
        Commands::Approve { id, state_dir } => decide(&state_dir, &id, Decision::Approve),
        Commands::Reject { id, state_dir } => decide(&state_dir, &id, Decision::Reject),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn approvals_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("approvals")
}

async fn run(
    config_path: &Path,
    state_dir: &Path,
    auto_approve: bool,
    skip_provision: bool,
) -> Result<bool> {
    let config = RolloutConfig::load(config_path)?;
    for warning in config.validate().warnings {
        tracing::warn!("{}", warning);
    }
    let plan = config.resolve()?;

    let provisioner: Arc<dyn Provisioner> = match (&plan.provision_command, skip_provision) {
        (Some(command), false) => Arc::new(CommandProvisioner::new(
            command,
            &plan.cluster_prefix,
            plan.endpoints.clone(),
        )),
        _ => Arc::new(StaticProvisioner::new(plan.endpoints.clone())),
    };
    let probe = Arc::new(HttpProbe::new(plan.validation.request_timeout())?);
    let validator = Arc::new(HealthValidator::new(
        probe,
        plan.validation.max_attempts,
        plan.validation.interval(),
    )?);
    tracing::info!(
        environments = plan.environments().count(),
        budget = ?validator.budget(),
        "validation budget per environment"
    );
    let switch = Arc::new(FileTrafficSwitch::new(
        state_dir,
        &plan.cluster_prefix,
        plan.endpoints.clone(),
    ));
    let approvals: Arc<dyn ApprovalSource> = if auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(FileApprovalSource::new(approvals_dir(state_dir)))
    };

    let pipeline = RolloutPipeline::new(
        plan,
        WaveOrchestrator::new(provisioner, validator),
        PromotionGate::new(switch),
        approvals,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling rollout");
            on_signal.cancel();
        }
    });

    let report = pipeline.run(&cancel).await;
    let path = write_report(state_dir, &report)?;

    println!("{}", render_markdown(&report));
    println!("Report: {}", path.display());

    Ok(report.status.is_success())
}

fn check(config_path: &Path) -> Result<bool> {
    let config = RolloutConfig::load(config_path)?;
    let result = config.validate();

    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
    if !result.passed() {
        return Ok(false);
    }

    let plan = config.resolve()?;
    println!(
        "{}: {} wave(s), {} environment(s), promotion target: {}",
        plan.pipeline_name,
        plan.waves.len(),
        plan.environments().count(),
        plan.promotion_target
            .as_ref()
            .map(|t| t.name())
            .unwrap_or("none")
    );
    println!(
        "validation: up to {} attempt(s) every {}s, budget {}s per environment",
        plan.validation.max_attempts,
        plan.validation.interval_secs,
        plan.validation.budget().as_secs()
    );
    Ok(true)
}

async fn probe(url: &str, attempts: u32, interval_secs: u64, timeout_secs: u64) -> Result<bool> {
    let probe = Arc::new(HttpProbe::new(Duration::from_secs(timeout_secs))?);
    let validator = HealthValidator::new(probe, attempts, Duration::from_secs(interval_secs))?;
    tracing::info!(url = %url, budget = ?validator.budget(), "probing");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = validator.validate(url, &cancel).await;
    if result.success {
        println!("{} healthy after {} attempt(s)", url, result.attempts);
    } else {
        println!(
            "{} unhealthy after {} attempt(s): {}",
            url,
            result.attempts,
            result.last_error.as_deref().unwrap_or("cancelled")
        );
    }
    Ok(result.success)
}

fn decide(state_dir: &Path, id: &str, decision: Decision) -> Result<bool> {
    FileApprovalSource::new(approvals_dir(state_dir)).record_decision(id, decision)?;
    println!("Recorded {} for promotion {}", decision.as_str(), id);
    Ok(true)
}
