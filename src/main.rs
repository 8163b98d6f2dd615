//! AI Guardian - Main Entry Point

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use ai_guardian_core::api::OperatorReport;
use ai_guardian_core::constants;
use ai_guardian_core::logic::authorization::{verify_provenance, FileDropChannel, OperatorRegistry};
use ai_guardian_core::logic::config::GuardianConfig;
use ai_guardian_core::logic::engine::Guardian;
use ai_guardian_core::logic::ledger::{AuditEvent, FileStorage, Ledger};
use ai_guardian_core::logic::observer::SysinfoHost;

/// AI Guardian - host enforcement agent for autonomous AI processes
#[derive(Parser, Debug)]
#[command(name = "ai-guardian")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the agent until Ctrl-C
    Run,

    /// Check the ledger chain and approval provenance
    Verify,

    /// Put a quarantined image back
    Restore {
        /// Action id from the containment record
        action_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = GuardianConfig::load_default().context("loading configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Verify => verify(&config),
        Command::Restore { action_id } => restore(&config, action_id),
    }
}

fn open_ledger(config: &GuardianConfig) -> Result<Arc<Ledger>> {
    let path = config.ledger_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let ledger = Ledger::open(Arc::new(FileStorage::new(&path)), &config.ledger)
        .with_context(|| format!("opening ledger {}", path.display()))?;
    log::info!("Ledger {} opened with {} entries", path.display(), ledger.len());
    Ok(Arc::new(ledger))
}

fn load_registry(config: &GuardianConfig) -> Result<OperatorRegistry> {
    let path = config.operator_keys_path();
    if !path.exists() {
        log::warn!("No operator key file at {}; every authorization will be denied", path.display());
        return Ok(OperatorRegistry::new());
    }
    let registry = OperatorRegistry::load(&path).with_context(|| format!("loading operator keys {}", path.display()))?;
    if registry.is_empty() {
        log::warn!("No operator keys in {}; every authorization will be denied", path.display());
    }
    Ok(registry)
}

fn build_guardian(config: &GuardianConfig, ledger: Arc<Ledger>) -> Result<Guardian> {
    let registry = load_registry(config)?;
    let channel = FileDropChannel::new(config.channel_dir()).context("opening authorization inbox")?;
    let guardian = Guardian::from_config(
        config,
        Arc::new(SysinfoHost::new()),
        Arc::new(registry),
        Arc::new(channel),
        ledger,
    )?;
    Ok(guardian)
}

async fn run(config: GuardianConfig) -> Result<()> {
    log::info!("Starting {} v{}", constants::APP_NAME, constants::APP_VERSION);
    let ledger = open_ledger(&config)?;
    let guardian = build_guardian(&config, ledger)?;
    log::info!(
        "Authorization inbox: {} | Quarantine: {}",
        config.channel_dir().display(),
        config.quarantine_dir().display()
    );

    let report_dir = config.report_dir();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutdown requested");
    };

    guardian
        .run(shutdown, |guardian, _summary| {
            if let Err(e) = OperatorReport::collect(guardian).write(&report_dir) {
                log::warn!("Failed to write operator report: {}", e);
            }
        })
        .await;
    Ok(())
}

fn verify(config: &GuardianConfig) -> Result<()> {
    let ledger = open_ledger(config)?;
    ledger.verify().context("ledger chain")?;
    let registry = load_registry(config)?;
    let report = verify_provenance(&ledger.read(..), &registry, &config.containment).context("approval provenance")?;
    println!(
        "Ledger OK: {} entries, head {}, {} approval(s) and {} action(s) verified",
        ledger.len(),
        ledger.head_hash(),
        report.approvals_verified,
        report.actions_verified
    );
    Ok(())
}

fn restore(config: &GuardianConfig, action_id: Uuid) -> Result<()> {
    let ledger = open_ledger(config)?;
    let record = ledger
        .events_of_kind("containment_executed")
        .into_iter()
        .find_map(|(_, event)| match event {
            AuditEvent::ContainmentExecuted { record } if record.action_id == action_id => Some(record),
            _ => None,
        })
        .with_context(|| format!("no containment action {} in the ledger", action_id))?;

    let guardian = build_guardian(config, ledger)?;
    let restored = guardian.services().executor.restore(&record)?;
    println!("Restored {} for subject {}", restored.display(), record.subject);
    Ok(())
}
