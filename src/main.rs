//! SettleBot - Prediction Market Settlement Engine
//!
//! Tracks market events from an upstream provider, aggregates time-ordered
//! participant forecasts, and converts them into bounded rewards once ground
//! truth is known.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settlebot_backend::{
    commitment::CommitmentStore,
    ledger::SubmissionLedger,
    models::Config,
    providers::PolymarketSource,
    reconcile::{ReconcileSettings, ReconciliationLoop},
    registry::EventRegistry,
    scoring::QuadraticScorer,
    settlement::SettlementCoordinator,
    snapshot::{self, EngineState},
};

#[derive(Parser, Debug)]
#[command(name = "settlebot", about = "Prediction market settlement engine")]
struct Args {
    /// Override the checkpoint file location.
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Run a single bulk poll pass, checkpoint, and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = Config::from_env()?;
    let state_path = args
        .state_path
        .unwrap_or_else(|| PathBuf::from(&config.state_path));

    info!("🚀 SettleBot Settlement Engine Starting");

    let registry = Arc::new(EventRegistry::new());
    let ledger = Arc::new(SubmissionLedger::new(config.submission_cutoff_secs));
    if let Some(restored) = snapshot::load_state(&state_path) {
        registry.restore(restored.events);
        ledger.restore(restored.submissions);
    }
    info!(
        "📊 Registry initialized with {} events from {}",
        registry.len(),
        state_path.display()
    );

    let commitments = Arc::new(CommitmentStore::new(config.commit_max_age_rounds));

    let source = Arc::new(PolymarketSource::new(config.polymarket_api_base.as_str())?);
    let reconcile = Arc::new(ReconciliationLoop::new(
        source,
        registry.clone(),
        ReconcileSettings {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
        },
    ));

    if args.once {
        let stats = reconcile.poll_once().await?;
        info!(
            pages = stats.pages,
            seen = stats.seen,
            fresh = stats.fresh,
            "single poll pass complete"
        );
        snapshot::save_state(&state_path, &engine_state(&registry, &ledger))?;
        return Ok(());
    }

    // Settlement plumbing: the registry hook enqueues snapshots, the
    // coordinator task scores settled ones and emits reward vectors.
    let events_rx = SettlementCoordinator::subscribe(&registry);
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(SettlementCoordinator::new(
        registry.clone(),
        ledger.clone(),
        commitments.clone(),
        Box::new(QuadraticScorer {
            absent: config.absent_policy,
        }),
        config.participant_ids.clone(),
        report_tx,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = {
        let reconcile = reconcile.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reconcile.run_bulk_poll(shutdown).await })
    };
    let refresher = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reconcile.run_pending_refresh(shutdown).await })
    };
    let settler = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { coordinator.run(events_rx, shutdown).await })
    };

    // Reward sink: the payout mechanism lives outside this process, so the
    // engine's output boundary is a logged report per settled event.
    // Inbound participant answers reach `ledger.insert` the same way, via
    // whatever transport the deployment wires up.
    let reporter = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            info!(
                event_key = %report.event_key,
                ground_truth = ?report.ground_truth,
                rewards = ?report.rewards,
                "💰 reward vector emitted"
            );
        }
    });

    let checkpointer = {
        let registry = registry.clone();
        let ledger = ledger.clone();
        let path = state_path.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.checkpoint_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick fires immediately; nothing to save yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) =
                            snapshot::save_state(&path, &engine_state(&registry, &ledger))
                        {
                            warn!("checkpoint failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping tasks");
    let _ = shutdown_tx.send(true);

    for task in [poller, refresher, settler, checkpointer] {
        let _ = task.await;
    }
    let _ = reporter.await;

    snapshot::save_state(&state_path, &engine_state(&registry, &ledger))?;
    info!("👋 SettleBot stopped");
    Ok(())
}

fn engine_state(registry: &EventRegistry, ledger: &SubmissionLedger) -> EngineState {
    EngineState {
        events: registry.snapshot(),
        submissions: ledger.snapshot(),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "settlebot_backend=debug,settlebot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
