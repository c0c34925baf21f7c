//! sqmd - adaptive SQM daemon
//!
//! Learns per-link bandwidth baselines, blends them with live speed tests
//! and keeps the gateway's CAKE shapers at the resulting rates.

use anyhow::{Context, Result};
use sqm_core::{
    actuator::{RemoteExecutor, ShapingTemplate, SshExecutor},
    health::{components, HealthRegistry},
    measurement::{RemotePing, RemoteSpeedTest},
    observability::SqmMetrics,
    persistence::StateStore,
    scheduler::PipelineScheduler,
    SqmEngine,
};
use sqmd::{api, config::SqmdConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SQMD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sqmd");

    let config = SqmdConfig::load()?;
    info!(node_name = %config.node_name, links = config.links.len(), "Daemon configured");

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = SqmMetrics::new();

    let engine = Arc::new(build_engine(&config)?);

    let store = StateStore::new(&config.state_path);
    match store.load() {
        Ok(Some(state)) => {
            if let Err(e) = engine.restore(state) {
                warn!(error = %e, "Discarding persisted state");
                health_registry
                    .set_degraded(components::STATE_STORE, e.to_string())
                    .await;
            }
        }
        Ok(None) => info!(path = %store.path().display(), "No persisted state, starting fresh"),
        Err(e) => {
            warn!(error = %e, "Failed to load persisted state");
            health_registry
                .set_degraded(components::STATE_STORE, format!("{:#}", e))
                .await;
        }
    }

    sync_links(&engine, &config).await?;

    let scheduler = Arc::new(PipelineScheduler::new(engine.clone()));
    let started = scheduler.start_all()?;
    engine.logger().log_startup(SQMD_VERSION, started);

    let app_state = Arc::new(api::AppState::new(
        engine.clone(),
        health_registry.clone(),
        metrics.clone(),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, _) = broadcast::channel(1);
    let flush_handle = tokio::spawn(flush_loop(
        engine.clone(),
        StateStore::new(&config.state_path),
        health_registry.clone(),
        config.flush_interval(),
        shutdown_tx.subscribe(),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            engine.logger().log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "API server stopped"),
                Err(e) => warn!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
            engine.logger().log_shutdown("API server stopped");
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    scheduler.shutdown().await;
    if let Err(e) = flush_handle.await {
        warn!(error = %e, "Flush task failed");
    }

    store
        .save(&engine.snapshot())
        .context("failed to save state on shutdown")?;
    info!("Shut down");

    Ok(())
}

fn build_engine(config: &SqmdConfig) -> Result<SqmEngine> {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.gateway.ssh()));

    let template = match &config.gateway.template_path {
        Some(path) => ShapingTemplate::from_file(path)?,
        None => ShapingTemplate::default(),
    };

    let speedtest = RemoteSpeedTest::new(
        executor.clone(),
        config.gateway.speedtest_command.clone(),
        config.speedtest_timeout(),
    );
    let pinger = RemotePing::new(
        executor.clone(),
        config.gateway.ping_target.clone(),
        config.gateway.ping_count,
        config.latency.probe_timeout(),
    )?;

    let engine = SqmEngine::builder()
        .config(config.engine_config())
        .profiles(config.profile_table()?)
        .template(template)
        .speed_test(Arc::new(speedtest))
        .pinger(Arc::new(pinger))
        .executor(executor)
        .build()?;
    Ok(engine)
}

/// Make the registry match the configured links. Restored links missing
/// from the configuration are removed along with their state.
async fn sync_links(engine: &SqmEngine, config: &SqmdConfig) -> Result<()> {
    let configured: HashSet<_> = config.links.iter().map(|l| l.id.clone()).collect();
    for id in engine.registry().ids() {
        if !configured.contains(&id) {
            info!(link_id = %id, "Link no longer configured, removing");
            engine.remove_link(&id)?;
        }
    }

    for link in &config.links {
        if engine.registry().contains(&link.id) {
            if let Some(result) = engine.update_link(link.clone()).await? {
                info!(link_id = %link.id, result = ?result, "Reapplied shaping within new limits");
            }
        } else {
            engine.add_link(link.clone())?;
        }
    }
    Ok(())
}

async fn flush_loop(
    engine: Arc<SqmEngine>,
    store: StateStore,
    health_registry: HealthRegistry,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.maintenance();
                health_registry.refresh_pipeline(&engine).await;
                match store.save(&engine.snapshot()) {
                    Ok(()) => health_registry.set_healthy(components::STATE_STORE).await,
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "Failed to save state");
                        health_registry
                            .set_degraded(components::STATE_STORE, e.to_string())
                            .await;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
