//! Per-link task scheduling
//!
//! Every enabled link gets two independent tasks: the sampler loop, which
//! runs speed cycles on the dense or sparse cadence, and the latency loop,
//! which pings on a fixed interval. Tasks only observe shutdown between
//! cycles, so a cycle that has started always runs to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::SqmEngine;
use crate::error::{Result, SqmError};
use crate::models::{SampleSource, WanLinkId};
use crate::registry::lock;

struct LinkTasks {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

pub struct PipelineScheduler {
    engine: Arc<SqmEngine>,
    links: Mutex<HashMap<WanLinkId, LinkTasks>>,
}

impl PipelineScheduler {
    pub fn new(engine: Arc<SqmEngine>) -> Self {
        Self {
            engine,
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<SqmEngine> {
        &self.engine
    }

    /// Spawn the loops for a link. Returns false when the link is disabled
    /// or already running.
    pub fn start_link(&self, id: &WanLinkId) -> Result<bool> {
        let link = self.engine.registry().get(id)?.link();
        if !link.enabled {
            debug!(link_id = %id, "Link disabled, not scheduling");
            return Ok(false);
        }

        let mut links = lock(&self.links);
        if links.contains_key(id) {
            return Ok(false);
        }

        let (shutdown, _) = broadcast::channel(1);
        let handles = vec![
            tokio::spawn(sampler_loop(self.engine.clone(), id.clone(), shutdown.subscribe())),
            tokio::spawn(latency_loop(self.engine.clone(), id.clone(), shutdown.subscribe())),
        ];
        links.insert(id.clone(), LinkTasks { shutdown, handles });

        info!(link_id = %id, interface = %link.interface, "Link scheduled");
        Ok(true)
    }

    /// Stop a link's loops and wait for any running cycle to finish
    pub async fn stop_link(&self, id: &WanLinkId) -> bool {
        let Some(tasks) = lock(&self.links).remove(id) else {
            return false;
        };
        let _ = tasks.shutdown.send(());
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(link_id = %id, error = %e, "Link task ended abnormally");
            }
        }
        info!(link_id = %id, "Link unscheduled");
        true
    }

    /// Bring the running set in line with the registry after a link was
    /// added, updated or removed
    pub async fn reconcile(&self, id: &WanLinkId) -> Result<()> {
        match self.engine.registry().get(id) {
            Ok(runtime) if runtime.link().enabled => {
                self.start_link(id)?;
            }
            Ok(_) | Err(SqmError::UnknownLink(_)) => {
                self.stop_link(id).await;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Schedule every enabled registered link
    pub fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for id in self.engine.registry().ids() {
            if self.start_link(&id)? {
                started += 1;
            }
        }
        Ok(started)
    }

    pub async fn shutdown(&self) {
        for id in self.running() {
            self.stop_link(&id).await;
        }
    }

    pub fn running(&self) -> Vec<WanLinkId> {
        let mut ids: Vec<_> = lock(&self.links).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, id: &WanLinkId) -> bool {
        lock(&self.links).contains_key(id)
    }
}

async fn sampler_loop(engine: Arc<SqmEngine>, id: WanLinkId, mut shutdown: broadcast::Receiver<()>) {
    let clock = engine.clock();
    loop {
        let started = clock.now();
        match engine.run_speed_cycle(&id, SampleSource::Scheduled).await {
            Ok(report) => debug!(
                link_id = %id,
                admission = ?report.admission,
                deployed = report.deployment.is_some(),
                "Speed cycle complete"
            ),
            Err(SqmError::UnknownLink(_)) => break,
            Err(e) => warn!(link_id = %id, error = %e, "Speed cycle failed"),
        }

        let next = match engine.next_sample_at(&id, started) {
            Ok(next) => next,
            Err(_) => break,
        };
        let wait = (next - clock.now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = sleep(wait) => {}
            _ = shutdown.recv() => break,
        }
    }
    debug!(link_id = %id, "Sampler loop stopped");
}

async fn latency_loop(engine: Arc<SqmEngine>, id: WanLinkId, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(engine.config().latency.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }
        match engine.run_ping_cycle(&id).await {
            Ok(report) if report.verdict.congested => debug!(
                link_id = %id,
                latency_ms = report.verdict.latency_ms,
                streak = report.verdict.streak,
                "Congested ping"
            ),
            Ok(_) => {}
            Err(SqmError::UnknownLink(_)) => break,
            Err(e) => debug!(link_id = %id, error = %e, "Ping cycle failed"),
        }
    }
    debug!(link_id = %id, "Latency loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::testing::{docsis_link, t0, MockExecutor, MockPing, MockSpeedTest};

    struct Fixture {
        scheduler: PipelineScheduler,
        speedtest: Arc<MockSpeedTest>,
        pinger: Arc<MockPing>,
        executor: Arc<MockExecutor>,
    }

    fn fixture() -> Fixture {
        let speedtest = Arc::new(MockSpeedTest::constant(300.0, 20.0));
        let pinger = Arc::new(MockPing::constant(15.0));
        let executor = Arc::new(MockExecutor::new());
        let engine = SqmEngine::builder()
            .clock(Arc::new(TokioClock::new(t0())))
            .speed_test(speedtest.clone())
            .pinger(pinger.clone())
            .executor(executor.clone())
            .build()
            .unwrap();
        Fixture {
            scheduler: PipelineScheduler::new(Arc::new(engine)),
            speedtest,
            pinger,
            executor,
        }
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dense_cadence_and_pings() {
        let f = fixture();
        f.scheduler.engine().add_link(docsis_link("wan1")).unwrap();
        assert!(f.scheduler.start_link(&"wan1".into()).unwrap());

        sleep(hours(5) + Duration::from_secs(1)).await;

        // t = 0h, 2h, 4h
        assert_eq!(f.speedtest.calls("wan1"), 3);
        assert!((60..=61).contains(&f.pinger.calls()));
        assert_eq!(f.executor.upload_count("gw-wan1"), 1);

        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_link_halts_both_loops() {
        let f = fixture();
        let id = WanLinkId::from("wan1");
        f.scheduler.engine().add_link(docsis_link("wan1")).unwrap();
        f.scheduler.start_link(&id).unwrap();
        sleep(Duration::from_secs(1)).await;

        assert!(f.scheduler.stop_link(&id).await);
        assert!(!f.scheduler.is_running(&id));
        let speed_calls = f.speedtest.calls("wan1");
        let ping_calls = f.pinger.calls();

        sleep(hours(6)).await;
        assert_eq!(f.speedtest.calls("wan1"), speed_calls);
        assert_eq!(f.pinger.calls(), ping_calls);
        assert!(!f.scheduler.stop_link(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_links_not_started() {
        let f = fixture();
        let mut disabled = docsis_link("wan2");
        disabled.enabled = false;
        f.scheduler.engine().add_link(docsis_link("wan1")).unwrap();
        f.scheduler.engine().add_link(disabled).unwrap();

        assert_eq!(f.scheduler.start_all().unwrap(), 1);
        assert_eq!(f.scheduler.running(), vec![WanLinkId::from("wan1")]);
        assert!(!f.scheduler.start_link(&"wan1".into()).unwrap());

        f.scheduler.shutdown().await;
        assert!(f.scheduler.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_follows_registry() {
        let f = fixture();
        let id = WanLinkId::from("wan1");
        f.scheduler.engine().add_link(docsis_link("wan1")).unwrap();

        f.scheduler.reconcile(&id).await.unwrap();
        assert!(f.scheduler.is_running(&id));

        let mut disabled = docsis_link("wan1");
        disabled.enabled = false;
        f.scheduler.engine().update_link(disabled).await.unwrap();
        f.scheduler.reconcile(&id).await.unwrap();
        assert!(!f.scheduler.is_running(&id));

        f.scheduler.engine().remove_link(&id).unwrap();
        tokio_test::assert_ok!(f.scheduler.reconcile(&id).await);
        assert!(matches!(
            f.scheduler.start_link(&id),
            Err(SqmError::UnknownLink(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_gateway_does_not_block_other_link() {
        let speedtest = Arc::new(MockSpeedTest::constant(300.0, 20.0));
        let executor = Arc::new(MockExecutor::new());
        executor.set_unreachable("gw-wan2", true);
        let engine = SqmEngine::builder()
            .clock(Arc::new(TokioClock::new(t0())))
            .speed_test(speedtest.clone())
            .pinger(Arc::new(MockPing::constant(15.0)))
            .executor(executor.clone())
            .build()
            .unwrap();
        let scheduler = PipelineScheduler::new(Arc::new(engine));
        scheduler.engine().add_link(docsis_link("wan1")).unwrap();
        scheduler.engine().add_link(docsis_link("wan2")).unwrap();
        scheduler.start_all().unwrap();

        sleep(hours(3)).await;

        assert_eq!(speedtest.calls("wan1"), 2);
        assert_eq!(speedtest.calls("wan2"), 2);
        assert_eq!(executor.upload_count("gw-wan1"), 1);
        assert_eq!(executor.upload_count("gw-wan2"), 0);
        let status = scheduler.engine().status();
        assert!(status["eth-wan1"].current_rate.is_some());
        assert!(status["eth-wan2"].current_rate.is_none());

        scheduler.shutdown().await;
    }
}
