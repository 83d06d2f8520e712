// =============================================================================
// Scheduler — fixed-cadence ingest cycles with bounded fan-out
// =============================================================================
//
// One cycle sweeps every configured lead trader: the trader list is cut into
// batches of at most `concurrency`, batches run sequentially, traders within
// a batch run in parallel. A tick arriving while the previous cycle is still
// executing is dropped (never queued) with a warning. After all traders have
// been processed, the position monitor runs once and the portfolio snapshot
// is taken.
//
// Shutdown: the watch channel flips, the current cycle drains (batch
// boundaries and the tick loop observe it), and the loop exits.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::ingest;
use crate::sim::{monitor, portfolio};
use crate::types::now_ms;
use crate::venue::VenueClient;

/// What one cycle accomplished.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub ok: usize,
    pub failed: usize,
}

pub struct Scheduler {
    app: Arc<AppState>,
    client: Arc<VenueClient>,
}

impl Scheduler {
    pub fn new(app: Arc<AppState>, client: Arc<VenueClient>) -> Self {
        Self { app, client }
    }

    /// Drive cycles until shutdown. Runs one cycle immediately on start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval_ms = self.app.config.read().scraper.interval_ms;
        info!(interval_ms, "scheduler started");
        self.app.scheduler_status.write().running = true;

        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1_000)));
        // A tick that lands during a long cycle is dropped, not queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            let report = self.run_cycle(&shutdown).await;
            let elapsed = started.elapsed();

            {
                let mut status = self.app.scheduler_status.write();
                status.cycle_count += 1;
                status.last_cycle_ms = Some(elapsed.as_millis() as u64);
                status.last_cycle_ok = report.ok;
                status.last_cycle_failed = report.failed;
                if elapsed.as_millis() as u64 > interval_ms {
                    status.skipped_ticks += 1;
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms,
                        "cycle overran the interval, overlapping ticks skipped"
                    );
                }
            }
            self.app.increment_version();

            if *shutdown.borrow() {
                break;
            }
        }

        self.app.scheduler_status.write().running = false;
        info!("scheduler stopped after draining the current cycle");
    }

    /// One sweep over all configured traders.
    async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let (lead_ids, concurrency, platform) = {
            let config = self.app.config.read();
            (
                config.scraper.lead_ids.clone(),
                config.scraper.concurrency.max(1),
                config.platform.clone(),
            )
        };

        self.app.scheduler_status.write().last_cycle_started_at = Some(now_ms());

        let mut report = CycleReport::default();
        if lead_ids.is_empty() {
            warn!("no lead traders configured, idle cycle");
            return report;
        }

        info!(
            traders = lead_ids.len(),
            concurrency, "cycle started"
        );

        for batch in lead_ids.chunks(concurrency) {
            if *shutdown.borrow() {
                warn!("shutdown observed mid-cycle, remaining batches dropped");
                break;
            }

            let results = join_all(batch.iter().map(|lead_id| self.ingest_one(lead_id))).await;
            for (lead_id, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => report.ok += 1,
                    Err(e) => {
                        report.failed += 1;
                        error!(lead_id = %lead_id, error = %e, "trader ingest failed");
                        self.app.push_error(format!("ingest {lead_id}: {e:#}"));
                    }
                }
            }
        }

        // Post-cycle: exit evaluation for open simulations, then the
        // portfolio snapshot. Both read cross-trader state, so they run
        // strictly after every per-trader step.
        {
            let conn = self.app.store.conn();
            if let Err(e) = monitor::run_once(&conn, &platform, now_ms()) {
                error!(error = %e, "position monitor failed");
                self.app.push_error(format!("monitor: {e:#}"));
            }
            if let Err(e) = portfolio::snapshot(&conn, &platform, now_ms()) {
                error!(error = %e, "portfolio snapshot failed");
            }
        }

        info!(ok = report.ok, failed = report.failed, "cycle finished");
        report
    }

    /// Scrape and commit a single trader. Any failure is contained here.
    async fn ingest_one(&self, lead_id: &str) -> anyhow::Result<()> {
        let payload = self.client.fetch_lead(lead_id).await?;
        let platform = self.app.platform();
        ingest::ingest_payload(&self.app.store, &platform, &payload)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::store::Store;

    fn app(lead_ids: Vec<String>, enabled: bool) -> Arc<AppState> {
        let mut config = RuntimeConfig::default();
        config.scraper.lead_ids = lead_ids;
        config.scraper.enabled = enabled;
        Arc::new(AppState::new(
            config,
            Arc::new(Store::open_in_memory().unwrap()),
        ))
    }

    #[test]
    fn batching_respects_concurrency() {
        let leads: Vec<String> = (0..10).map(|i| format!("L{i}")).collect();
        let batches: Vec<&[String]> = leads.chunks(4).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(batches[2].len(), 2);
    }

    #[tokio::test]
    async fn empty_lead_list_yields_an_idle_cycle() {
        let app = app(vec![], true);
        let client = Arc::new(VenueClient::new("http://127.0.0.1:1", 100, 10));
        let scheduler = Scheduler::new(app.clone(), client);

        let (_tx, rx) = watch::channel(false);
        let report = scheduler.run_cycle(&rx).await;
        assert_eq!(report.ok, 0);
        assert_eq!(report.failed, 0);
        assert!(app.scheduler_status.read().last_cycle_started_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_venue_counts_failures_without_aborting() {
        // Nothing listens on this port; every trader fails, the cycle ends.
        let app = app(vec!["A".into(), "B".into()], true);
        let client = Arc::new(VenueClient::new("http://127.0.0.1:1", 100, 10));
        let scheduler = Scheduler::new(app.clone(), client);

        let (_tx, rx) = watch::channel(false);
        let report = scheduler.run_cycle(&rx).await;
        assert_eq!(report.ok, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(app.recent_errors.read().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_before_later_batches() {
        let app = app(vec!["A".into(), "B".into(), "C".into()], true);
        {
            app.config.write().scraper.concurrency = 1;
        }
        let client = Arc::new(VenueClient::new("http://127.0.0.1:1", 100, 10));
        let scheduler = Scheduler::new(app.clone(), client);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = scheduler.run_cycle(&rx).await;
        // Shutdown was observed before the first batch ran.
        assert_eq!(report.ok + report.failed, 0);
    }
}
