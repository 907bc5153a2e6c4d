//! Collector orchestration: wires the agent connection, decoder, device
//! cache, dispatcher, aggregator, purge scheduler, and health server
//! together and owns their lifecycles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::device::DeviceCache;
use crate::dispatch::Dispatcher;
use crate::export::HealthMetrics;
use crate::ingest::conn::{ConnectionManager, ConnectionState};
use crate::ingest::parse::{classify_line_now, LineAssembler, Outcome};
use crate::ingest::record::RecordKind;
use crate::ingest::stats::IngestStats;
use crate::purge::PurgeScheduler;
use crate::store::{
    DeviceStore, FlowStore, NotificationStore, PingStatStore, Severity, TrafficStatStore,
    UsageStore,
};

/// Bound on in-flight undecoded chunks between the socket reader and the
/// decoder task. When the decoder falls behind, backpressure propagates
/// to the socket read instead of growing an unbounded queue.
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Backing stores for every collector component, injected at startup.
pub struct Stores<D, F, U, N, P, T>
where
    D: DeviceStore,
    F: FlowStore,
    U: UsageStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    pub devices: Arc<D>,
    pub flows: Arc<F>,
    pub usage: Arc<U>,
    pub notifications: Arc<N>,
    pub ping_stats: Arc<P>,
    pub traffic_stats: Arc<T>,
}

/// Collector orchestrates all components: connection, decoder, device
/// cache, dispatcher, aggregator, purge, health.
pub struct Collector<D, F, U, N, P, T>
where
    D: DeviceStore,
    F: FlowStore,
    U: UsageStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    cfg: Config,
    health: Arc<HealthMetrics>,
    cache: DeviceCache<D>,
    dispatcher: Dispatcher<F, N>,
    aggregator: Aggregator<F, U>,
    purge: PurgeScheduler<F, N, P, T>,
    ingest_stats: Arc<IngestStats>,
    conn: Option<ConnectionManager>,
    decode_task: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<D, F, U, N, P, T> Collector<D, F, U, N, P, T>
where
    D: DeviceStore,
    F: FlowStore,
    U: UsageStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    /// Creates a collector over the given stores, initializing health
    /// metrics.
    pub fn new(cfg: Config, stores: Stores<D, F, U, N, P, T>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let cache = DeviceCache::new(
            Arc::clone(&stores.devices),
            cfg.device_cache.refresh_interval,
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&stores.flows),
            Arc::clone(&stores.notifications),
        );

        let aggregator = Aggregator::new(
            Arc::clone(&stores.flows),
            Arc::clone(&stores.usage),
            cfg.aggregate.interval,
            cfg.aggregate.join_window,
        )
        .with_health(Arc::clone(&health));

        let purge = PurgeScheduler::new(
            stores.flows,
            stores.notifications,
            stores.ping_stats,
            stores.traffic_stats,
            cfg.retention_days,
        )
        .with_health(Arc::clone(&health));

        Ok(Self {
            cfg,
            health,
            cache,
            dispatcher,
            aggregator,
            purge,
            ingest_stats: Arc::new(IngestStats::new()),
            conn: None,
            decode_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin collecting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 2. Device cache with its background refresh loop; the first
        // tick fires immediately and seeds the map.
        self.cache.start(self.cancel.child_token());

        // 3. Connection manager delivering raw chunks to the decoder.
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let conn = ConnectionManager::new(&self.cfg.agent, &self.cfg.reconnect, chunk_tx);

        // Exhaustion of the reconnect budget is an operator-visible event.
        {
            let dispatcher = self.dispatcher.clone();
            let health = Arc::clone(&self.health);
            let addr = format!("{}:{}", self.cfg.agent.host, self.cfg.agent.port);
            conn.on_exhausted(Box::new(move |failures| {
                health.reconnect_exhaustions.inc();

                let dispatcher = dispatcher.clone();
                let message = format!(
                    "lost contact with traffic agent at {addr} after {failures} reconnect attempts"
                );
                tokio::spawn(async move {
                    dispatcher
                        .save_notification(&message, Severity::Critical, "agent_connection")
                        .await;
                });
            }));
        }

        // 4. Decoder task: chunk -> lines -> classified records -> stores.
        self.decode_task = Some(self.spawn_decoder(chunk_rx));

        // 5. Mirror connection state into the gauge.
        self.spawn_state_monitor(conn.state());

        // 6. Periodic workers.
        self.aggregator.start(self.cancel.child_token());
        self.purge.start(self.cancel.child_token());
        self.spawn_ingest_stats_reporter();

        // 7. Start dialing the agent.
        conn.start(self.cancel.child_token());
        self.conn = Some(conn);

        info!("collector fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // Dropping the manager releases its chunk sender; the connection
        // task's clone goes away when it observes the cancellation.
        if let Some(conn) = self.conn.take() {
            conn.stop();
        }

        // The decoder drains naturally once every chunk sender is gone.
        if let Some(task) = self.decode_task.take() {
            let _ = task.await;
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Changes the retention horizon live; applies on the next purge run.
    pub fn set_retention_days(&self, days: u32) {
        self.purge.set_retention_days(days);
    }

    /// Suspends the agent connection without tearing down the pipeline.
    pub fn pause_connection(&self) {
        if let Some(conn) = &self.conn {
            conn.stop();
        }
    }

    /// Resumes a paused connection with a fresh attempt budget.
    pub fn resume_connection(&self) {
        if let Some(conn) = &self.conn {
            conn.restart();
        }
    }

    fn spawn_decoder(&self, mut chunk_rx: mpsc::Receiver<Vec<u8>>) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        let dispatcher = self.dispatcher.clone();
        let health = Arc::clone(&self.health);
        let stats = Arc::clone(&self.ingest_stats);

        tokio::spawn(async move {
            let mut assembler = LineAssembler::new();

            // Exits when every chunk sender has been dropped.
            while let Some(chunk) = chunk_rx.recv().await {
                health.chunks_received.inc();

                for line in assembler.push(&chunk) {
                    let outcome = classify_line_now(&line);
                    let kind = outcome.kind();
                    stats.record(kind);
                    health
                        .records_by_kind
                        .with_label_values(&[kind.as_str()])
                        .inc();

                    match outcome {
                        Outcome::Flow(mut rec) => {
                            if let Some(device) = cache.get(&rec.mac).await {
                                rec.hostname = device.hostname;
                            }

                            if dispatcher.save_flow(&rec).await.is_err() {
                                health
                                    .store_write_errors
                                    .with_label_values(&["flows"])
                                    .inc();
                            }
                        }
                        Outcome::PurgeStat(rec) => {
                            if dispatcher.save_purge_stat(&rec).await.is_err() {
                                health
                                    .store_write_errors
                                    .with_label_values(&["purge_stats"])
                                    .inc();
                            }
                        }
                        Outcome::Ignored => {}
                        Outcome::Invalid(e) => {
                            debug!(error = %e, "discarding malformed line");
                        }
                    }
                }
            }

            debug!(pending = assembler.pending(), "decoder task exited");
        })
    }

    /// Mirrors connection state transitions into Prometheus.
    fn spawn_state_monitor(&self, mut state_rx: tokio::sync::watch::Receiver<ConnectionState>) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                health.connection_state.set(state_gauge_value(state));

                if state == ConnectionState::ReconnectWait {
                    health.reconnect_attempts.inc();
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Spawn background ingest stats reporter.
    fn spawn_ingest_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.ingest_stats);
        let cache = self.cache.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        health.device_cache_entries.set(cache.len() as f64);

                        let snapshot = stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(records = total, "ingest stats (60s)");

                        for (kind, count) in &snapshot {
                            debug!(kind = kind.as_str(), count, "  by kind (60s)");
                        }

                        let invalid = snapshot
                            .iter()
                            .find(|(k, _)| *k == RecordKind::Invalid)
                            .map(|(_, n)| *n)
                            .unwrap_or(0);
                        if invalid > 0 {
                            warn!(invalid, "malformed lines in the last 60s");
                        }
                    }
                }
            }
        });
    }
}

fn state_gauge_value(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::ReconnectWait => 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_gauge_values_are_distinct() {
        let values = [
            state_gauge_value(ConnectionState::Disconnected),
            state_gauge_value(ConnectionState::Connecting),
            state_gauge_value(ConnectionState::Connected),
            state_gauge_value(ConnectionState::ReconnectWait),
        ];
        for (i, a) in values.iter().enumerate() {
            for b in values.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
