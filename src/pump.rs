/*!
 * Message pump: a pool of parallel lanes over one source → destination route
 *
 * `start` opens one receiver/sender pair per lane through a `LanePool`,
 * spawns every lane on the tokio runtime, and returns immediately. `stop`
 * cancels the shared token, waits for every lane to reach `Stopped`, and
 * closes the connections the lanes hand back.
 *
 * Dropping a pump without calling `stop` still cancels its lanes.
 */

use crate::config::PumpConfig;
use crate::endpoint::{DestinationEndpoint, SourceEndpoint};
use crate::error::{PumpError, Result};
use crate::lane::{LaneConnection, LaneExit, LaneSettings, LaneStats, PumpLane};
use crate::metrics::{PumpCounters, PumpMetrics};
use crate::throughput::{ThroughputMeter, ThroughputSnapshot};
use async_trait::async_trait;
use pump_core_resilience::{
    ConnectionFactory, FaultClassifier, LanePool, PoolStats, ResilienceError,
    StaticFaultClassifier,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info};

/// Opens the receiver/sender pair for each lane
struct LaneConnector {
    source: Arc<dyn SourceEndpoint>,
    destination: Arc<dyn DestinationEndpoint>,
    prefetch_count: usize,
}

#[async_trait]
impl ConnectionFactory<LaneConnection> for LaneConnector {
    async fn create(&self, lane: usize) -> std::result::Result<LaneConnection, ResilienceError> {
        let receiver = self
            .source
            .open_receiver(self.prefetch_count)
            .await
            .map_err(|e| {
                ResilienceError::ConnectionCreation(format!(
                    "lane {} receiver on '{}': {}",
                    lane,
                    self.source.path(),
                    e
                ))
            })?;

        let sender = match self.destination.open_sender().await {
            Ok(sender) => sender,
            Err(e) => {
                receiver.close().await;
                return Err(ResilienceError::ConnectionCreation(format!(
                    "lane {} sender on '{}': {}",
                    lane,
                    self.destination.path(),
                    e
                )));
            }
        };

        Ok(LaneConnection { receiver, sender })
    }

    async fn close(&self, conn: LaneConnection) {
        conn.receiver.close().await;
        conn.sender.close().await;
    }
}

/// Final account returned by [`MessagePump::stop`]
#[derive(Debug, Clone, Serialize)]
pub struct PumpReport {
    pub lanes: Vec<LaneStats>,
    pub metrics: PumpMetrics,
    pub throughput: ThroughputSnapshot,
}

impl PumpReport {
    pub fn summary(&self) -> String {
        format!("{}; {}", self.throughput.summary(), self.metrics.summary())
    }
}

/// Relays messages from a source endpoint to a destination endpoint
pub struct MessagePump {
    lanes: Vec<JoinHandle<LaneExit>>,
    pool: LanePool<LaneConnection>,
    counters: Arc<PumpCounters>,
    meter: Arc<ThroughputMeter>,
    config: PumpConfig,
    shutdown: DropGuard,
}

impl MessagePump {
    /// Start `parallelism` lanes with default settings otherwise
    pub async fn start(
        source: Arc<dyn SourceEndpoint>,
        destination: Arc<dyn DestinationEndpoint>,
        parallelism: usize,
        prefetch_count: usize,
    ) -> Result<Self> {
        let config = PumpConfig {
            parallelism,
            prefetch_count,
            ..Default::default()
        };
        Self::start_with_config(source, destination, config).await
    }

    pub async fn start_with_config(
        source: Arc<dyn SourceEndpoint>,
        destination: Arc<dyn DestinationEndpoint>,
        config: PumpConfig,
    ) -> Result<Self> {
        Self::start_with_classifier(
            source,
            destination,
            config,
            Arc::new(StaticFaultClassifier::new()),
        )
        .await
    }

    pub async fn start_with_classifier(
        source: Arc<dyn SourceEndpoint>,
        destination: Arc<dyn DestinationEndpoint>,
        config: PumpConfig,
        classifier: Arc<dyn FaultClassifier>,
    ) -> Result<Self> {
        config.validate()?;

        let route = format!("{} -> {}", source.path(), destination.path());
        let pool = LanePool::new(Arc::new(LaneConnector {
            source,
            destination,
            prefetch_count: config.prefetch_count,
        }));
        let handles = pool.open(config.parallelism).await?;

        let shutdown = CancellationToken::new();
        let counters = Arc::new(PumpCounters::default());
        let meter = Arc::new(ThroughputMeter::new(config.throughput_target));
        let settings = LaneSettings::from_config(&config);

        let lanes = handles
            .into_iter()
            .map(|handle| {
                let lane = PumpLane::new(
                    handle.lane,
                    handle.conn,
                    settings.clone(),
                    Arc::clone(&classifier),
                    shutdown.child_token(),
                )
                .with_instruments(Arc::clone(&counters), Arc::clone(&meter));
                tokio::spawn(lane.run())
            })
            .collect();

        info!(
            route = %route,
            parallelism = config.parallelism,
            prefetch_count = config.prefetch_count,
            "Message pump started"
        );

        Ok(Self {
            lanes,
            pool,
            counters,
            meter,
            config,
            shutdown: shutdown.drop_guard(),
        })
    }

    pub fn parallelism(&self) -> usize {
        self.lanes.len()
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    pub fn metrics(&self) -> PumpMetrics {
        self.counters.snapshot()
    }

    pub fn throughput(&self) -> ThroughputSnapshot {
        self.meter.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Wait until at least `count` messages have been relayed
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_processed(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.meter.processed() < count {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Cancel every lane, wait for all of them, and release their connections
    pub async fn stop(self) -> Result<PumpReport> {
        let MessagePump {
            lanes,
            pool,
            counters,
            meter,
            shutdown,
            ..
        } = self;

        info!("Stopping message pump");
        shutdown.disarm().cancel();

        let mut stats = Vec::with_capacity(lanes.len());
        let mut connections = Vec::with_capacity(lanes.len());
        let mut failure = None;

        for (lane, joined) in futures::future::join_all(lanes).await.into_iter().enumerate() {
            match joined {
                Ok(exit) => {
                    stats.push(exit.stats);
                    connections.push(exit.connection);
                }
                Err(e) => {
                    error!(lane, error = %e, "Lane task failed");
                    failure.get_or_insert(PumpError::LaneJoin {
                        lane,
                        reason: e.to_string(),
                    });
                }
            }
        }

        pool.close(connections).await;

        if let Some(e) = failure {
            return Err(e);
        }

        let report = PumpReport {
            lanes: stats,
            metrics: counters.snapshot(),
            throughput: meter.snapshot(),
        };
        info!(summary = %report.summary(), "Message pump stopped");
        Ok(report)
    }
}
