//! Engine lifecycle management: start, shutdown, run loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{Fuse, FusedFuture, FutureExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::node::health::ProbeRound;
use crate::operation::now_millis;
use crate::queue::SqlQueue;

use super::{EngineState, SyncEngine};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl SyncEngine {
    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Validate the configuration
    /// 2. Connect the SQL queue when `queue_url` is set and no queue was
    ///    supplied with [`with_queue`](Self::with_queue)
    /// 3. Reset operations left `Processing` by an interrupted run
    /// 4. Ready
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        let startup_start = Instant::now();
        let config = self.config.read().clone();
        config.validate()?;

        self.set_state(EngineState::Connecting);
        let phase_start = Instant::now();
        if let Some(url) = config.queue_url.as_deref() {
            if self.queue.backend() == "memory" {
                info!("Connecting to SQL queue...");
                match SqlQueue::connect(url).await {
                    Ok(queue) => {
                        self.queue = Arc::new(queue);
                        crate::metrics::record_startup_phase("queue_connect", phase_start.elapsed());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect SQL queue");
                        self.set_state(EngineState::Created);
                        return Err(e);
                    }
                }
            }
        }
        info!(backend = self.queue.backend(), "Queue connected");

        self.set_state(EngineState::Recovering);
        let phase_start = Instant::now();
        let recovered = self.queue.recover_interrupted().await?;
        crate::metrics::record_recovered(recovered);
        crate::metrics::record_startup_phase("recover", phase_start.elapsed());
        if recovered > 0 {
            warn!(recovered, "Reset interrupted operations to pending");
        }

        self.set_state(EngineState::Ready);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            "Sync engine ready"
        );
        Ok(())
    }

    /// Run the main event loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Drives the processor tick, node health probes and queue cleanup on
    /// their configured intervals, and applies configuration updates from
    /// the watch channel.
    ///
    /// The tick is polled alongside the other arms rather than awaited
    /// inline, so a tick stuck on a slow node never holds up health probes,
    /// cleanup or config updates. At most one tick is in flight; interval
    /// ticks that fire meanwhile are dropped.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        self.set_state(EngineState::Running);
        info!("Sync engine running");

        let config = self.config.read().clone();
        let mut tick_interval = ticker(config.tick_interval());
        let mut health_interval = ticker(config.health_check_interval());
        let mut cleanup_interval = ticker(config.cleanup_interval());

        let mut state_rx = self.state_rx.clone();
        let mut config_rx = self.config_rx.lock().await;

        let in_flight = Fuse::terminated();
        tokio::pin!(in_flight);

        loop {
            tokio::select! {
                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    if let Err(e) = new_config.validate() {
                        warn!(error = %e, "Rejected config update");
                        continue;
                    }
                    let old = self.config.read().clone();
                    if new_config.tick_interval_ms != old.tick_interval_ms {
                        tick_interval = ticker(new_config.tick_interval());
                    }
                    if new_config.health_check_interval_secs != old.health_check_interval_secs {
                        health_interval = ticker(new_config.health_check_interval());
                    }
                    if new_config.cleanup_interval_secs != old.cleanup_interval_secs {
                        cleanup_interval = ticker(new_config.cleanup_interval());
                    }
                    info!(
                        tick_interval_ms = new_config.tick_interval_ms,
                        batch_size = new_config.batch_size,
                        conflict_strategy = new_config.conflict_strategy.as_str(),
                        "Config updated"
                    );
                    *self.config.write() = new_config;
                }

                _ = tick_interval.tick(), if in_flight.is_terminated() => {
                    in_flight.set(self.tick().fuse());
                }

                report = &mut in_flight => {
                    if let Some(e) = &report.error {
                        debug!(error = %e, "Tick ended with an engine error");
                    }
                }

                _ = health_interval.tick() => {
                    self.probe_nodes().await;
                }

                _ = cleanup_interval.tick() => {
                    let retention_days = self.config.read().retention_days;
                    if let Err(e) = self.cleanup_queue(retention_days).await {
                        warn!(error = %e, "Queue cleanup failed");
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == EngineState::ShuttingDown {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_terminated() {
            let grace = self.config.read().processing_timeout() + Duration::from_secs(1);
            if tokio::time::timeout(grace, &mut in_flight).await.is_err() {
                warn!("In-flight tick abandoned at shutdown");
            }
        }
        info!("Sync engine run loop stopped");
    }

    /// Probe every node once and update reachability.
    pub async fn probe_nodes(&self) -> ProbeRound {
        let (probe_timeout, offline_threshold) = {
            let config = self.config.read();
            (config.health_probe_timeout(), config.offline_threshold())
        };
        let round = self
            .health
            .probe_all(probe_timeout, offline_threshold, now_millis())
            .await;
        for node_id in &round.went_offline {
            debug!(node_id = %node_id, "Dispatch paused for offline node");
        }
        round
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops the run loop and waits (bounded by the processing timeout) for
    /// an in-flight tick to finish. Operations cut off mid-dispatch stay
    /// `Processing` and are reset on the next `start`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = tokio::time::Instant::now();
        info!("Initiating sync engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let deadline = self.config.read().processing_timeout() + Duration::from_secs(1);
        while self.tick_running.load(Ordering::Acquire) {
            if shutdown_start.elapsed() >= deadline {
                warn!("Shutdown deadline reached with a tick still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Sync engine shutdown complete");
    }
}
