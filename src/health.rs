//! Periodic heartbeats on `agent.health`
//!
//! [`HealthReporter`] runs independently of task processing: it asks a
//! [`HealthSource`] for a report on every tick and publishes it. A failed
//! publish is logged and the loop keeps going.

use crate::protocol::{HealthReport, HEALTH_SUBJECT};
use crate::transport::{BrokerConnection, Transport};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Produces the heartbeat payload. Must not block.
pub trait HealthSource: Send + Sync + 'static {
    fn health_report(&self) -> HealthReport;
}

/// Handle to a running heartbeat loop
pub struct HealthReporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthReporter {
    /// Start the loop. The first report goes out immediately, then one per
    /// `interval` (at least 1ms); ticks missed while a publish was slow are
    /// skipped.
    pub fn spawn<T: Transport>(
        source: Arc<dyn HealthSource>,
        broker: Arc<BrokerConnection<T>>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = source.health_report();
                        if broker.publish_message(HEALTH_SUBJECT, &report).await {
                            broker.metrics().heartbeat_sent();
                            debug!(
                                status = %report.status,
                                active_tasks = report.active_tasks,
                                "Published health report"
                            );
                        } else {
                            warn!(agent_id = %report.agent_id, "Health report not published");
                        }
                    }
                }
            }
            debug!("Health reporter stopped");
        });

        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit. A publish already in flight
    /// finishes first.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Health reporter task ended abnormally: {}", e);
            }
        }
    }
}

/// Memory and CPU sampler for the agent's own process
///
/// CPU usage is computed between consecutive refreshes, so the first sample
/// after construction may read zero. It is a percentage of one core and can
/// exceed 100 on multi-core hosts.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Process metrics unavailable: {}", e);
                None
            }
        };
        let mut sampler = Self {
            system: System::new(),
            pid,
        };
        sampler.refresh();
        sampler
    }

    /// Returns `(memory_usage_mb, cpu_usage_percent)` for this process, or
    /// zeros when the process cannot be inspected
    pub fn sample(&mut self) -> (f64, f64) {
        self.refresh();
        let Some(process) = self.pid.and_then(|pid| self.system.process(pid)) else {
            return (0.0, 0.0);
        };

        let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
        let cpu = f64::from(process.cpu_usage());
        (round2(memory_mb), round2(cpu))
    }

    fn refresh(&mut self) {
        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
    }
}

fn round2(value: f64) -> f64 {
    if value.is_finite() {
        (value * 100.0).round() / 100.0
    } else {
        0.0
    }
}
