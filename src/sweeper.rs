//! Sweeper Worker
//!
//! Background task driving the reconciler.
//!
//! Flow:
//! 1. Run a reconciliation pass on startup and then every `sweep_interval`
//! 2. Run an extra pass whenever the handle asks for one
//! 3. Stop on shutdown or when every handle is dropped
//!
//! Errors are logged and never stop the loop.

use crate::reconciler::{Reconciler, SweepReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum Command {
    Trigger(oneshot::Sender<SweepReport>),
    Shutdown,
}

/// Control handle of a running sweeper
pub struct SweeperHandle {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Run a pass now and wait for its report
    ///
    /// Returns `None` if the sweeper has stopped.
    pub async fn trigger(&self) -> Option<SweepReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Trigger(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Stop the loop and wait for the current pass to finish
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }
}

pub struct Sweeper {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl Sweeper {
    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Self {
        Self { reconciler, period }
    }

    async fn sweep(&self) -> SweepReport {
        let report = self.reconciler.run_once(Utc::now()).await;
        for e in &report.errors {
            error!("Sweep error: {}", e);
        }
        if report.expired + report.expiry_failures + report.lost_instances > 0
            || report.orphan_workloads_removed + report.orphan_exposures_removed > 0
        {
            info!(
                "Sweep: {} expired, {} cleanup failures, {} orphan workloads, {} orphan exposures, {} lost",
                report.expired,
                report.expiry_failures,
                report.orphan_workloads_removed,
                report.orphan_exposures_removed,
                report.lost_instances
            );
        } else {
            debug!("Sweep: nothing to reclaim ({} promoted)", report.promoted);
        }
        report
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        info!("Sweeper started (interval={}s)", self.period.as_secs());

        self.sweep().await;

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                command = commands.recv() => match command {
                    Some(Command::Trigger(reply)) => {
                        let report = self.sweep().await;
                        if reply.send(report).is_err() {
                            warn!("Sweep requester went away before the report");
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        info!("Sweeper stopped");
    }
}

/// Start the sweeper on the current runtime
pub fn spawn_sweeper(reconciler: Arc<Reconciler>, period: Duration) -> SweeperHandle {
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(Sweeper::new(reconciler, period).run(rx));
    SweeperHandle { tx, task }
}
