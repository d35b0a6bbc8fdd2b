//! Compensation log for multi-step operations
//!
//! Each completed step registers the action that undoes it. On failure the
//! actions run newest first; on success the log is committed and dropped.

use futures::future::BoxFuture;
use tracing::{debug, warn};

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A compensation that failed while rolling back
#[derive(Debug)]
pub struct CompensationFailure {
    pub step: String,
    pub error: anyhow::Error,
}

pub struct Saga {
    name: String,
    steps: Vec<(String, Compensation)>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Register the compensation of a step that just completed
    pub fn register<F>(&mut self, step: impl Into<String>, compensation: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((step.into(), Box::new(compensation)));
    }

    /// Keep every completed step
    pub fn commit(self) {
        debug!("{}: committed {} step(s)", self.name, self.steps.len());
    }

    /// Undo completed steps in reverse order
    ///
    /// Every compensation runs even if an earlier one failed; the failures
    /// are returned to the caller.
    pub async fn compensate(self) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();
        for (step, compensation) in self.steps.into_iter().rev() {
            match compensation().await {
                Ok(()) => debug!("{}: compensated {}", self.name, step),
                Err(error) => {
                    warn!("{}: compensation {} failed: {:#}", self.name, step, error);
                    failures.push(CompensationFailure { step, error });
                }
            }
        }
        failures
    }
}
