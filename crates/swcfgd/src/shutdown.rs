//! Concurrent unit bookkeeping and shutdown sequencing.
//!
//! Every worker the reconciler starts is tracked in [`Units`]. Shutdown sets
//! the cancellation signal, waits for units inside a primary window while
//! logging each outcome, then waits once more for a harder bound. Units
//! still running after that make the shutdown stall, which the binary
//! answers with a hard exit.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use swcfg_common::CancellationSignal;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{FatalError, FatalResult};
use crate::worker::WorkerExit;

/// Identity of a concurrent unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Worker bound to a device id.
    Device(String),
    /// Action worker by action name.
    Action(&'static str),
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Device(id) => write!(f, "device {}", id),
            Unit::Action(name) => write!(f, "action {}", name),
        }
    }
}

/// Terminal status of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// A device worker returned normally.
    Exited(WorkerExit),
    /// An action worker returned normally.
    Stopped,
    /// The unit returned an error.
    Failed(String),
    /// The unit panicked or was aborted.
    Crashed(String),
}

impl UnitOutcome {
    /// Returns true for outcomes that count as a failed run.
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed(_) | UnitOutcome::Crashed(_))
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Exited(exit) => f.write_str(exit.as_str()),
            UnitOutcome::Stopped => f.write_str("stopped"),
            UnitOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            UnitOutcome::Crashed(reason) => write!(f, "crashed: {}", reason),
        }
    }
}

/// Set of running units.
#[derive(Default)]
pub struct Units {
    set: JoinSet<(Unit, UnitOutcome)>,
}

impl Units {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `fut` as `unit`.
    ///
    /// The future runs in its own task so that a panic is reported as
    /// [`UnitOutcome::Crashed`] under the unit's name.
    pub fn spawn<F>(&mut self, unit: Unit, fut: F)
    where
        F: Future<Output = UnitOutcome> + Send + 'static,
    {
        let inner = tokio::spawn(fut);
        self.set.spawn(async move {
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(e) => UnitOutcome::Crashed(e.to_string()),
            };
            (unit, outcome)
        });
    }

    /// Returns a unit that has already finished, without waiting.
    pub fn try_next(&mut self) -> Option<(Unit, UnitOutcome)> {
        loop {
            match self.set.try_join_next()? {
                Ok(finished) => return Some(finished),
                Err(e) => tracing::error!(error = %e, "Unit supervisor task failed"),
            }
        }
    }

    async fn next(&mut self) -> Option<(Unit, UnitOutcome)> {
        loop {
            match self.set.join_next().await? {
                Ok(finished) => return Some(finished),
                Err(e) => tracing::error!(error = %e, "Unit supervisor task failed"),
            }
        }
    }

    /// Number of units still tracked.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Returns true if no unit is tracked.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Cancels all units and waits for them within `grace`, then `hard`.
    ///
    /// Returns every outcome observed, or [`FatalError::ShutdownStalled`]
    /// if units remain after both bounds.
    pub async fn drain(
        mut self,
        cancel: &CancellationSignal,
        grace: Duration,
        hard: Duration,
    ) -> FatalResult<Vec<(Unit, UnitOutcome)>> {
        cancel.cancel();
        tracing::info!(units = self.len(), grace = ?grace, "Waiting for units to finish");

        let mut outcomes = Vec::new();
        for (phase, bound) in [("grace", grace), ("hard", hard)] {
            let deadline = Instant::now() + bound;
            while !self.is_empty() {
                match tokio::time::timeout_at(deadline, self.next()).await {
                    Ok(Some((unit, outcome))) => {
                        log_outcome(&unit, &outcome);
                        outcomes.push((unit, outcome));
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(phase, remaining = self.len(), "Shutdown bound expired");
                        break;
                    }
                }
            }
        }

        if self.is_empty() {
            tracing::info!("All units finished");
            Ok(outcomes)
        } else {
            Err(FatalError::ShutdownStalled {
                remaining: self.len(),
            })
        }
    }
}

/// Logs one unit outcome at a level matching its severity.
pub fn log_outcome(unit: &Unit, outcome: &UnitOutcome) {
    if outcome.is_failure() {
        tracing::error!(unit = %unit, outcome = %outcome, "Unit finished");
    } else {
        tracing::info!(unit = %unit, outcome = %outcome, "Unit finished");
    }
}

/// Terminates the process after `bound` unless it exits on its own first.
///
/// Runs on a plain OS thread so that a wedged async runtime cannot hold
/// it up.
pub fn arm_watchdog(bound: Duration) {
    let spawned = std::thread::Builder::new()
        .name("shutdown-watchdog".to_string())
        .spawn(move || {
            std::thread::sleep(bound);
            eprintln!("Shutdown did not complete within {:?}, terminating", bound);
            std::process::exit(1);
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start shutdown watchdog");
    }
}
