//! Delay continuation poller.
//!
//! Delay nodes only persist `resume_at`, and so does a callback whose send
//! failed. This ticker finds due states and turns each into an
//! [`Orchestrator::resume`] call. Any other scheduler that
//! calls `resume` (a queue, a cron job hitting the HTTP surface) works too;
//! `resume` is idempotent, so overlapping pollers are harmless.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::automation::clock::Clock;
use crate::automation::orchestrator::{AutomationOutcome, Orchestrator};
use crate::store::Database;

/// Resume every state whose delay has elapsed. Returns how many were
/// advanced.
pub async fn resume_due_delays(
    orchestrator: &Orchestrator,
    db: &dyn Database,
    clock: &dyn Clock,
) -> usize {
    let due = match db.list_due_delays(clock.now()).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to list due delays");
            return 0;
        }
    };
    if due.is_empty() {
        return 0;
    }

    debug!(count = due.len(), "Resuming delayed conversation states");
    let mut advanced = 0;
    for state in due {
        match orchestrator.resume(state.id).await {
            AutomationOutcome::FlowAdvanced { .. } => advanced += 1,
            other => debug!(state_id = %state.id, outcome = ?other, "Delay resume made no progress"),
        }
    }
    advanced
}

/// Spawn the delay ticker background task.
pub fn spawn_delay_ticker(
    orchestrator: Arc<Orchestrator>,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Starting delay ticker");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let advanced = resume_due_delays(&orchestrator, db.as_ref(), clock.as_ref()).await;
            if advanced > 0 {
                info!(advanced, "Delayed flows resumed");
            }
        }
    })
}
