use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError, Sender};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

use super::reconciliation::ExpiryReconciler;

/// key: expiry-sweep-trigger -> opportunistic sweep requests
#[derive(Clone)]
pub struct SweepTrigger {
    sender: Sender<()>,
}

impl SweepTrigger {
    /// Never blocks. Requests made while one is already pending collapse
    /// into that one. Returns `false` only if the sweep task is gone.
    pub fn request_sweep(&self) -> bool {
        match self.sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => {
                warn!("expiry sweep task is not running; opportunistic sweep dropped");
                false
            }
        }
    }
}

/// key: expiry-sweep-scheduler -> periodic + on-demand sweeps
///
/// The first tick fires immediately, so a sweep runs at startup.
pub fn spawn(reconciler: Arc<ExpiryReconciler>, interval: Duration) -> SweepTrigger {
    let (tx, mut rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let reason = tokio::select! {
                _ = ticker.tick() => "interval",
                Some(()) = rx.recv() => "upgrade",
            };
            run_sweep(&reconciler, reason).await;
        }
    });

    SweepTrigger { sender: tx }
}

async fn run_sweep(reconciler: &ExpiryReconciler, reason: &'static str) {
    match reconciler.sweep().await {
        Ok(report) => info!(
            reason,
            downgraded = report.downgraded,
            skipped = report.skipped,
            failed = report.failed,
            "expiry sweep finished"
        ),
        Err(err) => warn!(?err, reason, "expiry sweep could not list expired accounts"),
    }
}
