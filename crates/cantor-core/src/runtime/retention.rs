use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::runtime::orchestrator::Orchestrator;

/// Periodic expiry of finished tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Terminal tasks older than this are removed, artifact included.
    pub max_age: Duration,
    /// How often the sweeper runs.
    pub interval: Duration,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration, interval: Duration) -> Self {
        Self { max_age, interval }
    }
}

/// Run [`Orchestrator::sweep_expired`] every `policy.interval` until
/// `shutdown` flips to `true`.
pub(crate) fn spawn_sweeper(
    orchestrator: Orchestrator,
    policy: RetentionPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = policy.interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(
            max_age_secs = policy.max_age.as_secs(),
            interval_secs = period.as_secs(),
            "retention sweeper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = orchestrator.sweep_expired(policy.max_age).await;
                    if removed > 0 {
                        info!(removed, "expired tasks removed");
                    } else {
                        debug!("retention sweep found nothing to remove");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("retention sweeper stopped");
    });
}
