//! View-compaction inhibition: the pause/resume handshake with a
//! rebalance-style coordinator.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::daemon::handle::Nack;

/// Reference returned by a successful inhibit call; required to uninhibit.
pub type InhibitRef = Ulid;

/// Owner-side keepalive for an inhibition. Dropping every clone signals the
/// owner's death to the daemon, which then silently cancels the inhibition.
#[derive(Clone)]
pub struct OwnerGuard {
    _keepalive: flume::Sender<()>,
}

/// Daemon-side watch detecting the owner's death.
pub struct LivenessWatch {
    rx: flume::Receiver<()>,
}

impl LivenessWatch {
    /// Resolves once every [`OwnerGuard`] clone has been dropped.
    pub async fn lost(self) {
        while self.rx.recv_async().await.is_ok() {}
    }
}

/// Build a linked keepalive/watch pair for one inhibition.
pub fn liveness_pair() -> (OwnerGuard, LivenessWatch) {
    let (tx, rx) = flume::bounded(1);
    (OwnerGuard { _keepalive: tx }, LivenessWatch { rx })
}

/// Where the pause/resume handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InhibitPhase {
    /// Index compaction for the bucket is paused.
    Inhibited,
    /// Uninhibit accepted; waiting for the track to free up.
    UninhibitRequested,
    /// The priority index run is live.
    UninhibitRunning,
}

/// The single live inhibition, if any. The bucket and the owner watch are
/// set and cleared together.
pub(crate) struct InhibitionState {
    pub(crate) bucket: String,
    pub(crate) reference: InhibitRef,
    pub(crate) phase: InhibitPhase,
    /// Cancels the owner-death watch task.
    pub(crate) watch_cancel: CancellationToken,
    /// A data-file compaction was stopped to let the priority run through.
    pub(crate) stopped_data_compactor: bool,
    /// Deferred reply for the pending uninhibit caller.
    pub(crate) reply: Option<oneshot::Sender<Result<(), Nack>>>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn watch_resolves_when_the_guard_drops() {
        let (guard, watch) = liveness_pair();
        let watcher = tokio::spawn(watch.lost());
        // The watch must stay pending while the guard is alive.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watcher.is_finished());
        drop(guard);
        timeout(Duration::from_millis(200), watcher)
            .await
            .expect("watch resolves after guard drop")
            .expect("join");
    }

    #[tokio::test]
    async fn watch_waits_for_every_clone() {
        let (guard, watch) = liveness_pair();
        let second = guard.clone();
        drop(guard);
        let watcher = tokio::spawn(watch.lost());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watcher.is_finished(), "one clone still alive");
        drop(second);
        timeout(Duration::from_millis(200), watcher)
            .await
            .expect("watch resolves after last clone")
            .expect("join");
    }
}
