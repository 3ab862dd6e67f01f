//! Linked-task primitive: spawn a supervised operation and observe its exit.

use std::{fmt, future::Future, panic::AssertUnwindSafe};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Identity of a linked process within the daemon's supervision set.
pub(crate) type ProcessId = Ulid;

/// Why a supervised operation terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Ran to completion.
    Normal,
    /// Intentionally interrupted by its supervisor.
    Shutdown,
    /// Abnormal termination.
    Failed(String),
}

impl ExitReason {
    /// Whether this is an abnormal termination.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExitReason::Failed(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Shutdown => f.write_str("shutdown"),
            ExitReason::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Handle to a spawned operation whose exit reason is reported back to its
/// owner's event channel.
pub(crate) struct LinkedProcess {
    id: ProcessId,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl LinkedProcess {
    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    /// Ask the process to stop; the exit event still arrives once it has.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and synchronously wait for termination. Used on teardown,
    /// when the exit event will no longer be consumed.
    pub(crate) async fn stop_and_wait(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn `run` as a linked process; its exit reason is posted to `tx` via
/// `wrap`.
///
/// A panic inside `run` becomes `ExitReason::Failed` rather than a silently
/// lost exit notification.
pub(crate) fn spawn_linked<T, W, F, Fut>(
    tx: flume::Sender<T>,
    wrap: W,
    run: F,
) -> LinkedProcess
where
    T: Send + 'static,
    W: FnOnce(ProcessId, ExitReason) -> T + Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ExitReason> + Send + 'static,
{
    let id = Ulid::new();
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    let join = tokio::spawn(async move {
        let reason = match AssertUnwindSafe(run(child)).catch_unwind().await {
            Ok(reason) => reason,
            Err(_) => ExitReason::Failed("panicked".to_string()),
        };
        let _ = tx.send_async(wrap(id, reason)).await;
    });
    LinkedProcess { id, cancel, join }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_reason_is_reported_with_the_process_id() {
        let (tx, rx) = flume::bounded::<(ProcessId, ExitReason)>(1);
        let process = spawn_linked(
            tx,
            |id, reason| (id, reason),
            |_cancel| async { ExitReason::Normal },
        );
        let (id, reason) = rx.recv_async().await.expect("exit event");
        assert_eq!(id, process.id());
        assert_eq!(reason, ExitReason::Normal);
    }

    #[tokio::test]
    async fn cancellation_is_observable_by_the_operation() {
        let (tx, rx) = flume::bounded::<ExitReason>(1);
        let process = spawn_linked(
            tx,
            |_id, reason| reason,
            |cancel| async move {
                cancel.cancelled().await;
                ExitReason::Shutdown
            },
        );
        process.cancel();
        assert_eq!(
            rx.recv_async().await.expect("exit event"),
            ExitReason::Shutdown
        );
    }

    #[tokio::test]
    async fn panic_becomes_a_failure_exit() {
        let (tx, rx) = flume::bounded::<ExitReason>(1);
        let _process = spawn_linked(
            tx,
            |_id, reason| reason,
            |_cancel| async { panic!("boom") },
        );
        assert!(rx.recv_async().await.expect("exit event").is_failure());
    }
}
