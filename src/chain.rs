//! Ordered supervision of compaction sub-operations.
//!
//! A chain runs its items strictly one at a time, converting each child's
//! failure into either a fatal abort or a logged skip according to the
//! item's importance flag.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    headroom::HeadroomError, logging::maint_log, process::ExitReason, services::EngineError,
    throttle::ThrottleError,
};

/// Failure of a single compaction sub-operation.
#[derive(Debug, Error)]
pub enum JobError {
    /// Headroom guard refused the rewrite.
    #[error(transparent)]
    Headroom(#[from] HeadroomError),
    /// The storage engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The admission gate went away underneath the requester.
    #[error(transparent)]
    Throttle(#[from] ThrottleError),
    /// A worker task died without producing a result.
    #[error("worker terminated abnormally: {0}")]
    Worker(String),
}

/// Factory producing the sub-operation future once the chain reaches it.
pub(crate) type JobFactory =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), JobError>> + Send>;

/// One entry in a supervision chain.
pub(crate) struct ChainItem {
    pub(crate) kind: &'static str,
    pub(crate) name: String,
    /// A failure aborts the whole chain instead of being logged and skipped.
    pub(crate) important: bool,
    pub(crate) factory: JobFactory,
}

impl ChainItem {
    pub(crate) fn new(
        kind: &'static str,
        name: impl Into<String>,
        important: bool,
        factory: JobFactory,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            important,
            factory,
        }
    }
}

/// Run `items` in order, one live sub-operation at a time.
///
/// Cancellation is forwarded to the running sub-operation, which is then
/// awaited before `Shutdown` is reported upward; no child is left running
/// behind the chain's own exit.
pub(crate) async fn run_chain(
    label: &str,
    items: Vec<ChainItem>,
    cancel: CancellationToken,
) -> ExitReason {
    for item in items {
        if cancel.is_cancelled() {
            return ExitReason::Shutdown;
        }
        let child_cancel = cancel.child_token();
        let mut join = tokio::spawn((item.factory)(child_cancel.clone()));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                child_cancel.cancel();
                let _ = (&mut join).await;
                maint_log!(
                    log::Level::Debug,
                    "chain_cancelled",
                    "chain={label} kind={} name={}",
                    item.kind,
                    item.name,
                );
                return ExitReason::Shutdown;
            }
            joined = &mut join => {
                let result = match joined {
                    Ok(result) => result,
                    Err(err) => Err(JobError::Worker(err.to_string())),
                };
                match result {
                    Ok(()) => {}
                    Err(err) if item.important => {
                        maint_log!(
                            log::Level::Warn,
                            "chain_aborted",
                            "chain={label} kind={} name={} error={err}",
                            item.kind,
                            item.name,
                        );
                        return ExitReason::Failed(format!(
                            "{} {}: {err}",
                            item.kind, item.name
                        ));
                    }
                    Err(err) => {
                        maint_log!(
                            log::Level::Warn,
                            "chain_step_failed",
                            "chain={label} kind={} name={} error={err} continuing",
                            item.kind,
                            item.name,
                        );
                    }
                }
            }
        }
    }
    ExitReason::Normal
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use super::*;

    fn recording_item(
        kind: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        result: Result<(), JobError>,
    ) -> ChainItem {
        ChainItem::new(
            kind,
            kind,
            false,
            Box::new(move |_cancel| {
                Box::pin(async move {
                    log.lock().unwrap().push(kind);
                    result
                })
            }),
        )
    }

    #[tokio::test]
    async fn items_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = vec![
            recording_item("first", Arc::clone(&log), Ok(())),
            recording_item("second", Arc::clone(&log), Ok(())),
            recording_item("third", Arc::clone(&log), Ok(())),
        ];
        let reason = run_chain("test", items, CancellationToken::new()).await;
        assert_eq!(reason, ExitReason::Normal);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn important_failure_aborts_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = recording_item(
            "failing",
            Arc::clone(&log),
            Err(JobError::Worker("db gone".to_string())),
        );
        failing.important = true;
        let items = vec![
            recording_item("first", Arc::clone(&log), Ok(())),
            failing,
            recording_item("unreached", Arc::clone(&log), Ok(())),
        ];
        let reason = run_chain("test", items, CancellationToken::new()).await;
        assert!(reason.is_failure());
        assert_eq!(*log.lock().unwrap(), vec!["first", "failing"]);
    }

    #[tokio::test]
    async fn unimportant_failure_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = vec![
            recording_item(
                "failing",
                Arc::clone(&log),
                Err(JobError::Worker("one index broke".to_string())),
            ),
            recording_item("still-runs", Arc::clone(&log), Ok(())),
        ];
        let reason = run_chain("test", items, CancellationToken::new()).await;
        assert_eq!(reason, ExitReason::Normal);
        assert_eq!(*log.lock().unwrap(), vec!["failing", "still-runs"]);
    }

    #[tokio::test]
    async fn cancellation_waits_for_the_running_child() {
        let child_done = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&child_done);
        let items = vec![ChainItem::new(
            "slow",
            "slow",
            true,
            Box::new(move |cancel| {
                Box::pin(async move {
                    cancel.cancelled().await;
                    // Simulate cleanup the chain must not outrun.
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )];
        let cancel = CancellationToken::new();
        let chain = tokio::spawn(run_chain("test", items, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let reason = chain.await.expect("chain join");
        assert_eq!(reason, ExitReason::Shutdown);
        assert!(
            child_done.load(Ordering::SeqCst),
            "chain reported shutdown before its child terminated"
        );
    }
}
