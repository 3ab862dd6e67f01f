//! Public operations surface of the compaction daemon.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    daemon::{
        forced::Continuation,
        inhibit::{InhibitRef, LivenessWatch},
        ApiRequest, DaemonEvent,
    },
    metrics::{Metrics, MetricsSnapshot},
    process::ExitReason,
    services::IndexGroupId,
    settings::CompactionSettings,
};

/// Synchronous protocol rejection; never retried by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Nack {
    /// An inhibition (or a pending uninhibit) already exists.
    #[error("view compaction already inhibited")]
    AlreadyInhibited,
    /// The bucket/reference pair does not match the live inhibition.
    #[error("unknown inhibition reference")]
    BadReference,
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The daemon is gone (not started, or shut down).
    #[error("compaction daemon is not running")]
    Closed,
    /// The daemon rejected the request.
    #[error(transparent)]
    Nack(#[from] Nack),
}

/// Clonable, channel-backed handle to a running
/// [`CompactionDaemon`](crate::daemon::CompactionDaemon).
#[derive(Clone)]
pub struct DaemonHandle {
    tx: flume::Sender<DaemonEvent>,
    metrics: Arc<Metrics>,
}

impl DaemonHandle {
    pub(crate) fn new(tx: flume::Sender<DaemonEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    async fn send(&self, request: ApiRequest) -> Result<(), HandleError> {
        self.tx
            .send_async(DaemonEvent::Api(request))
            .await
            .map_err(|_| HandleError::Closed)
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> ApiRequest,
    ) -> Result<R, HandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| HandleError::Closed)
    }

    /// Compact a bucket's data files, master db, and every index group now.
    /// Acknowledged once registered; the outcome is reported via logs.
    pub async fn force_compact_bucket(
        &self,
        bucket: impl Into<String>,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::ForceCompactBucket {
            bucket,
            purge: false,
            ack,
        })
        .await
    }

    /// Like [`force_compact_bucket`](Self::force_compact_bucket), but drops
    /// tombstones eagerly during the rewrite.
    pub async fn force_purge_compact_bucket(
        &self,
        bucket: impl Into<String>,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::ForceCompactBucket {
            bucket,
            purge: true,
            ack,
        })
        .await
    }

    /// Compact a bucket's data files (shards plus master db) now.
    pub async fn force_compact_db_files(
        &self,
        bucket: impl Into<String>,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::ForceCompactDbFiles { bucket, ack })
            .await
    }

    /// Compact one index group of a bucket now.
    pub async fn force_compact_view(
        &self,
        bucket: impl Into<String>,
        group: IndexGroupId,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::ForceCompactView { bucket, group, ack })
            .await
    }

    /// Compact a bucket's data files, dropping `obsolete_keys` eagerly.
    ///
    /// Concurrent requests for the same bucket share one run; every caller's
    /// continuation is invoked with the completion reason. A repeated
    /// `continuation_id` replaces that caller's previous continuation.
    pub async fn partial_compact_db_files(
        &self,
        bucket: impl Into<String>,
        obsolete_keys: Vec<Vec<u8>>,
        continuation_id: impl Into<String>,
        continuation: impl FnOnce(ExitReason) + Send + Sync + 'static,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        let continuation_id = continuation_id.into();
        let continuation: Continuation = Box::new(continuation);
        self.call(|ack| ApiRequest::PartialCompactDbFiles {
            bucket,
            obsolete_keys,
            continuation_id,
            continuation,
            ack,
        })
        .await
    }

    /// Cancel a forced whole-bucket compaction (plain or purging).
    pub async fn cancel_forced_bucket_compaction(
        &self,
        bucket: impl Into<String>,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::CancelForcedBucket { bucket, ack })
            .await
    }

    /// Cancel a forced data-file compaction (full or partial).
    pub async fn cancel_forced_db_compaction(
        &self,
        bucket: impl Into<String>,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::CancelForcedDb { bucket, ack })
            .await
    }

    /// Cancel a forced single-index-group compaction.
    pub async fn cancel_forced_view_compaction(
        &self,
        bucket: impl Into<String>,
        group: IndexGroupId,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|ack| ApiRequest::CancelForcedView { bucket, group, ack })
            .await
    }

    /// Pause scheduled index compaction for `bucket` on behalf of `owner`.
    ///
    /// Returns the reference required to uninhibit. Fails with
    /// [`Nack::AlreadyInhibited`] while another inhibition or a pending
    /// uninhibit exists.
    pub async fn inhibit_view_compaction(
        &self,
        bucket: impl Into<String>,
        owner: LivenessWatch,
    ) -> Result<InhibitRef, HandleError> {
        let bucket = bucket.into();
        self.call(|reply| ApiRequest::Inhibit {
            bucket,
            owner,
            reply,
        })
        .await?
        .map_err(HandleError::Nack)
    }

    /// Resume index compaction for `bucket`.
    ///
    /// Blocks until the priority compaction run triggered by the resume has
    /// terminated (or was skipped). Fails with [`Nack::BadReference`] when
    /// the bucket/reference pair does not match the live inhibition.
    pub async fn uninhibit_view_compaction(
        &self,
        bucket: impl Into<String>,
        reference: InhibitRef,
    ) -> Result<(), HandleError> {
        let bucket = bucket.into();
        self.call(|reply| ApiRequest::Uninhibit {
            bucket,
            reference,
            reply,
        })
        .await?
        .map_err(HandleError::Nack)
    }

    /// Current global autocompaction settings, read from the config service.
    pub async fn settings(&self) -> Result<CompactionSettings, HandleError> {
        self.call(|reply| ApiRequest::GetSettings { reply }).await
    }

    /// Replace the global autocompaction settings via the config service.
    pub async fn update_settings(
        &self,
        settings: CompactionSettings,
    ) -> Result<(), HandleError> {
        self.call(|reply| ApiRequest::UpdateSettings { settings, reply })
            .await
    }

    /// Point-in-time copy of the daemon counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Orderly teardown: cancels all running work, waits for it to
    /// terminate, and stops the daemon.
    pub async fn shutdown(&self) -> Result<(), HandleError> {
        self.call(|ack| ApiRequest::Shutdown { ack }).await
    }
}
