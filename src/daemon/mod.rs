//! The compaction daemon: root state machine of the maintenance engine.
//!
//! The daemon serializes every state transition through a single inbound
//! event stream. Compaction work runs in a separate supervised tree of
//! tasks; the daemon itself only reacts to ticks, API calls, and exit
//! notifications, and never blocks on a compaction.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{
    chain,
    logging::maint_log,
    metrics::Metrics,
    process::{spawn_linked, ExitReason, LinkedProcess, ProcessId},
    scheduler::SchedulerState,
    services::{
        BucketDirectory, CompactOptions, ConfigService, DiskUsage, IndexGroupId, StorageEngine,
    },
    settings::{BucketConfig, CompactionSettings},
    throttle::Throttle,
    window::{Clock, WallClock},
};

mod forced;
pub mod handle;
mod inhibit;
mod tracks;

pub use forced::Continuation;
pub use handle::{DaemonHandle, HandleError, Nack};
pub use inhibit::{liveness_pair, InhibitRef, LivenessWatch, OwnerGuard};

use forced::{ForcedEntry, ForcedKey, ForcedKind, ForcedRegistry};
use inhibit::{InhibitPhase, InhibitionState};
use tracks::{ForcedScope, RunningChain, Track, TrackKind};

/// Fatal daemon failures. The daemon deliberately fails fast on unknown
/// state and relies on an outer supervisor to restart it; all of its state
/// is re-derived from the config service and bucket directory.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A process in the daemon's linked set terminated with an identity the
    /// daemon does not recognize.
    #[error("linked process {0} exited with unrecognized identity")]
    UnknownChild(Ulid),
}

/// Everything the daemon and its workers share, cheaply clonable.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) directory: Arc<dyn BucketDirectory>,
    pub(crate) disk: Arc<dyn DiskUsage>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) throttle: Arc<Throttle>,
    pub(crate) metrics: Arc<Metrics>,
}

/// Inbound events; the daemon's one and only mailbox.
pub(crate) enum DaemonEvent {
    Tick {
        track: TrackKind,
        generation: u64,
    },
    TrackExited {
        track: TrackKind,
        id: ProcessId,
        reason: ExitReason,
    },
    ForcedExited {
        key: ForcedKey,
        id: ProcessId,
        reason: ExitReason,
    },
    InhibitorDown {
        bucket: String,
    },
    SettingsChanged(CompactionSettings),
    Api(ApiRequest),
}

/// Requests arriving from [`DaemonHandle`] callers.
pub(crate) enum ApiRequest {
    ForceCompactBucket {
        bucket: String,
        purge: bool,
        ack: oneshot::Sender<()>,
    },
    ForceCompactDbFiles {
        bucket: String,
        ack: oneshot::Sender<()>,
    },
    ForceCompactView {
        bucket: String,
        group: IndexGroupId,
        ack: oneshot::Sender<()>,
    },
    PartialCompactDbFiles {
        bucket: String,
        obsolete_keys: Vec<Vec<u8>>,
        continuation_id: String,
        continuation: Continuation,
        ack: oneshot::Sender<()>,
    },
    CancelForcedBucket {
        bucket: String,
        ack: oneshot::Sender<()>,
    },
    CancelForcedDb {
        bucket: String,
        ack: oneshot::Sender<()>,
    },
    CancelForcedView {
        bucket: String,
        group: IndexGroupId,
        ack: oneshot::Sender<()>,
    },
    Inhibit {
        bucket: String,
        owner: LivenessWatch,
        reply: oneshot::Sender<Result<InhibitRef, Nack>>,
    },
    Uninhibit {
        bucket: String,
        reference: InhibitRef,
        reply: oneshot::Sender<Result<(), Nack>>,
    },
    GetSettings {
        reply: oneshot::Sender<CompactionSettings>,
    },
    UpdateSettings {
        settings: CompactionSettings,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Root actor owning the three scheduled tracks, the forced-compaction
/// registry, and the view-compaction inhibition protocol.
pub struct CompactionDaemon {
    events_tx: flume::Sender<DaemonEvent>,
    events_rx: flume::Receiver<DaemonEvent>,
    config: Arc<dyn ConfigService>,
    shared: Shared,
    settings: CompactionSettings,
    data: Track,
    views: Track,
    master: Track,
    forced: ForcedRegistry,
    inhibition: Option<InhibitionState>,
    /// Priority view run waiting for the cancelled track compactor to exit.
    pending_priority: Option<String>,
}

impl CompactionDaemon {
    /// Build a daemon and the handle its callers use. The daemon does
    /// nothing until [`run`](Self::run) is polled.
    pub fn new(
        config: Arc<dyn ConfigService>,
        directory: Arc<dyn BucketDirectory>,
        engine: Arc<dyn StorageEngine>,
        disk: Arc<dyn DiskUsage>,
    ) -> (Self, DaemonHandle) {
        let (events_tx, events_rx) = flume::unbounded();
        let metrics = Arc::new(Metrics::default());
        let settings = CompactionSettings::default();
        let shared = Shared {
            engine,
            directory,
            disk,
            clock: Arc::new(WallClock),
            throttle: Throttle::new("data-compactions", settings.data_compaction_limit),
            metrics: Arc::clone(&metrics),
        };
        let interval = settings.check_interval;
        let daemon = Self {
            data: Track::new(TrackKind::DataFiles, interval, events_tx.clone()),
            views: Track::new(TrackKind::ViewIndexes, interval, events_tx.clone()),
            master: Track::new(TrackKind::MasterDb, interval, events_tx.clone()),
            events_tx: events_tx.clone(),
            events_rx,
            config,
            shared,
            settings,
            forced: ForcedRegistry::default(),
            inhibition: None,
            pending_priority: None,
        };
        let handle = DaemonHandle::new(events_tx, metrics);
        (daemon, handle)
    }

    /// Replace the wall clock, e.g. with a fixed clock in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.shared.clock = clock;
        self
    }

    /// Run the daemon until shutdown. An `Err` is a deliberate fail-fast on
    /// corrupted supervision state; the caller is expected to restart.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        self.settings = self.config.settings().await;
        self.shared
            .throttle
            .set_limit(self.settings.data_compaction_limit);
        let forwarder = CancellationToken::new();
        {
            let updates = self.config.subscribe();
            let tx = self.events_tx.clone();
            let cancel = forwarder.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        update = updates.recv_async() => {
                            let Ok(settings) = update else { return };
                            if tx
                                .send_async(DaemonEvent::SettingsChanged(settings))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            });
        }
        let interval = self.settings.check_interval;
        for kind in TrackKind::ALL {
            let track = self.track_mut(kind);
            track.scheduler.set_interval(interval);
            track.scheduler.init();
        }
        maint_log!(
            log::Level::Info,
            "daemon_started",
            "check_interval={interval:?} throttle={}",
            self.shared.throttle.limit(),
        );

        loop {
            let event = match self.events_rx.recv_async().await {
                Ok(event) => event,
                Err(_) => return Ok(()),
            };
            match event {
                DaemonEvent::Tick { track, generation } => self.on_tick(track, generation).await,
                DaemonEvent::TrackExited { track, id, reason } => {
                    self.on_track_exited(track, id, reason).await?
                }
                DaemonEvent::ForcedExited { key, id, reason } => {
                    self.on_forced_exited(key, id, reason)?
                }
                DaemonEvent::InhibitorDown { bucket } => self.on_inhibitor_down(&bucket),
                DaemonEvent::SettingsChanged(settings) => self.on_settings_changed(settings),
                DaemonEvent::Api(request) => {
                    if let Some(ack) = self.on_api(request).await {
                        self.shutdown_all(&forwarder).await;
                        let _ = ack.send(());
                        return Ok(());
                    }
                }
            }
        }
    }

    fn track(&self, kind: TrackKind) -> &Track {
        match kind {
            TrackKind::DataFiles => &self.data,
            TrackKind::ViewIndexes => &self.views,
            TrackKind::MasterDb => &self.master,
        }
    }

    fn track_mut(&mut self, kind: TrackKind) -> &mut Track {
        match kind {
            TrackKind::DataFiles => &mut self.data,
            TrackKind::ViewIndexes => &mut self.views,
            TrackKind::MasterDb => &mut self.master,
        }
    }

    fn inhibited_bucket(&self, bucket: &str) -> bool {
        self.inhibition
            .as_ref()
            .map(|state| state.bucket == bucket)
            .unwrap_or(false)
    }

    async fn bucket_config(&self, bucket: &str) -> BucketConfig {
        let over = self.config.bucket_override(bucket).await;
        BucketConfig::merged(&self.settings, over.as_ref())
    }

    async fn on_tick(&mut self, kind: TrackKind, generation: u64) {
        if !self.track_mut(kind).scheduler.observe_tick(generation) {
            return;
        }
        if self.track(kind).running.is_some() {
            // A tick must not find a live compactor; treat as stale.
            return;
        }
        if self.track(kind).queue.is_empty() {
            let buckets = self.shared.directory.list_buckets().await;
            let track = self.track_mut(kind);
            track.queue = buckets
                .into_iter()
                .filter(|bucket| kind.applies_to(bucket.kind))
                .map(|bucket| bucket.name)
                .collect();
        }
        if self.track(kind).queue.is_empty() {
            maint_log!(
                log::Level::Debug,
                "track_idle",
                "track={} nothing to compact",
                kind.label(),
            );
            self.track_mut(kind).scheduler.schedule_next();
            return;
        }
        self.start_head(kind).await;
    }

    /// Start a compactor for the head bucket of `kind`'s queue, skipping
    /// inhibited buckets for this cycle.
    async fn start_head(&mut self, kind: TrackKind) {
        loop {
            let bucket = match self.track(kind).queue.front() {
                Some(bucket) => bucket.clone(),
                None => {
                    self.track_mut(kind).scheduler.schedule_next();
                    return;
                }
            };
            if kind == TrackKind::ViewIndexes && self.inhibited_bucket(&bucket) {
                maint_log!(
                    log::Level::Debug,
                    "inhibited_bucket_skipped",
                    "bucket={bucket} rejoins after uninhibit",
                );
                self.track_mut(kind).queue.pop_front();
                continue;
            }
            let config = self.bucket_config(&bucket).await;
            let process = self.spawn_track_chain(kind, bucket.clone(), config, false);
            let track = self.track_mut(kind);
            if track.scheduler.state() == SchedulerState::Due {
                track.scheduler.compactor_started();
            } else {
                track.scheduler.start_now();
            }
            track.running = Some(RunningChain {
                process,
                bucket,
                priority: false,
            });
            self.shared.metrics.record_run_started();
            return;
        }
    }

    fn spawn_track_chain(
        &self,
        kind: TrackKind,
        bucket: String,
        config: BucketConfig,
        priority: bool,
    ) -> LinkedProcess {
        let shared = self.shared.clone();
        let tx = self.events_tx.clone();
        let label = if priority {
            "priority-views"
        } else {
            kind.label()
        };
        spawn_linked(
            tx,
            move |id, reason| DaemonEvent::TrackExited {
                track: kind,
                id,
                reason,
            },
            move |cancel| async move {
                let items = if priority {
                    tracks::priority_view_items(&shared, &bucket, &config).await
                } else {
                    tracks::build_track_items(&shared, kind, &bucket, &config).await
                };
                chain::run_chain(label, items, cancel).await
            },
        )
    }

    async fn on_track_exited(
        &mut self,
        kind: TrackKind,
        id: ProcessId,
        reason: ExitReason,
    ) -> Result<(), DaemonError> {
        let track = self.track_mut(kind);
        let chain = match track.running.take() {
            Some(chain) if chain.process.id() == id => chain,
            Some(other) => {
                track.running = Some(other);
                return Err(DaemonError::UnknownChild(id));
            }
            None => return Err(DaemonError::UnknownChild(id)),
        };
        self.shared.metrics.record_run_finished(&reason);
        let level = if reason.is_failure() {
            log::Level::Warn
        } else {
            log::Level::Info
        };
        maint_log!(
            level,
            "track_run_done",
            "track={} bucket={} reason={reason}",
            kind.label(),
            chain.bucket,
        );

        if chain.priority {
            self.finish_uninhibit();
            if self.track(kind).queue.is_empty() {
                self.track_mut(kind).scheduler.schedule_next();
            } else {
                self.start_head(kind).await;
            }
            return Ok(());
        }

        match reason {
            // Intentionally interrupted: keep the bucket at the head. The
            // track is rescheduled rather than restarted at once, so it does
            // not fight whatever stopped it.
            ExitReason::Shutdown => {
                if let Some(bucket) = self.take_pending_priority(kind) {
                    self.start_priority_run(bucket).await;
                    return Ok(());
                }
                self.track_mut(kind).scheduler.schedule_next();
            }
            _ => {
                self.track_mut(kind).queue.pop_front();
                // The compactor may have finished on its own in the window
                // between the uninhibit's cancel and this exit event; the
                // priority run must still happen.
                if let Some(bucket) = self.take_pending_priority(kind) {
                    self.start_priority_run(bucket).await;
                    return Ok(());
                }
                let track = self.track_mut(kind);
                if track.queue.is_empty() {
                    track.scheduler.schedule_next();
                } else {
                    self.start_head(kind).await;
                }
            }
        }
        Ok(())
    }

    fn take_pending_priority(&mut self, kind: TrackKind) -> Option<String> {
        if kind != TrackKind::ViewIndexes {
            return None;
        }
        self.pending_priority.take()
    }

    fn finish_uninhibit(&mut self) {
        let Some(state) = self.inhibition.take() else {
            return;
        };
        if state.stopped_data_compactor {
            maint_log!(
                log::Level::Debug,
                "data_compaction_resumes",
                "bucket={} data track rescheduled",
                state.bucket,
            );
        }
        if let Some(reply) = state.reply {
            let _ = reply.send(Ok(()));
        }
        self.shared.metrics.record_inhibit_transition();
        maint_log!(
            log::Level::Info,
            "view_compaction_uninhibited",
            "bucket={}",
            state.bucket,
        );
    }

    async fn start_priority_run(&mut self, bucket: String) {
        if let Some(state) = self.inhibition.as_mut() {
            state.phase = InhibitPhase::UninhibitRunning;
        }
        let config = self.bucket_config(&bucket).await;
        let process = self.spawn_track_chain(TrackKind::ViewIndexes, bucket.clone(), config, true);
        maint_log!(
            log::Level::Info,
            "priority_view_compaction_started",
            "bucket={bucket}",
        );
        let track = self.track_mut(TrackKind::ViewIndexes);
        track.scheduler.start_now();
        track.running = Some(RunningChain {
            process,
            bucket,
            priority: true,
        });
        self.shared.metrics.record_run_started();
    }

    fn on_forced_exited(
        &mut self,
        key: ForcedKey,
        id: ProcessId,
        reason: ExitReason,
    ) -> Result<(), DaemonError> {
        let Some(entry) = self.forced.remove_matching(&key, id) else {
            return Err(DaemonError::UnknownChild(id));
        };
        self.shared.metrics.record_run_finished(&reason);
        let level = if reason.is_failure() {
            log::Level::Warn
        } else {
            log::Level::Info
        };
        maint_log!(
            level,
            "forced_compaction_done",
            "kind={} target={} reason={reason}",
            key.kind.label(),
            key.name,
        );
        for (_, continuation) in entry.continuations {
            continuation(reason.clone());
        }
        Ok(())
    }

    fn on_inhibitor_down(&mut self, bucket: &str) {
        let clears = self
            .inhibition
            .as_ref()
            .map(|state| state.bucket == bucket && state.phase == InhibitPhase::Inhibited)
            .unwrap_or(false);
        if !clears {
            return;
        }
        self.inhibition = None;
        self.shared.metrics.record_inhibit_transition();
        maint_log!(
            log::Level::Info,
            "inhibitor_lost",
            "bucket={bucket} inhibition cancelled",
        );
    }

    fn on_settings_changed(&mut self, settings: CompactionSettings) {
        if settings == self.settings {
            return;
        }
        maint_log!(
            log::Level::Info,
            "settings_changed",
            "check_interval={:?} throttle={}",
            settings.check_interval,
            settings.data_compaction_limit,
        );
        self.shared
            .throttle
            .set_limit(settings.data_compaction_limit);
        let interval = settings.check_interval;
        for kind in TrackKind::ALL {
            self.track_mut(kind).scheduler.set_interval(interval);
        }
        self.settings = settings;
    }

    /// Dispatch one API request. Returns the ack sender when the request
    /// was a shutdown, which the run loop completes after teardown.
    async fn on_api(&mut self, request: ApiRequest) -> Option<oneshot::Sender<()>> {
        match request {
            ApiRequest::ForceCompactBucket { bucket, purge, ack } => {
                self.handle_force_bucket(bucket, purge).await;
                let _ = ack.send(());
            }
            ApiRequest::ForceCompactDbFiles { bucket, ack } => {
                self.handle_force_db(bucket).await;
                let _ = ack.send(());
            }
            ApiRequest::ForceCompactView { bucket, group, ack } => {
                self.handle_force_view(bucket, group).await;
                let _ = ack.send(());
            }
            ApiRequest::PartialCompactDbFiles {
                bucket,
                obsolete_keys,
                continuation_id,
                continuation,
                ack,
            } => {
                self.handle_partial(bucket, obsolete_keys, continuation_id, continuation)
                    .await;
                let _ = ack.send(());
            }
            ApiRequest::CancelForcedBucket { bucket, ack } => {
                self.handle_cancel(&[
                    ForcedKey {
                        kind: ForcedKind::Bucket,
                        name: bucket.clone(),
                    },
                    ForcedKey {
                        kind: ForcedKind::BucketPurge,
                        name: bucket,
                    },
                ]);
                let _ = ack.send(());
            }
            ApiRequest::CancelForcedDb { bucket, ack } => {
                self.handle_cancel(&[
                    ForcedKey {
                        kind: ForcedKind::Db,
                        name: bucket.clone(),
                    },
                    ForcedKey {
                        kind: ForcedKind::DbPartial,
                        name: bucket,
                    },
                ]);
                let _ = ack.send(());
            }
            ApiRequest::CancelForcedView { bucket, group, ack } => {
                self.handle_cancel(&[ForcedKey {
                    kind: ForcedKind::View,
                    name: view_target(&bucket, &group),
                }]);
                let _ = ack.send(());
            }
            ApiRequest::Inhibit {
                bucket,
                owner,
                reply,
            } => self.handle_inhibit(bucket, owner, reply),
            ApiRequest::Uninhibit {
                bucket,
                reference,
                reply,
            } => self.handle_uninhibit(bucket, reference, reply).await,
            ApiRequest::GetSettings { reply } => {
                let settings = self.config.settings().await;
                let _ = reply.send(settings);
            }
            ApiRequest::UpdateSettings { settings, reply } => {
                self.config.update_settings(settings).await;
                let _ = reply.send(());
            }
            ApiRequest::Shutdown { ack } => return Some(ack),
        }
        None
    }

    fn forced_duplicate(&self, key: &ForcedKey) -> bool {
        if !self.forced.contains(key) {
            return false;
        }
        self.shared.metrics.record_forced_deduplicated();
        maint_log!(
            log::Level::Debug,
            "forced_compaction_deduplicated",
            "kind={} target={} already in flight",
            key.kind.label(),
            key.name,
        );
        true
    }

    async fn forced_target_exists(&self, key: &ForcedKey, bucket: &str) -> bool {
        if self.shared.directory.bucket_exists(bucket).await {
            return true;
        }
        maint_log!(
            log::Level::Warn,
            "forced_unknown_bucket",
            "kind={} bucket={bucket}",
            key.kind.label(),
        );
        false
    }

    fn spawn_forced(
        &self,
        key: ForcedKey,
        scope: ForcedScope,
        bucket: String,
        config: BucketConfig,
        options: CompactOptions,
    ) -> LinkedProcess {
        let shared = self.shared.clone();
        let tx = self.events_tx.clone();
        let wrap_key = key.clone();
        spawn_linked(
            tx,
            move |id, reason| DaemonEvent::ForcedExited {
                key: wrap_key,
                id,
                reason,
            },
            move |cancel| async move {
                let items =
                    tracks::build_forced_items(&shared, scope, &bucket, &config, options).await;
                chain::run_chain("forced", items, cancel).await
            },
        )
    }

    fn register_forced(
        &mut self,
        key: ForcedKey,
        process: LinkedProcess,
        continuations: Vec<(String, Continuation)>,
    ) {
        maint_log!(
            log::Level::Info,
            "forced_compaction_started",
            "kind={} target={}",
            key.kind.label(),
            key.name,
        );
        self.shared.metrics.record_run_started();
        self.forced.insert(
            key,
            ForcedEntry {
                process,
                continuations,
            },
        );
    }

    async fn handle_force_bucket(&mut self, bucket: String, purge: bool) {
        let kind = if purge {
            ForcedKind::BucketPurge
        } else {
            ForcedKind::Bucket
        };
        let key = ForcedKey {
            kind,
            name: bucket.clone(),
        };
        if self.forced_duplicate(&key) || !self.forced_target_exists(&key, &bucket).await {
            return;
        }
        let config = self.bucket_config(&bucket).await;
        let options = CompactOptions {
            purge_deletes: purge || config.purge_deletes,
            obsolete_keys: Vec::new(),
        };
        let process = self.spawn_forced(
            key.clone(),
            ForcedScope::WholeBucket,
            bucket,
            config,
            options,
        );
        self.register_forced(key, process, Vec::new());
    }

    async fn handle_force_db(&mut self, bucket: String) {
        let key = ForcedKey {
            kind: ForcedKind::Db,
            name: bucket.clone(),
        };
        if self.forced_duplicate(&key) || !self.forced_target_exists(&key, &bucket).await {
            return;
        }
        let config = self.bucket_config(&bucket).await;
        let options = CompactOptions {
            purge_deletes: config.purge_deletes,
            obsolete_keys: Vec::new(),
        };
        let process =
            self.spawn_forced(key.clone(), ForcedScope::DataFiles, bucket, config, options);
        self.register_forced(key, process, Vec::new());
    }

    async fn handle_force_view(&mut self, bucket: String, group: IndexGroupId) {
        let key = ForcedKey {
            kind: ForcedKind::View,
            name: view_target(&bucket, &group),
        };
        if self.forced_duplicate(&key) || !self.forced_target_exists(&key, &bucket).await {
            return;
        }
        let config = self.bucket_config(&bucket).await;
        let process = self.spawn_forced(
            key.clone(),
            ForcedScope::SingleView(group),
            bucket,
            config,
            CompactOptions::default(),
        );
        self.register_forced(key, process, Vec::new());
    }

    async fn handle_partial(
        &mut self,
        bucket: String,
        obsolete_keys: Vec<Vec<u8>>,
        continuation_id: String,
        continuation: Continuation,
    ) {
        let key = ForcedKey {
            kind: ForcedKind::DbPartial,
            name: bucket.clone(),
        };
        if self.forced.contains(&key) {
            // Same target already being partially compacted: remember this
            // caller's continuation instead of spawning a second run.
            self.forced
                .append_continuation(&key, continuation_id, continuation);
            self.shared.metrics.record_forced_deduplicated();
            maint_log!(
                log::Level::Debug,
                "partial_compaction_joined",
                "bucket={bucket} continuation appended",
            );
            return;
        }
        if !self.forced_target_exists(&key, &bucket).await {
            continuation(ExitReason::Failed("unknown bucket".to_string()));
            return;
        }
        let config = self.bucket_config(&bucket).await;
        let options = CompactOptions {
            purge_deletes: config.purge_deletes,
            obsolete_keys,
        };
        let process =
            self.spawn_forced(key.clone(), ForcedScope::DataFiles, bucket, config, options);
        self.register_forced(key, process, vec![(continuation_id, continuation)]);
    }

    fn handle_cancel(&mut self, keys: &[ForcedKey]) {
        for key in keys {
            if let Some(entry) = self.forced.get(key) {
                maint_log!(
                    log::Level::Info,
                    "forced_compaction_cancel_requested",
                    "kind={} target={}",
                    key.kind.label(),
                    key.name,
                );
                entry.process.cancel();
            }
        }
    }

    fn handle_inhibit(
        &mut self,
        bucket: String,
        owner: LivenessWatch,
        reply: oneshot::Sender<Result<InhibitRef, Nack>>,
    ) {
        if self.inhibition.is_some() {
            let _ = reply.send(Err(Nack::AlreadyInhibited));
            return;
        }
        let reference = Ulid::new();
        let watch_cancel = CancellationToken::new();
        {
            let tx = self.events_tx.clone();
            let cancel = watch_cancel.clone();
            let bucket = bucket.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = owner.lost() => {
                        let _ = tx.send_async(DaemonEvent::InhibitorDown { bucket }).await;
                    }
                }
            });
        }
        // Pause takes effect promptly: kill a live index compactor for the
        // bucket instead of waiting it out.
        if let Some(chain) = &self.views.running {
            if chain.bucket == bucket && !chain.priority {
                maint_log!(
                    log::Level::Info,
                    "index_compactor_stopped_for_inhibit",
                    "bucket={bucket}",
                );
                chain.process.cancel();
            }
        }
        self.inhibition = Some(InhibitionState {
            bucket: bucket.clone(),
            reference,
            phase: InhibitPhase::Inhibited,
            watch_cancel,
            stopped_data_compactor: false,
            reply: None,
        });
        self.shared.metrics.record_inhibit_transition();
        maint_log!(
            log::Level::Info,
            "view_compaction_inhibited",
            "bucket={bucket}",
        );
        let _ = reply.send(Ok(reference));
    }

    async fn handle_uninhibit(
        &mut self,
        bucket: String,
        reference: InhibitRef,
        reply: oneshot::Sender<Result<(), Nack>>,
    ) {
        match self.inhibition.as_mut() {
            Some(state)
                if state.bucket == bucket
                    && state.reference == reference
                    && state.phase == InhibitPhase::Inhibited =>
            {
                state.watch_cancel.cancel();
                state.phase = InhibitPhase::UninhibitRequested;
                state.reply = Some(reply);
            }
            _ => {
                let _ = reply.send(Err(Nack::BadReference));
                return;
            }
        }
        self.shared.metrics.record_inhibit_transition();
        maint_log!(log::Level::Info, "uninhibit_requested", "bucket={bucket}");

        let config = self.bucket_config(&bucket).await;
        if !config.parallel_db_and_view {
            if let Some(chain) = &self.data.running {
                maint_log!(
                    log::Level::Info,
                    "data_compaction_stopped_for_uninhibit",
                    "bucket={bucket} stopped={}",
                    chain.bucket,
                );
                chain.process.cancel();
                if let Some(state) = self.inhibition.as_mut() {
                    state.stopped_data_compactor = true;
                }
            }
        }
        // The priority run must start before the bucket rejoins the normal
        // schedule; a compactor occupying the view track is stopped first.
        if let Some(chain) = &self.views.running {
            chain.process.cancel();
            self.pending_priority = Some(bucket);
        } else {
            self.start_priority_run(bucket).await;
        }
    }

    async fn shutdown_all(&mut self, forwarder: &CancellationToken) {
        forwarder.cancel();
        self.pending_priority = None;
        if let Some(state) = self.inhibition.take() {
            state.watch_cancel.cancel();
            // A pending uninhibit caller learns of the teardown by its
            // reply channel closing.
            drop(state.reply);
        }
        for kind in TrackKind::ALL {
            let running = {
                let track = self.track_mut(kind);
                track.scheduler.cancel();
                track.running.take()
            };
            if let Some(chain) = running {
                chain.process.stop_and_wait().await;
            }
        }
        for (key, entry) in self.forced.drain() {
            entry.process.stop_and_wait().await;
            for (_, continuation) in entry.continuations {
                continuation(ExitReason::Shutdown);
            }
            maint_log!(
                log::Level::Info,
                "forced_compaction_cancelled",
                "kind={} target={}",
                key.kind.label(),
                key.name,
            );
        }
        maint_log!(
            log::Level::Info,
            "daemon_stopped",
            "all compaction work terminated",
        );
    }
}

fn view_target(bucket: &str, group: &IndexGroupId) -> String {
    format!("{bucket}/{group}")
}
