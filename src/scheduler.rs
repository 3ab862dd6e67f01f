//! Per-track tick scheduling.
//!
//! Ticks are delivered as plain messages on the owner's event channel so the
//! owner is never blocked waiting for a timer. Every armed tick carries the
//! generation it was armed with; after a rearm or cancel, in-flight ticks
//! from older generations are dropped as stale.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Where a track currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// A tick fired and nothing is running yet.
    Due,
    /// A compactor is alive.
    Running,
}

/// Timer/state machine deciding when a track is due for its next sweep.
pub(crate) struct TrackScheduler<T: Send + 'static> {
    interval: Duration,
    state: SchedulerState,
    generation: u64,
    started_now: bool,
    armed: Option<CancellationToken>,
    tx: flume::Sender<T>,
    make_tick: Box<dyn Fn(u64) -> T + Send + Sync>,
}

impl<T: Send + 'static> TrackScheduler<T> {
    pub(crate) fn new(
        interval: Duration,
        tx: flume::Sender<T>,
        make_tick: Box<dyn Fn(u64) -> T + Send + Sync>,
    ) -> Self {
        Self {
            interval,
            state: SchedulerState::Idle,
            generation: 0,
            started_now: false,
            armed: None,
            tx,
            make_tick,
        }
    }

    /// Arm an immediate first tick.
    pub(crate) fn init(&mut self) {
        self.arm(Duration::ZERO);
    }

    /// Arm a tick for now + interval and return to `Idle`.
    pub(crate) fn schedule_next(&mut self) {
        let interval = self.interval;
        self.arm(interval);
    }

    /// Mark `Running` mid-cycle without rearming the timer.
    pub(crate) fn start_now(&mut self) {
        self.state = SchedulerState::Running;
        self.started_now = true;
    }

    /// Validate an incoming tick; returns `false` for stale generations or
    /// ticks arriving outside `Idle`.
    pub(crate) fn observe_tick(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != SchedulerState::Idle {
            return false;
        }
        self.armed = None;
        self.state = SchedulerState::Due;
        true
    }

    /// The observed tick produced a running compactor.
    pub(crate) fn compactor_started(&mut self) {
        self.state = SchedulerState::Running;
        self.started_now = false;
    }

    /// Disarm; any in-flight tick becomes stale.
    pub(crate) fn cancel(&mut self) {
        self.disarm();
        self.generation += 1;
        self.state = SchedulerState::Idle;
    }

    /// Takes effect at the next arm.
    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub(crate) fn state(&self) -> SchedulerState {
        self.state
    }

    /// Whether the current `Running` state was entered mid-cycle rather
    /// than by a timer-driven tick.
    #[allow(dead_code)]
    pub(crate) fn started_now(&self) -> bool {
        self.started_now
    }

    fn arm(&mut self, delay: Duration) {
        self.disarm();
        self.generation += 1;
        self.state = SchedulerState::Idle;
        self.started_now = false;
        let token = CancellationToken::new();
        let guard = token.clone();
        let tick = (self.make_tick)(self.generation);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send_async(tick).await;
                }
            }
        });
        self.armed = Some(token);
    }

    fn disarm(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }
}

impl<T: Send + 'static> Drop for TrackScheduler<T> {
    fn drop(&mut self) {
        self.disarm();
    }
}
