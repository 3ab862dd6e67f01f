//! Allowed time-of-day windows constraining when compaction may run.

use std::time::Duration;

use chrono::Timelike;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Wall-clock time of day with minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    /// Hour, `0..24`.
    pub hour: u8,
    /// Minute, `0..60`.
    pub minute: u8,
}

impl TimeOfDay {
    /// Build a time of day; out-of-range components are debug-asserted.
    pub fn new(hour: u8, minute: u8) -> Self {
        debug_assert!(hour < 24 && minute < 60);
        Self { hour, minute }
    }

    fn minutes(self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

/// Allowed compaction window, half-open `[from, to)`, possibly wrapping
/// midnight. `from == to` means the window never closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Start of the window, inclusive.
    pub from: TimeOfDay,
    /// End of the window, exclusive.
    pub to: TimeOfDay,
    /// Forcibly terminate a run still active when the window closes.
    pub abort_outside: bool,
}

impl WindowConfig {
    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: TimeOfDay) -> bool {
        let (from, to, now) = (self.from.minutes(), self.to.minutes(), now.minutes());
        if from == to {
            return true;
        }
        if from < to {
            from <= now && now < to
        } else {
            now >= from || now < to
        }
    }

    /// Time until the window closes, measured from `now`.
    ///
    /// `None` when the window never closes or `now` is already outside it.
    pub fn remaining(&self, now: TimeOfDay) -> Option<Duration> {
        if self.from.minutes() == self.to.minutes() || !self.contains(now) {
            return None;
        }
        let to = self.to.minutes();
        let now = now.minutes();
        let minutes = if now < to {
            to - now
        } else {
            MINUTES_PER_DAY - now + to
        };
        Some(Duration::from_secs(u64::from(minutes) * 60))
    }
}

/// Wall-clock seam so tests can pin the time of day.
pub trait Clock: Send + Sync {
    /// Current local time of day.
    fn time_of_day(&self) -> TimeOfDay;
}

/// System clock in local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn time_of_day(&self) -> TimeOfDay {
        let now = chrono::Local::now();
        TimeOfDay {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(from: (u8, u8), to: (u8, u8)) -> WindowConfig {
        WindowConfig {
            from: TimeOfDay::new(from.0, from.1),
            to: TimeOfDay::new(to.0, to.1),
            abort_outside: false,
        }
    }

    #[test]
    fn plain_window_contains() {
        let win = window((1, 0), (5, 30));
        assert!(win.contains(TimeOfDay::new(1, 0)));
        assert!(win.contains(TimeOfDay::new(3, 15)));
        assert!(!win.contains(TimeOfDay::new(5, 30)));
        assert!(!win.contains(TimeOfDay::new(0, 59)));
        assert!(!win.contains(TimeOfDay::new(23, 0)));
    }

    #[test]
    fn wrapping_window_contains() {
        let win = window((22, 0), (4, 0));
        assert!(win.contains(TimeOfDay::new(23, 30)));
        assert!(win.contains(TimeOfDay::new(0, 0)));
        assert!(win.contains(TimeOfDay::new(3, 59)));
        assert!(!win.contains(TimeOfDay::new(4, 0)));
        assert!(!win.contains(TimeOfDay::new(12, 0)));
    }

    #[test]
    fn degenerate_window_is_always_open() {
        let win = window((2, 0), (2, 0));
        assert!(win.contains(TimeOfDay::new(2, 0)));
        assert!(win.contains(TimeOfDay::new(14, 45)));
        assert_eq!(win.remaining(TimeOfDay::new(14, 45)), None);
    }

    #[test]
    fn remaining_until_close() {
        let win = window((1, 0), (5, 0));
        assert_eq!(
            win.remaining(TimeOfDay::new(4, 55)),
            Some(Duration::from_secs(5 * 60))
        );
        assert_eq!(win.remaining(TimeOfDay::new(6, 0)), None);

        let wrapping = window((22, 0), (4, 0));
        assert_eq!(
            wrapping.remaining(TimeOfDay::new(23, 0)),
            Some(Duration::from_secs(5 * 60 * 60))
        );
    }
}
