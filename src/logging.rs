//! Internal logging helpers for structured maintenance events.

/// Single logging target for the maintenance engine.
pub(crate) const LOG_TARGET: &str = "compactd";

macro_rules! maint_log {
    ($level:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!($level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} {}",
                $event,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use maint_log;
