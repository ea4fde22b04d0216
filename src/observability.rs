//! Internal logging macros.
//!
//! The crate does not force a logging backend on its users. Each macro
//! resolves, in order:
//! 1) `tracing` feature: emit a `tracing` event
//! 2) `logging` feature (default): emit a `log` record
//! 3) neither: no-op that still type-checks its format arguments

#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
