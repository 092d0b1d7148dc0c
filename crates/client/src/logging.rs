//! Logging macros and subscriber setup.
//!
//! Library code logs through `log_info!` and friends so every message from
//! the chat core lands under one target, whichever module emitted it. A
//! call may name its own target with `log_info!(target: "...", ...)`.

use std::fmt;

use tracing_subscriber::EnvFilter;

#[doc(hidden)]
pub use tracing::Level;

/// Target used when a call site does not name one.
pub const TARGET: &str = "supportdesk_client";

/// Emit one formatted record. Called by the `log_*!` macros.
#[doc(hidden)]
pub fn emit(level: Level, target: &str, args: fmt::Arguments<'_>) {
    // tracing needs a constant target, so a custom one travels as a field.
    let scope = (target != TARGET).then_some(target);
    if level == Level::ERROR {
        tracing::error!(target: TARGET, scope, "{}", args);
    } else if level == Level::WARN {
        tracing::warn!(target: TARGET, scope, "{}", args);
    } else if level == Level::INFO {
        tracing::info!(target: TARGET, scope, "{}", args);
    } else if level == Level::DEBUG {
        tracing::debug!(target: TARGET, scope, "{}", args);
    } else {
        tracing::trace!(target: TARGET, scope, "{}", args);
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        $crate::logging::emit($crate::logging::Level::$level, $target, format_args!($($arg)+))
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::logging::emit(
            $crate::logging::Level::$level,
            $crate::logging::TARGET,
            format_args!($($arg)+),
        )
    };
}

/// Log at info level.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::__log_at!(INFO, $($arg)+) };
}

/// Log at error level.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::__log_at!(ERROR, $($arg)+) };
}

/// Log at warn level.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::__log_at!(WARN, $($arg)+) };
}

/// Log at debug level.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::__log_at!(DEBUG, $($arg)+) };
}
