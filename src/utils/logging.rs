//! Logging setup plus conditional logging macros gated on a module-level
//! `ENABLE_LOGS` flag.
//!
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//!
//! log_info!("ledger merged {}", entity_id);
//! ```

use log::LevelFilter;

/// Initialise `env_logger` once. `RUST_LOG` still wins over `default_level`.
pub fn init(default_level: &str, debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        default_level.parse().unwrap_or(LevelFilter::Info)
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Debug output is noisy (one line per tick), so it gets its own macro.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}
