//! Leveled stderr logging macros
//!
//! Thread-safe, optionally-flushing debug output for the engine. Reactor
//! threads install a per-thread label (the executor name) so interleaved
//! output stays attributable.
//!
//! # Environment Variables
//!
//! - `NETLOOP_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info,
//!   4=debug, 5=trace (names accepted too)
//! - `NETLOOP_FLUSH_EPRINT=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use netloop_core::{nl_info, nl_warn};
//!
//! nl_info!("executor {} started", name);
//! nl_warn!("unexpected readiness: {:?}", flags);
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN ]",
            Level::Info => "[INFO ]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Label printed with every line from this thread (executor name)
    static THREAD_LABEL: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Initialize from environment variables.
///
/// Called automatically on first log; call explicitly for deterministic
/// startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(raw) = std::env::var("NETLOOP_LOG_LEVEL") {
        let level = match raw.to_lowercase().as_str() {
            "off" | "0" => Level::Off,
            "error" | "1" => Level::Error,
            "warn" | "2" => Level::Warn,
            "info" | "3" => Level::Info,
            "debug" | "4" => Level::Debug,
            "trace" | "5" => Level::Trace,
            _ => Level::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(raw) = std::env::var("NETLOOP_FLUSH_EPRINT") {
        let flush = matches!(raw.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Set the log level programmatically
pub fn set_level(level: Level) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Is `level` currently enabled?
#[inline]
pub fn enabled(level: Level) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Install the per-thread label (executor name)
pub fn set_thread_label(label: &str) {
    THREAD_LABEL.with(|l| *l.borrow_mut() = Some(label.to_string()));
}

/// Remove the per-thread label (thread exiting)
pub fn clear_thread_label() {
    THREAD_LABEL.with(|l| *l.borrow_mut() = None);
}

/// Emit one formatted line. Used by the macros; not meant to be called
/// directly.
pub fn write_line(level: Level, args: std::fmt::Arguments<'_>) {
    let line = THREAD_LABEL.with(|l| match &*l.borrow() {
        Some(label) => format!("{} [{}] {}", level.prefix(), label, args),
        None => format!("{} {}", level.prefix(), args),
    });
    eprintln!("{}", line);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = std::io::stderr().flush();
    }
}

#[macro_export]
macro_rules! nl_log {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::log::enabled($level) {
            $crate::log::write_line($level, format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! nl_error {
    ($($arg:tt)*) => { $crate::nl_log!($crate::log::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! nl_warn {
    ($($arg:tt)*) => { $crate::nl_log!($crate::log::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! nl_info {
    ($($arg:tt)*) => { $crate::nl_log!($crate::log::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! nl_debug {
    ($($arg:tt)*) => { $crate::nl_log!($crate::log::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! nl_trace {
    ($($arg:tt)*) => { $crate::nl_log!($crate::log::Level::Trace, $($arg)*) };
}
