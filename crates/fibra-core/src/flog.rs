//! Context-aware debug print macros
//!
//! Thread-safe stderr output that tags each line with the current worker
//! and task, so interleaved scheduler traces stay readable.
//!
//! # Environment Variables
//!
//! - `FIBRA_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `FIBRA_LOG_FLUSH=1` - Flush stderr after each line (crash debugging)
//! - `FIBRA_LOG_TIME=1` - Prefix lines with nanoseconds since start
//!
//! # Output Format
//!
//! `[LEVEL] [w<worker>:t<task>] message`, with `--` standing in for
//! "not on a worker" / "not in a task".

use crate::env::env_get_bool;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

/// Log levels, lowest to highest verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize from environment variables; implicit on first log
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("FIBRA_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("FIBRA_LOG_TIME", false), Ordering::Relaxed);
    if let Ok(val) = std::env::var("FIBRA_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Error,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether `level` would currently print
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Nanoseconds since logging started
#[inline]
pub fn elapsed_ns() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

// Set by the runtime around worker startup and context switches
thread_local! {
    static LOG_WORKER: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
    static LOG_TASK: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

pub fn set_log_worker(id: Option<u32>) {
    LOG_WORKER.with(|w| w.set(id));
}

pub fn set_log_task(id: Option<u64>) {
    LOG_TASK.with(|t| t.set(id));
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();

    let _ = write!(handle, "{} ", level.prefix());
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let _ = write!(handle, "[{}] ", elapsed_ns());
    }
    let worker = LOG_WORKER.with(|w| w.get());
    let task = LOG_TASK.with(|t| t.get());
    match (worker, task) {
        (Some(w), Some(t)) => {
            let _ = write!(handle, "[w{}:t{}] ", w, t);
        }
        (Some(w), None) => {
            let _ = write!(handle, "[w{}:t--] ", w);
        }
        _ => {
            let _ = write!(handle, "[w--:t--] ");
        }
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log with scheduler context
#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {{
        $crate::flog::_log_impl($crate::flog::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log with scheduler context
#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {{
        $crate::flog::_log_impl($crate::flog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log with scheduler context
#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {{
        $crate::flog::_log_impl($crate::flog::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log with scheduler context
#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {{
        $crate::flog::_log_impl($crate::flog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log with scheduler context
#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {{
        $crate::flog::_log_impl($crate::flog::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        ferror!("err {}", 1);
        fwarn!("warn");
        finfo!("info");
        fdebug!("debug");
        ftrace!("trace");
    }

    #[test]
    fn test_context_cells() {
        set_log_worker(Some(2));
        set_log_task(Some(9));
        LOG_WORKER.with(|w| assert_eq!(w.get(), Some(2)));
        LOG_TASK.with(|t| assert_eq!(t.get(), Some(9)));
        set_log_worker(None);
        set_log_task(None);
    }
}
