use crate::models::NodeEvent;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn, LevelFilter};
use std::path::Path;
use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

static INIT: Once = Once::new();

/// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "redis-flow-bridge.log";

fn level_filter(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
}

fn bridge_log_tracer(max_level: LevelFilter) {
    // Initialize LogTracer to bridge log events to tracing (after subscriber is set up)
    if let Err(e) = LogTracer::init() {
        eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
    }
    log::set_max_level(max_level);
}

/// Initialize logger from the configured level, optionally mirroring output
/// into a daily rolling file under `file_dir`.
pub fn init_logger_with_config(log_level: &str, file_dir: Option<&Path>) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let console = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_level(true)
            .with_ansi(true)
            .with_writer(std::io::stderr);

        let file = file_dir.map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            fmt::layer().with_ansi(false).with_writer(writer)
        });

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file);

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Warning: Failed to install tracing subscriber: {:?}", e);
        }

        bridge_log_tracer(level_filter(log_level));
    });
}

/// Log a node event using log (bridged to tracing via tracing-log)
pub fn log_node_event(event: &NodeEvent) -> Result<()> {
    let timestamp = Utc::now().to_rfc3339();
    let line = serde_json::to_string(event)?;
    debug!("[{}] NODE EVENT: {}", timestamp, line);
    Ok(())
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Convenience macro for logging node events
#[macro_export]
macro_rules! log_node_event {
    ($event:expr) => {
        if let Err(e) = $crate::logging::log_node_event($event) {
            eprintln!("Failed to log node event: {}", e);
        }
    };
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

/// Convenience macro for logging warning messages
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}
