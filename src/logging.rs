//! Logging for the segment, allocators and cache
//!
//! Events go to stderr, or to a daily rotated file when a directory is
//! configured; stdout stays free for the admin tool's reports. Allocator and
//! cache events carry a fixed `event` field so they can be filtered.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use tracing::{debug, error, info, trace, warn, Level};

use crate::segment::Offset;

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// File name prefix of rotated log files
pub const LOG_FILE_PREFIX: &str = "theme-shm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Subscriber settings, usually built from `[logging]` in the config file
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Rotated log files go here; `None` logs to stderr
    pub directory: Option<PathBuf>,
    /// Extra filter directives (e.g., "theme_shm::cache=trace")
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            directory: None,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the global subscriber
///
/// Returns the non-blocking writer's guard; keep it alive until exit so
/// buffered events are flushed. Only the first call installs anything,
/// later calls return `None`.
pub fn init_logging(config: LogConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter(&config);
        let (writer, g) = match &config.directory {
            Some(directory) => tracing_appender::non_blocking(rolling::daily(directory, LOG_FILE_PREFIX)),
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer().with_writer(writer).pretty().with_filter(filter).boxed(),
            LogFormat::Compact => fmt::layer().with_writer(writer).compact().with_filter(filter).boxed(),
            LogFormat::Json => fmt::layer().with_writer(writer).json().with_filter(filter).boxed(),
        };

        // another subscriber may already be installed (tests, embedding apps)
        if tracing_subscriber::registry().with(layer).try_init().is_ok() {
            guard = Some(g);
        }
    });
    guard
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .fold(base, |filter, directive| match directive.trim().parse() {
                Ok(d) => filter.add_directive(d),
                Err(_) => {
                    eprintln!("ignoring invalid log directive: {}", directive);
                    filter
                }
            }),
        None => base,
    }
}

// ============================================================================
// Segment and allocator events
// ============================================================================

#[inline]
pub fn log_allocation(allocator: &'static str, offset: Offset, size: usize) {
    trace!(
        event = "allocation",
        allocator,
        offset = %offset,
        size_bytes = size,
        "shared memory allocated"
    );
}

#[inline]
pub fn log_deallocation(allocator: &'static str, offset: Offset) {
    trace!(
        event = "deallocation",
        allocator,
        offset = %offset,
        "shared memory released"
    );
}

pub fn log_out_of_memory(allocator: &'static str, requested: usize, free_bytes: usize) {
    warn!(
        event = "out_of_memory",
        allocator,
        requested_bytes = requested,
        free_bytes,
        "shared memory exhausted"
    );
}

pub fn log_segment_created(name: &str, size: usize) {
    info!(event = "segment_created", segment = name, size_bytes = size, "segment created");
}

pub fn log_segment_attached(name: &str, writable: bool) {
    info!(event = "segment_attached", segment = name, writable, "segment attached");
}

pub fn log_segment_recovered(name: &str) {
    info!(
        event = "segment_recovered",
        segment = name,
        "reconnected to allocator state left by a previous server"
    );
}

// ============================================================================
// Cache events
// ============================================================================

pub fn log_cache_add(kind: &str, key: &str, offset: Offset) {
    debug!(event = "cache_add", kind, key, offset = %offset, "cache entry added");
}

pub fn log_cache_remove(kind: &str, key: &str) {
    debug!(event = "cache_remove", kind, key, "cache entry removed");
}

#[inline]
pub fn log_cache_miss(kind: &str, key: &str) {
    trace!(event = "cache_miss", kind, key, "cache lookup missed");
}

pub fn log_compaction_complete(cells: usize, end: usize, duration_us: u64) {
    info!(
        event = "compaction_complete",
        cells,
        end_offset = end,
        duration_us,
        "segment compacted"
    );
}
