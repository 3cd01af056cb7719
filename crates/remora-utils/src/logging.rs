//! # Logging Utilities
//!
//! Subscriber setup for hosts of `remora-core`.
//!
//! `remora-core` logs attach/detach and suspend transitions at `debug`, class registration
//! and candidate matches at `debug`, and per-read detail at `trace`. Hosts call one of the
//! `init_*` functions once at startup and keep the returned [`LoggingGuard`] alive until
//! exit; dropping it flushes buffered file output.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g. `RUST_LOG=debug`, `RUST_LOG=remora_core::session=trace`)
//! - `REMORA_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
//! - `REMORA_LOG_FILE`: also write to this file, rotated daily (default: console only)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use remora_utils::init_logging;
//!
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("host started");
//! ```
//!
//! ## Examples
//!
//! ```rust,no_run
//! use remora_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! // Structured output for a log collector
//! let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Json).expect("Failed to initialize logging");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines with ANSI colors on the console
    #[default]
    Pretty,
    /// One JSON object per event, including the current span list
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" | "dev" => Ok(LogFormat::Pretty),
            "json" | "prod" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    /// Every foreign read and write
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Resolved logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings
{
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
    /// Daily-rotated log file, in addition to (or instead of) the console.
    pub file: Option<PathBuf>,
    pub console: bool,
}

impl Default for LogSettings
{
    fn default() -> Self
    {
        Self {
            format: LogFormat::Pretty,
            filter: Level::INFO.to_string(),
            file: None,
            console: true,
        }
    }
}

impl LogSettings
{
    /// Settings from `REMORA_LOG_FORMAT`, `RUST_LOG` and `REMORA_LOG_FILE`
    pub fn from_env() -> Self
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let defaults = Self::default();
        Self {
            format: lookup("REMORA_LOG_FORMAT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            filter: filter_directives(lookup("RUST_LOG").as_deref(), Level::INFO),
            file: lookup("REMORA_LOG_FILE")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            console: true,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.filter = Level::from(level).to_string();
        self
    }

    /// Install these settings as the global subscriber
    ///
    /// ## Errors
    ///
    /// - [`LoggingError::InitializationFailed`] if a global subscriber is already set
    /// - [`LoggingError::FileError`] if the log directory cannot be created
    pub fn init(self) -> Result<LoggingGuard, LoggingError>
    {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guards = Vec::new();

        if self.console {
            layers.push(format_layer(self.format, io::stdout, true, EnvFilter::new(&self.filter)));
        }
        if let Some(path) = &self.file {
            let (directory, file_name) = split_log_path(path)?;
            fs::create_dir_all(&directory)?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            layers.push(format_layer(self.format, writer, false, EnvFilter::new(&self.filter)));
        }

        Registry::default()
            .with(layers)
            .try_init()
            .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
        Ok(LoggingGuard { _workers: guards })
    }
}

/// Keeps the background file writers running
///
/// Dropping the guard flushes whatever is still buffered.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard
{
    _workers: Vec<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// See [`LogSettings::init`].
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    LogSettings::from_env().init()
}

/// Initialize logging with an explicit level and format
///
/// `REMORA_LOG_FILE` is still honored.
///
/// ## Errors
///
/// See [`LogSettings::init`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    LogSettings {
        format,
        ..LogSettings::from_env()
    }
    .with_level(level)
    .init()
}

/// Initialize logging to a file only, leaving stdout to the host
///
/// With no `path`, logs go to `~/.remora/YYYY-MM-DD-remora.log` (or the temp directory when
/// `HOME` is unset). Returns the file used along with the guard.
///
/// ## Errors
///
/// See [`LogSettings::init`].
pub fn init_logging_file_only(
    path: Option<PathBuf>,
    level: Option<LogLevel>,
) -> Result<(PathBuf, LoggingGuard), LoggingError>
{
    let file = path.unwrap_or_else(default_log_file);
    let mut settings = LogSettings {
        file: Some(file.clone()),
        console: false,
        ..LogSettings::from_env()
    };
    if let Some(level) = level {
        settings = settings.with_level(level);
    }
    Ok((file, settings.init()?))
}

fn default_log_file() -> PathBuf
{
    let today = Utc::now().format("%Y-%m-%d");
    let directory = env::var_os("HOME").map_or_else(env::temp_dir, |home| PathBuf::from(home).join(".remora"));
    directory.join(format!("{today}-remora.log"))
}

/// `RUST_LOG` if it parses as filter directives, the default level otherwise
fn filter_directives(rust_log: Option<&str>, default: Level) -> String
{
    match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() && EnvFilter::try_new(directives).is_ok() => directives.to_string(),
        _ => default.to_string(),
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError>
{
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.to_path_buf()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);

    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// The log path has no file name component
    #[error("Invalid log file path: {}", .0.display())]
    InvalidFile(PathBuf),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!(matches!("xml".parse::<LogFormat>(), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert!(matches!("loud".parse::<LogLevel>(), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_settings_from_lookup()
    {
        let vars: HashMap<&str, &str> = [
            ("REMORA_LOG_FORMAT", "json"),
            ("RUST_LOG", "remora_core::session=trace"),
            ("REMORA_LOG_FILE", "/var/log/remora/host.log"),
        ]
        .into_iter()
        .collect();
        let settings = LogSettings::from_lookup(|key| vars.get(key).map(|v| (*v).to_string()));
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.filter, "remora_core::session=trace");
        assert_eq!(settings.file, Some(PathBuf::from("/var/log/remora/host.log")));

        let defaults = LogSettings::from_lookup(|_| None);
        assert_eq!(defaults, LogSettings::default());
    }

    #[test]
    fn test_filter_fallback()
    {
        assert_eq!(filter_directives(None, Level::INFO), "INFO");
        assert_eq!(filter_directives(Some("  "), Level::WARN), "WARN");
        assert_eq!(filter_directives(Some("debug"), Level::INFO), "debug");
        assert_eq!(filter_directives(Some("remora_core=loudest"), Level::INFO), "INFO");
    }

    #[test]
    fn test_split_log_path()
    {
        let (dir, name) = split_log_path(Path::new("remora.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, PathBuf::from("remora.log"));
        assert!(matches!(split_log_path(Path::new("/")), Err(LoggingError::InvalidFile(_))));
    }

    #[test]
    fn test_second_init_is_an_error()
    {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings {
            file: Some(dir.path().join("test.log")),
            console: false,
            ..LogSettings::default()
        };
        let _first = settings.clone().init();
        assert!(matches!(settings.init(), Err(LoggingError::InitializationFailed(_))));
    }
}
