//! Logging setup for the daemon and the ctl.
//!
//! # Environment Variables
//!
//! - `WM_LOG` - Log filter (overrides `RUST_LOG`)
//! - `WM_LOG_FORMAT` - Output format: pretty, compact, json
//! - `WM_LOG_FILE` - Path to a log file (written in addition to stderr)
//! - `RUST_LOG` - Standard filter (fallback)
//!
//! Precedence: environment, then the `logging` section of the config file, then defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::wm::config::LoggingConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format {s:?} (valid: pretty, compact, json)"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file (None = stderr only).
    pub file_path: Option<PathBuf>,
    /// Full filter directive; wins over `level` when set.
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            file_path: None,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the `logging` section of the config file.
    ///
    /// Invalid values are reported on stderr and ignored; logging is not up yet at this point.
    pub fn from_config(cfg: &LoggingConfig) -> Self {
        let mut out = Self::default();
        if let Some(level) = cfg.level.as_deref() {
            match parse_level(level) {
                Some(l) => out.level = l,
                // Accept full directives such as "workermaster=debug,info".
                None => out.filter = Some(level.to_string()),
            }
        }
        if let Some(fmt) = cfg.format.as_deref() {
            match fmt.parse() {
                Ok(f) => out.format = f,
                Err(e) => eprintln!("warning: logging.format: {e}"),
            }
        }
        out.file_path = cfg.file.clone();
        out
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply `WM_LOG`/`RUST_LOG`, `WM_LOG_FORMAT` and `WM_LOG_FILE`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = std::env::var("WM_LOG") {
            self.filter = Some(filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            self.filter = Some(filter);
        }

        if let Ok(format) = std::env::var("WM_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.format = f;
            }
        }

        if let Ok(path) = std::env::var("WM_LOG_FILE") {
            if !path.trim().is_empty() {
                self.file_path = Some(PathBuf::from(path));
            }
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("warning: invalid log filter {filter:?}, using default");
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn stderr_layer(config: &LogConfig) -> BoxedLayer {
    let base = fmt::layer()
        .with_target(config.show_target)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.boxed(),
    }
}

fn file_layer(config: &LogConfig, path: &Path) -> BoxedLayer {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workermaster.log");
    let appender = tracing_appender::rolling::never(parent, file_name);
    let base = fmt::layer()
        .with_target(config.show_target)
        .with_ansi(false)
        .with_writer(appender);
    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.boxed(),
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(&config)];
    if let Some(path) = config.file_path.as_deref() {
        layers.push(file_layer(&config, path));
    }
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
