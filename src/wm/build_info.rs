//! Build stamp (time, host, git rev) from `build.rs`, shown at daemon boot and in `--version`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_rev: &'static str,
    pub host: &'static str,
    /// As stamped, `epoch:<secs>` unless the build environment supplied something else.
    pub time_raw: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_rev: option_env!("WORKERMASTER_GIT_REV").unwrap_or("unknown"),
            host: option_env!("WORKERMASTER_BUILD_HOST").unwrap_or("unknown"),
            time_raw: option_env!("WORKERMASTER_BUILD_TIME").unwrap_or("unknown"),
        }
    }

    pub fn time_pretty(&self) -> String {
        format_build_time(self.time_raw)
    }
}

/// `epoch:<secs>` as `YYYY-MM-DD HH:MM:SS UTC`; anything else is passed through.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("epoch:")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn banner() -> String {
    let b = BuildInfo::current();
    format!(
        "workermaster {} rev {} (built on {} at {})",
        b.version,
        b.git_rev,
        b.host,
        b.time_pretty()
    )
}

/// Long `--version` text for clap.
pub fn long_version() -> &'static str {
    static LONG: OnceLock<String> = OnceLock::new();
    LONG.get_or_init(|| {
        let b = BuildInfo::current();
        format!(
            "{} (rev {})\nbuilt on {} at {}",
            b.version,
            b.git_rev,
            b.host,
            b.time_pretty()
        )
    })
}
