use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when `-c` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "workermaster.yaml";

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub control: ControlConfig,
    pub workers: WorkersConfig,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
    /// File this config was loaded from (None when running on built-in defaults).
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Written by `wmctl start`, consulted by `wmctl stop` for the OS-level fallback.
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkersConfig {
    pub host: String,
    pub port_base: u16,
    pub port_count: u16,
    pub max_processes: usize,
    /// Worker executable. Falls back to `$IDAPATH` when unset.
    pub program: Option<PathBuf>,
    /// Argument template; `{port}`, `{target}` and `{script}` are substituted per element.
    pub args: Vec<String>,
    pub script: Option<PathBuf>,
    /// Suffix of the per-target persisted analysis state (`<target><suffix>`).
    pub state_suffix: String,
    /// When set, worker stdout/stderr go to `<log_dir>/worker-<port>.log`.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub startup: Duration,
    pub probe_interval: Duration,
    pub probe_connect: Duration,
    pub request: Duration,
    pub control_request: Duration,
    pub stop_request: Duration,
    pub stop_grace: Duration,
    pub term_wait: Duration,
    pub release_attempts: u32,
    pub release_interval: Duration,
    pub reservation_ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<PathBuf>,
}

impl WorkersConfig {
    /// Inclusive bounds of the worker port range.
    pub fn port_range(&self) -> (u16, u16) {
        let last = self.port_base as u32 + self.port_count.max(1) as u32 - 1;
        (self.port_base, last.min(u16::MAX as u32) as u16)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig {
                host: default_host(),
                port: default_control_port(),
                pid_file: default_pid_file(),
            },
            workers: WorkersConfig {
                host: default_host(),
                port_base: default_port_base(),
                port_count: default_max_processes() as u16,
                max_processes: default_max_processes(),
                program: None,
                args: default_worker_args(),
                script: None,
                state_suffix: default_state_suffix(),
                log_dir: None,
            },
            timeouts: Timeouts {
                startup: Duration::from_secs(30),
                probe_interval: Duration::from_millis(500),
                probe_connect: Duration::from_secs(1),
                request: Duration::from_secs(10),
                control_request: Duration::from_secs(30),
                stop_request: Duration::from_secs(5),
                stop_grace: Duration::from_secs(2),
                term_wait: Duration::from_secs(5),
                release_attempts: 10,
                release_interval: Duration::from_secs(1),
                reservation_ttl: Duration::from_secs(60),
            },
            logging: LoggingConfig::default(),
            source: None,
        }
    }
}

// -------- YAML file schema (grouped, strict) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    control: Option<ControlConfigFile>,
    #[serde(default)]
    workers: Option<WorkersConfigFile>,
    #[serde(default)]
    timeouts: Option<TimeoutsFile>,
    #[serde(default)]
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlConfigFile {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_control_port")]
    port: u16,
    #[serde(default = "default_pid_file")]
    pid_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkersConfigFile {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port_base")]
    port_base: u16,
    #[serde(default)]
    port_count: Option<u16>,
    #[serde(default = "default_max_processes")]
    max_processes: usize,
    #[serde(default)]
    program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    args: Vec<String>,
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default = "default_state_suffix")]
    state_suffix: String,
    #[serde(default)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsFile {
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    startup: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    probe_interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    probe_connect: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    request: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    control_request: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    stop_request: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    stop_grace: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    term_wait: Option<Duration>,
    #[serde(default)]
    release_attempts: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    release_interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    reservation_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingConfigFile {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    6001
}
fn default_pid_file() -> PathBuf {
    "workermaster.pid".into()
}
fn default_port_base() -> u16 {
    7001
}
fn default_max_processes() -> usize {
    2
}
fn default_worker_args() -> Vec<String> {
    vec![
        "-A".to_string(),
        "-B".to_string(),
        "-S{script} {port}".to_string(),
        "-Lida_server.log".to_string(),
        "{target}".to_string(),
    ]
}
fn default_state_suffix() -> String {
    ".i64".to_string()
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Number(n)) => n
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        Some(serde_yaml::Value::String(s)) => parse_duration_str(&s)
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(D::Error::custom),
        Some(_) => Err(D::Error::custom(
            "duration must be integer milliseconds or a string like \"500ms\" or \"30s\"",
        )),
    }
}

/// Parse `1500`, `1500ms`, `30s`, `2m` or `1h` into milliseconds.
pub fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number {num_s:?}: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

/// Load the master config.
///
/// With an explicit path the file must exist. Without one, `workermaster.yaml` in the
/// working directory is used when present, otherwise the built-in defaults.
pub fn load_master_config(config_path: Option<&Path>) -> anyhow::Result<MasterConfig> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !p.exists() {
                let mut cfg = MasterConfig::default();
                apply_env_fallbacks(&mut cfg);
                validate(&cfg)?;
                return Ok(cfg);
            }
            p
        }
    };
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    let mut cfg = parse_master_config(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e:#}", path.display()))?;

    // Resolve relative paths against the config file directory.
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_relative(&mut cfg, base);
    cfg.source = Some(path.clone());
    apply_env_fallbacks(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// Parse a YAML document onto the defaults. Paths stay as written.
pub fn parse_master_config(raw: &str) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = if raw.trim().is_empty() {
        MasterConfigFile::default()
    } else {
        serde_yaml::from_str(raw)?
    };

    let mut cfg = MasterConfig::default();

    if let Some(c) = file_cfg.control {
        cfg.control.host = c.host;
        cfg.control.port = c.port;
        cfg.control.pid_file = c.pid_file;
    }
    if let Some(w) = file_cfg.workers {
        cfg.workers.host = w.host;
        cfg.workers.port_base = w.port_base;
        cfg.workers.max_processes = w.max_processes;
        // The range defaults to exactly one port per allowed worker.
        cfg.workers.port_count = match w.port_count {
            Some(n) => n,
            None => u16::try_from(w.max_processes).map_err(|_| {
                anyhow::anyhow!("workers.max_processes {} is too large", w.max_processes)
            })?,
        };
        cfg.workers.program = w.program;
        cfg.workers.args = w.args;
        cfg.workers.script = w.script;
        cfg.workers.state_suffix = w.state_suffix;
        cfg.workers.log_dir = w.log_dir;
    }
    if let Some(t) = file_cfg.timeouts {
        let d = &mut cfg.timeouts;
        d.startup = t.startup.unwrap_or(d.startup);
        d.probe_interval = t.probe_interval.unwrap_or(d.probe_interval);
        d.probe_connect = t.probe_connect.unwrap_or(d.probe_connect);
        d.request = t.request.unwrap_or(d.request);
        d.control_request = t.control_request.unwrap_or(d.control_request);
        d.stop_request = t.stop_request.unwrap_or(d.stop_request);
        d.stop_grace = t.stop_grace.unwrap_or(d.stop_grace);
        d.term_wait = t.term_wait.unwrap_or(d.term_wait);
        d.release_attempts = t.release_attempts.unwrap_or(d.release_attempts);
        d.release_interval = t.release_interval.unwrap_or(d.release_interval);
        d.reservation_ttl = t.reservation_ttl.unwrap_or(d.reservation_ttl);
    }
    if let Some(l) = file_cfg.logging {
        cfg.logging.level = l.level;
        cfg.logging.format = l.format;
        cfg.logging.file = l.file;
    }
    Ok(cfg)
}

fn resolve_relative(cfg: &mut MasterConfig, base: &Path) {
    if cfg.control.pid_file.is_relative() {
        cfg.control.pid_file = base.join(&cfg.control.pid_file);
    }
    if let Some(p) = cfg.workers.script.clone() {
        if p.is_relative() {
            cfg.workers.script = Some(base.join(p));
        }
    }
    if let Some(p) = cfg.workers.log_dir.clone() {
        if p.is_relative() {
            cfg.workers.log_dir = Some(base.join(p));
        }
    }
    if let Some(p) = cfg.logging.file.clone() {
        if p.is_relative() {
            cfg.logging.file = Some(base.join(p));
        }
    }
    // `program` is left alone: a bare name is resolved through $PATH at spawn time.
}

fn apply_env_fallbacks(cfg: &mut MasterConfig) {
    if cfg.workers.program.is_none() {
        if let Ok(v) = std::env::var("IDAPATH") {
            let t = v.trim();
            if !t.is_empty() {
                cfg.workers.program = Some(PathBuf::from(t));
            }
        }
    }
}

/// Structural checks shared by the daemon and the ctl.
pub fn validate(cfg: &MasterConfig) -> anyhow::Result<()> {
    let w = &cfg.workers;
    anyhow::ensure!(w.max_processes >= 1, "workers.max_processes must be at least 1");
    anyhow::ensure!(w.port_count >= 1, "workers.port_count must be at least 1");
    anyhow::ensure!(
        w.port_base as u32 + w.port_count as u32 - 1 <= u16::MAX as u32,
        "workers.port_base {} + port_count {} exceeds 65535",
        w.port_base,
        w.port_count
    );
    let (first, last) = w.port_range();
    anyhow::ensure!(
        !(first..=last).contains(&cfg.control.port),
        "control.port {} overlaps the worker port range {first}-{last}",
        cfg.control.port
    );
    anyhow::ensure!(!w.state_suffix.is_empty(), "workers.state_suffix must not be empty");
    anyhow::ensure!(!w.args.is_empty(), "workers.args must not be empty");
    anyhow::ensure!(
        w.args.iter().any(|a| a.contains("{port}")),
        "workers.args must pass the worker port (no element contains {{port}})"
    );
    anyhow::ensure!(
        cfg.timeouts.probe_interval > Duration::ZERO,
        "timeouts.probe_interval must be greater than zero"
    );
    anyhow::ensure!(
        cfg.timeouts.release_attempts >= 1,
        "timeouts.release_attempts must be at least 1"
    );
    Ok(())
}

/// Checks only the daemon needs (the ctl never launches workers).
pub fn validate_for_daemon(cfg: &MasterConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        cfg.workers.program.is_some(),
        "no worker program configured: set workers.program or the IDAPATH environment variable"
    );
    if cfg.workers.args.iter().any(|a| a.contains("{script}")) {
        anyhow::ensure!(
            cfg.workers.script.is_some(),
            "workers.args references {{script}} but workers.script is not set"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.control.port, 6001);
        assert_eq!(cfg.workers.port_range(), (7001, 7002));
        assert_eq!(cfg.workers.max_processes, 2);
        assert_eq!(cfg.timeouts.startup, Duration::from_secs(30));
        assert_eq!(cfg.timeouts.reservation_ttl, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.release_attempts, 10);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_port_count_follows_max_processes() {
        let cfg = parse_master_config("workers:\n  port_base: 9000\n  max_processes: 5\n").unwrap();
        assert_eq!(cfg.workers.port_range(), (9000, 9004));

        let cfg = parse_master_config(
            "workers:\n  port_base: 9000\n  max_processes: 2\n  port_count: 10\n",
        )
        .unwrap();
        assert_eq!(cfg.workers.port_range(), (9000, 9009));
    }

    #[test]
    fn test_durations_accept_units_and_integers() {
        let cfg = parse_master_config(
            "timeouts:\n  startup: 5s\n  probe_interval: 100\n  stop_grace: 250ms\n  reservation_ttl: 1m\n",
        )
        .unwrap();
        assert_eq!(cfg.timeouts.startup, Duration::from_secs(5));
        assert_eq!(cfg.timeouts.probe_interval, Duration::from_millis(100));
        assert_eq!(cfg.timeouts.stop_grace, Duration::from_millis(250));
        assert_eq!(cfg.timeouts.reservation_ttl, Duration::from_secs(60));
        // untouched keys keep their defaults
        assert_eq!(cfg.timeouts.term_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_str() {
        assert_eq!(parse_duration_str("1500"), Ok(1500));
        assert_eq!(parse_duration_str("1.5s"), Ok(1500));
        assert_eq!(parse_duration_str("2h"), Ok(7_200_000));
        assert!(parse_duration_str("").is_err());
        assert!(parse_duration_str("ms").is_err());
        assert!(parse_duration_str("3d").is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = parse_master_config("workers:\n  max_procs: 3\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_procs"));
    }

    #[test]
    fn test_control_port_inside_worker_range_rejected() {
        let cfg = parse_master_config(
            "control:\n  port: 7002\nworkers:\n  port_base: 7001\n  max_processes: 4\n",
        )
        .unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_args_must_carry_port() {
        let cfg = parse_master_config("workers:\n  args: [\"{target}\"]\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_daemon_requires_program_and_script() {
        let mut cfg = MasterConfig::default();
        cfg.workers.program = None;
        assert!(validate_for_daemon(&cfg).is_err());

        cfg.workers.program = Some(PathBuf::from("/opt/ida/idat"));
        assert!(validate_for_daemon(&cfg).unwrap_err().to_string().contains("script"));

        cfg.workers.script = Some(PathBuf::from("/opt/ida/server.py"));
        assert!(validate_for_daemon(&cfg).is_ok());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "control:\n  pid_file: run/wm.pid\nworkers:\n  program: /usr/bin/true\n  script: scripts/server.py\n"
        )
        .unwrap();

        let cfg = load_master_config(Some(&path)).unwrap();
        assert_eq!(cfg.control.pid_file, dir.path().join("run/wm.pid"));
        assert_eq!(cfg.workers.script, Some(dir.path().join("scripts/server.py")));
        assert_eq!(cfg.workers.program, Some(PathBuf::from("/usr/bin/true")));
        assert_eq!(cfg.source, Some(path));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_master_config(Some(&dir.path().join("missing.yaml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
