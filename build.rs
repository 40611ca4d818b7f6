use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trimmed stdout of a successful command, if any.
fn capture(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn stamp_time() -> String {
    if let Ok(sde) = env::var("SOURCE_DATE_EPOCH") {
        return format!("epoch:{}", sde.trim());
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("epoch:{secs}")
}

fn stamp_host() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|k| env::var(k).ok())
        .find(|s| !s.trim().is_empty())
        .or_else(|| capture("hostname", &[]))
        .unwrap_or_else(|| "unknown".into())
}

fn stamp_rev() -> String {
    capture("git", &["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".into())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    for (key, value) in [
        ("WORKERMASTER_BUILD_TIME", stamp_time()),
        ("WORKERMASTER_BUILD_HOST", stamp_host()),
        ("WORKERMASTER_GIT_REV", stamp_rev()),
    ] {
        println!("cargo:rustc-env={key}={value}");
    }
}
