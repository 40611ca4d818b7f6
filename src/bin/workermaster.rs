use clap::Parser;
use workermaster::wm::{cli, config, daemon, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    let cfg = config::load_master_config(args.config.as_deref())?;

    let mut log = logging::LogConfig::from_config(&cfg.logging).with_env_overrides();
    if let Some(level) = args.log_level {
        log = log.with_filter(level);
    }
    logging::init(log);

    daemon::run_daemon_async(cfg).await
}
