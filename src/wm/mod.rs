pub mod build_info;
pub mod cli;
pub mod config;
pub mod ctl;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod ports;
pub mod proc;
pub mod reclaim;
pub mod retry;
pub mod spawn;
pub mod supervisor;
pub mod wire;
