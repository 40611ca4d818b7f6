//! Protocol-conformant stand-in for the external analysis worker.
//!
//! Answers `hello`, `get_functions`, `decompile_function` and `stop_server` with canned
//! data. Flags let tests make it misbehave in the ways real workers do.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use workermaster::wm::wire::{self, Action, MAX_MESSAGE_BYTES, Request};

#[derive(Debug, Parser)]
#[command(name = "wm-stub-worker", version, about = "workermaster test worker")]
struct Args {
    #[arg(long)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Binary under "analysis"
    #[arg(long)]
    target: PathBuf,

    /// Suffix of the persisted state next to the target
    #[arg(long, default_value = ".i64")]
    state_suffix: String,

    /// Exit with status 3 instead of serving when the persisted state exists
    #[arg(long)]
    fail_if_state_exists: bool,

    /// Never open the port
    #[arg(long)]
    never_ready: bool,

    /// Wait this long before opening the port
    #[arg(long, default_value_t = 0)]
    ready_delay_ms: u64,

    /// Acknowledge stop_server but keep running
    #[arg(long)]
    ignore_stop: bool,

    /// Swallow SIGTERM
    #[arg(long)]
    ignore_sigterm: bool,

    /// Close analysis requests without answering
    #[arg(long)]
    drop_requests: bool,

    /// Answer analysis requests with bytes that are not JSON
    #[arg(long)]
    garbage_replies: bool,

    /// Append one line per launch to this file
    #[arg(long)]
    launch_log: Option<PathBuf>,
}

fn record_launch(args: &Args) -> std::io::Result<()> {
    let Some(path) = &args.launch_log else {
        return Ok(());
    };
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        f,
        "pid={} port={} target={}",
        std::process::id(),
        args.port,
        args.target.display()
    )
}

fn state_path(args: &Args) -> PathBuf {
    let mut s = args.target.as_os_str().to_os_string();
    s.push(&args.state_suffix);
    PathBuf::from(s)
}

fn respond(args: &Args, req: &Request) -> (Value, bool) {
    match req.action {
        Action::Hello => (json!({"success": true, "message": "hi"}), false),
        Action::GetFunctions => (
            json!({
                "success": true,
                "functions": [
                    {"name": "main", "address": "0x401000", "size": 64},
                    {"name": "sub_401040", "address": "0x401040", "size": 32}
                ]
            }),
            false,
        ),
        Action::DecompileFunction => {
            match req.address.as_deref().and_then(wire::parse_address) {
                Some(0x401000) => (
                    json!({
                        "success": true,
                        "function": {
                            "name": "main",
                            "address": "0x401000",
                            "start_addr": "0x401000",
                            "end_addr": "0x401040",
                            "size": 64,
                            "decompiled_code": format!(
                                "// {}\nint __cdecl main(int argc, const char **argv)\n{{\n  if ( argc > 1 )\n  {{\n    return 1;\n  }}\n  return 0;\n}}\n",
                                args.target.display()
                            )
                        }
                    }),
                    false,
                ),
                // Real workers report lookup failures without a success flag.
                Some(a) => (json!({"error": format!("no function at 0x{a:x}")}), false),
                None => (json!({"error": "bad address"}), false),
            }
        }
        Action::StopServer => (
            json!({"success": true, "message": "stopping"}),
            !args.ignore_stop,
        ),
        Action::Status => (json!({"error": "unknown action: status"}), false),
    }
}

/// Installing a handler replaces the default disposition.
#[cfg(unix)]
fn swallow_sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            eprintln!("ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn swallow_sigterm() -> std::io::Result<()> {
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    record_launch(&args)?;

    if args.fail_if_state_exists && state_path(&args).exists() {
        eprintln!("state {} is corrupted", state_path(&args).display());
        std::process::exit(3);
    }

    if args.ignore_sigterm {
        swallow_sigterm()?;
    }

    if args.never_ready {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
    if args.ready_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.ready_delay_ms)).await;
    }

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    loop {
        let (mut stream, _) = listener.accept().await?;
        let req = match wire::read_message(&mut stream, MAX_MESSAGE_BYTES).await {
            Ok(v) => v,
            Err(e) => {
                let _ = wire::write_message(&mut stream, &json!({"error": e.to_string()})).await;
                continue;
            }
        };
        let req: Request = match serde_json::from_value(req) {
            Ok(r) => r,
            Err(e) => {
                let _ = wire::write_message(&mut stream, &json!({"error": e.to_string()})).await;
                continue;
            }
        };
        if matches!(req.action, Action::GetFunctions | Action::DecompileFunction) {
            // Drain the request first so closing sends FIN, not RST.
            if args.drop_requests {
                let _ = stream.read_to_end(&mut Vec::new()).await;
                continue;
            }
            if args.garbage_replies {
                let _ = stream.read_to_end(&mut Vec::new()).await;
                let _ = stream.write_all(b"<html>internal error</html>\n").await;
                let _ = stream.shutdown().await;
                continue;
            }
        }
        let (resp, exit) = respond(&args, &req);
        let _ = wire::write_message(&mut stream, &resp).await;
        if exit {
            return Ok(());
        }
    }
}
