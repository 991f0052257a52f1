mod backup;
mod calc;
mod config;
mod db;
mod ipc;
mod rollup;

use config::RuntimeConfig;
use serde_json::json;
use std::io::{self, BufRead, Write};

fn init_logging(cfg: &RuntimeConfig) {
    // stdout carries the protocol; logs go to stderr.
    env_logger::Builder::new()
        .parse_filters(&cfg.log_filter)
        .target(env_logger::Target::Stderr)
        .init();
}

fn main() {
    let cfg = RuntimeConfig::from_env();
    init_logging(&cfg);
    log::info!("asistenciad {} starting", env!("CARGO_PKG_VERSION"));

    let mut state = ipc::AppState::new();
    if let Some(path) = cfg.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            log::error!("failed to open workspace {}: {:#}", path.to_string_lossy(), e);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::error!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                log::warn!("malformed request line: {}", e);
                json!({
                    "id": null,
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };

        let text = serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        if writeln!(stdout, "{}", text).and_then(|_| stdout.flush()).is_err() {
            log::error!("stdout closed; exiting");
            break;
        }
    }
    log::info!("asistenciad exiting");
}
