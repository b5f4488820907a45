mod attendance;
mod config;
mod db;
mod grading;
mod ipc;

use std::io::{self, BufRead, Write};

fn main() {
    let cfg = config::Config::from_env();
    if let Err(e) = config::init_tracing(&cfg) {
        eprintln!("emrsd: logging disabled: {e}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "emrsd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = cfg.workspace.clone() {
        let shown = path.display().to_string();
        match state.open_workspace(path) {
            Ok(()) => tracing::info!(workspace = %shown, "workspace opened from EMRSD_WORKSPACE"),
            Err(e) => tracing::error!(workspace = %shown, error = ?e, "failed to open workspace"),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                let _ = writeln!(stdout, "{}", ipc::bad_json(e.to_string()));
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("emrsd exiting");
}
