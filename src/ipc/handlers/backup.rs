use crate::backup;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn required_path(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn handle_export_workspace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = required_path(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = state.workspace_path().map(PathBuf::from) else {
        return HandlerErr::no_workspace().response(&req.id);
    };

    match backup::export_workspace_bundle(&workspace_path, &out_path) {
        Ok(summary) => {
            log::info!(
                "workspace exported to {} ({} bytes)",
                out_path.to_string_lossy(),
                summary.db_bytes
            );
            ok(
                &req.id,
                json!({
                    "path": out_path.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "dbSha256": summary.db_sha256,
                    "dbBytes": summary.db_bytes
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "backup_failed",
            format!("{e:#}"),
            Some(json!({ "path": out_path.to_string_lossy() })),
        ),
    }
}

fn handle_import_workspace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = required_path(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace_path) = state.workspace_path().map(PathBuf::from) else {
        return HandlerErr::no_workspace().response(&req.id);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // The open handle must be dropped before the database file is replaced.
    state.db = None;
    let import = backup::import_workspace_bundle(&in_path, &workspace_path);
    // Reopen whichever database is now in place, even after a failed import.
    let reopened = open_workspace(state, &workspace_path);

    match (import, reopened) {
        (Ok(summary), Ok(())) => {
            log::info!(
                "workspace imported from {} ({})",
                in_path.to_string_lossy(),
                summary.bundle_format_detected
            );
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": summary.bundle_format_detected
                }),
            )
        }
        (Err(e), _) => err(
            &req.id,
            "backup_failed",
            format!("{e:#}"),
            Some(json!({ "path": in_path.to_string_lossy() })),
        ),
        (Ok(_), Err(e)) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspace" => Some(handle_export_workspace(state, req)),
        "backup.importWorkspace" => Some(handle_import_workspace(state, req)),
        _ => None,
    }
}
