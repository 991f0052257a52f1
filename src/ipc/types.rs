use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;

/// One line of input: `{"id": ..., "method": ..., "params": {...}}`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The selected workspace directory and its open database. Both are `None`
/// until `workspace.select` succeeds.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn(&self) -> Option<&Connection> {
        self.db.as_ref()
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }
}
