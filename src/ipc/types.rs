use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::db;

/// One JSON line from the host: `{ id, method, params }`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The open workspace, if any. Handlers that persist need `db`.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Opens (creating if needed) the workspace database and switches to it.
    /// On failure the previous workspace stays selected.
    pub fn open_workspace(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let conn = db::open_db(&path)?;
        self.workspace = Some(path);
        self.db = Some(conn);
        Ok(())
    }
}
