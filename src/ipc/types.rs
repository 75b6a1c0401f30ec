use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line from the host process: a caller-chosen id echoed back in
/// the response, a dotted method name, and free-form params.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Per-session state. Both fields stay unset until `workspace.select` opens
/// the bulletin database inside the chosen directory.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
