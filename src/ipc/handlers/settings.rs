use crate::db;
use crate::grading::TiePolicy;
use crate::ipc::helpers::{get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const RANKING_KEY: &str = "ranking";

/// Workspace default used when `results.rankCohort` gets no `tiePolicy`.
pub fn ranking_tie_policy(conn: &Connection) -> Result<TiePolicy, HandlerErr> {
    let stored = db::settings_get_json(conn, RANKING_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let policy = stored
        .as_ref()
        .and_then(|v| v.get("tiePolicy"))
        .and_then(|v| v.as_str())
        .and_then(TiePolicy::parse)
        .unwrap_or_default();
    Ok(policy)
}

fn get_ranking(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let policy = ranking_tie_policy(conn)?;
    Ok(json!({ "tiePolicy": policy }))
}

fn set_ranking(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let raw = get_required_str(params, "tiePolicy")?;
    let Some(policy) = TiePolicy::parse(&raw) else {
        return Err(HandlerErr::bad_params(format!("unknown tiePolicy: {}", raw))
            .with_details(json!({ "allowed": ["sequential", "competition", "dense"] })));
    };
    db::settings_set_json(conn, RANKING_KEY, &json!({ "tiePolicy": policy.as_str() }))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(tie_policy = policy.as_str(), "ranking tie policy updated");
    Ok(json!({ "tiePolicy": policy }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "settings.getRanking" => get_ranking(state),
        "settings.setRanking" => set_ranking(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
