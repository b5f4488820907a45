use crate::ipc::error::ok;
use crate::ipc::helpers::{db_err, get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_MAX_MARKS: f64 = 100.0;

fn list_subjects(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, max_marks FROM subjects ORDER BY code")
        .map_err(db_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "code": row.get::<_, String>(2)?,
                "maxMarks": row.get::<_, f64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };
    respond(&req.id, list_subjects(conn))
}

fn create_subject(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let max_marks = match params.get("maxMarks") {
        None | Some(serde_json::Value::Null) => DEFAULT_MAX_MARKS,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("maxMarks must be a number"))?,
    };
    if !max_marks.is_finite() || max_marks < 1.0 {
        return Err(HandlerErr::bad_params("maxMarks must be at least 1"));
    }

    let taken: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE code = ?", [&code], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new("already_exists", "subject code already in use")
            .with_details(json!({ "subjectId": existing })));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, max_marks) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &code, max_marks),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "subjects" }))
    })?;

    Ok(json!({
        "subjectId": subject_id,
        "name": name,
        "code": code,
        "maxMarks": max_marks,
    }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(&req.id, create_subject(state, &req.params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        _ => None,
    }
}
