use crate::ipc::error::ok;
use crate::ipc::helpers::{
    current_academic_year, db_err, get_optional_i64, get_optional_str, get_required_str,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn list_classes(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.grade,
               c.academic_year,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM results r WHERE r.class_id = c.id) AS result_count
             FROM classes c
             ORDER BY c.grade, c.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "grade": row.get::<_, i64>(2)?,
                "academicYear": row.get::<_, String>(3)?,
                "studentCount": row.get::<_, i64>(4)?,
                "resultCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "classes": classes }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    respond(&req.id, list_classes(conn))
}

fn create_class(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(params, "name")?;
    let grade = get_optional_i64(params, "grade")?
        .ok_or_else(|| HandlerErr::bad_params("missing grade"))?;
    if !(1..=12).contains(&grade) {
        return Err(HandlerErr::bad_params("grade must be between 1 and 12"));
    }
    let academic_year = get_optional_str(params, "academicYear")?.unwrap_or_else(current_academic_year);

    let taken: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE name = ?", [&name], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new("already_exists", "class name already in use")
            .with_details(json!({ "classId": existing })));
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, grade, academic_year) VALUES(?, ?, ?, ?)",
        (&class_id, &name, grade, &academic_year),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;
    tracing::info!(class_id = %class_id, name = %name, "class created");

    Ok(json!({
        "classId": class_id,
        "name": name,
        "grade": grade,
        "academicYear": academic_year,
    }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(&req.id, create_class(state, &req.params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        _ => None,
    }
}
