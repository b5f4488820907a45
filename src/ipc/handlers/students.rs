use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_optional_i64, get_optional_str, get_required_str, require_db, respond, row_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn list_students(conn: &Connection, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    if !row_exists(conn, "classes", class_id)? {
        return Err(HandlerErr::not_found("class"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, name, student_no, roll_number, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "studentNo": row.get::<_, Option<String>>(2)?,
                "rollNumber": row.get::<_, Option<i64>>(3)?,
                "sortOrder": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    respond(&req.id, list_students(conn, &class_id))
}

fn create_student(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    let student_no = get_optional_str(params, "studentNo")?;
    let roll_number = get_optional_i64(params, "rollNumber")?;
    if roll_number.is_some_and(|n| n < 1) {
        return Err(HandlerErr::bad_params("rollNumber must be positive"));
    }
    if !row_exists(conn, "classes", &class_id)? {
        return Err(HandlerErr::not_found("class"));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, name, student_no, roll_number, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &class_id, &name, &student_no, roll_number, sort_order),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "classId": class_id,
        "name": name,
        "sortOrder": sort_order,
    }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(&req.id, create_student(state, &req.params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        _ => None,
    }
}
