use crate::attendance::{attendance_summary, AttendanceStatus};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_date, get_required_str, now_timestamp, require_db,
    respond, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_status(params: &serde_json::Value) -> Result<AttendanceStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    AttendanceStatus::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("unknown status: {}", raw)).with_details(json!({
            "allowed": ["present", "absent", "late", "sick", "excused"]
        }))
    })
}

/// One record per student per day; marking again overwrites it.
fn mark_attendance(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?.format("%Y-%m-%d").to_string();
    let status = parse_status(params)?;
    let remarks = get_optional_str(params, "remarks")?;

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(student_class) = student_class else {
        return Err(HandlerErr::not_found("student"));
    };
    // Defaults to the student's own class so class day views see the record.
    let class_id = match get_optional_str(params, "classId")? {
        Some(cid) => {
            if !row_exists(conn, "classes", &cid)? {
                return Err(HandlerErr::not_found("class"));
            }
            cid
        }
        None => student_class,
    };

    conn.execute(
        "INSERT INTO attendance(id, student_id, class_id, date, status, remarks, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           class_id = excluded.class_id,
           status = excluded.status,
           remarks = excluded.remarks,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &class_id,
            &date,
            status.as_str(),
            &remarks,
            now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "attendance" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "classId": class_id,
        "date": date,
        "status": status,
    }))
}

fn summarize_attendance(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let start = get_required_date(params, "startDate")?;
    let end = get_required_date(params, "endDate")?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    if !row_exists(conn, "students", &student_id)? {
        return Err(HandlerErr::not_found("student"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance
             WHERE student_id = ? AND date >= ? AND date <= ?
             ORDER BY date",
        )
        .map_err(db_err("db_query_failed"))?;
    let statuses = stmt
        .query_map(
            (
                &student_id,
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string(),
            ),
            |r| r.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    // Rows are only ever written through parse_status, so unknown values are skipped.
    let summary = attendance_summary(statuses.iter().filter_map(|s| AttendanceStatus::parse(s)));
    Ok(json!({
        "studentId": student_id,
        "startDate": start.format("%Y-%m-%d").to_string(),
        "endDate": end.format("%Y-%m-%d").to_string(),
        "summary": summary,
    }))
}

/// Every record marked for a class on one day, in roster order.
fn class_day(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_date(params, "date")?.format("%Y-%m-%d").to_string();
    if !row_exists(conn, "classes", &class_id)? {
        return Err(HandlerErr::not_found("class"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, s.name, s.student_no, s.roll_number, a.status, a.remarks
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE a.class_id = ? AND a.date = ?
             ORDER BY s.sort_order, s.rowid",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((&class_id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<i64>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut statuses = Vec::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());
    for (student_id, name, student_no, roll_number, status, remarks) in rows {
        let Some(status) = AttendanceStatus::parse(&status) else {
            continue;
        };
        statuses.push(status);
        records.push(json!({
            "studentId": student_id,
            "name": name,
            "studentNo": student_no,
            "rollNumber": roll_number,
            "status": status,
            "remarks": remarks,
        }));
    }

    Ok(json!({
        "classId": class_id,
        "date": date,
        "records": records,
        "summary": attendance_summary(statuses),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "attendance.mark" => mark_attendance(state, &req.params),
        "attendance.summary" => summarize_attendance(state, &req.params),
        "attendance.classDay" => class_day(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
