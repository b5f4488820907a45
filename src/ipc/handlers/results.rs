use crate::attendance::attendance_percentage;
use crate::grading::{self, GradedResult, SubjectScore, TiePolicy};
use crate::ipc::error::ok;
use crate::ipc::handlers::settings::ranking_tie_policy;
use crate::ipc::helpers::{
    db_err, get_optional_bool, get_optional_str, get_required_date, get_required_str,
    now_timestamp, require_db, respond, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const EXAM_TYPES: [&str; 6] = [
    "unit_test",
    "mid_term",
    "final_term",
    "annual",
    "entrance",
    "competitive",
];

const CONDUCT_GRADES: [&str; 5] = [
    "Excellent",
    "Very Good",
    "Good",
    "Satisfactory",
    "Needs Improvement",
];

const DEFAULT_CONDUCT_GRADE: &str = "Good";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectInput {
    subject_id: String,
    marks_obtained: f64,
    /// Falls back to the subject's configured maximum.
    #[serde(default)]
    max_marks: Option<f64>,
    #[serde(default)]
    remarks: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Extracurricular {
    #[serde(default)]
    sports: Option<String>,
    #[serde(default)]
    arts: Option<String>,
    #[serde(default)]
    other: Option<String>,
}

impl Extracurricular {
    fn trimmed(self) -> Self {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        Extracurricular {
            sports: clean(self.sports),
            arts: clean(self.arts),
            other: clean(self.other),
        }
    }
}

/// Report-card fields that sit next to the marks and never affect grading.
#[derive(Debug, Default)]
struct ReportFields {
    remarks: Option<String>,
    teacher_remarks: Option<String>,
    principal_remarks: Option<String>,
    conduct_grade: Option<String>,
    is_promoted: Option<bool>,
    extracurricular: Option<Extracurricular>,
}

impl ReportFields {
    fn is_empty(&self) -> bool {
        self.remarks.is_none()
            && self.teacher_remarks.is_none()
            && self.principal_remarks.is_none()
            && self.conduct_grade.is_none()
            && self.is_promoted.is_none()
            && self.extracurricular.is_none()
    }
}

fn parse_report_fields(params: &serde_json::Value) -> Result<ReportFields, HandlerErr> {
    let conduct_grade = get_optional_str(params, "conductGrade")?;
    if let Some(g) = conduct_grade.as_deref() {
        if !CONDUCT_GRADES.contains(&g) {
            return Err(HandlerErr::bad_params(format!("unknown conductGrade: {}", g))
                .with_details(json!({ "allowed": CONDUCT_GRADES })));
        }
    }
    let extracurricular = match params.get("extracurricular") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<Extracurricular>(v.clone())
                .map_err(|e| HandlerErr::bad_params(format!("invalid extracurricular: {}", e)))?
                .trimmed(),
        ),
    };
    Ok(ReportFields {
        remarks: get_optional_str(params, "remarks")?,
        teacher_remarks: get_optional_str(params, "teacherRemarks")?,
        principal_remarks: get_optional_str(params, "principalRemarks")?,
        conduct_grade,
        is_promoted: get_optional_bool(params, "isPromoted")?,
        extracurricular,
    })
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceInput {
    total_days: u32,
    present_days: u32,
}

fn parse_subject_inputs(params: &serde_json::Value) -> Result<Vec<SubjectInput>, HandlerErr> {
    let raw = params
        .get("subjects")
        .ok_or_else(|| HandlerErr::bad_params("missing subjects"))?;
    if !raw.is_array() {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid subjects: {}", e)))
}

fn parse_exam_type(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let exam_type = get_required_str(params, "examType")?;
    if !EXAM_TYPES.contains(&exam_type.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown examType: {}", exam_type))
            .with_details(json!({ "allowed": EXAM_TYPES })));
    }
    Ok(exam_type)
}

fn parse_tie_policy(params: &serde_json::Value) -> Result<Option<TiePolicy>, HandlerErr> {
    match get_optional_str(params, "tiePolicy")? {
        None => Ok(None),
        Some(raw) => TiePolicy::parse(&raw)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown tiePolicy: {}", raw))),
    }
}

/// Resolves missing `maxMarks` from the subjects table. Without a workspace
/// every entry must carry its own maximum.
fn resolve_scores(
    conn: Option<&Connection>,
    inputs: &[SubjectInput],
) -> Result<Vec<SubjectScore>, HandlerErr> {
    let mut scores = Vec::with_capacity(inputs.len());
    for (index, s) in inputs.iter().enumerate() {
        let max_marks = match (s.max_marks, conn) {
            (Some(m), _) => m,
            (None, Some(conn)) => {
                let configured: Option<f64> = conn
                    .query_row(
                        "SELECT max_marks FROM subjects WHERE id = ?",
                        [&s.subject_id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db_err("db_query_failed"))?;
                configured.ok_or_else(|| {
                    HandlerErr::not_found("subject").with_details(json!({
                        "index": index,
                        "subjectId": s.subject_id,
                    }))
                })?
            }
            (None, None) => {
                return Err(HandlerErr::bad_params(format!(
                    "subjects[{}].maxMarks is required without a workspace",
                    index
                )))
            }
        };
        scores.push(SubjectScore {
            subject_id: s.subject_id.clone(),
            marks_obtained: s.marks_obtained,
            max_marks,
        });
    }
    Ok(scores)
}

fn ensure_subjects_exist(conn: &Connection, inputs: &[SubjectInput]) -> Result<(), HandlerErr> {
    for (index, s) in inputs.iter().enumerate() {
        if !row_exists(conn, "subjects", &s.subject_id)? {
            return Err(HandlerErr::not_found("subject").with_details(json!({
                "index": index,
                "subjectId": s.subject_id,
            })));
        }
    }
    Ok(())
}

fn graded_json(graded: &GradedResult) -> serde_json::Value {
    json!({
        "totalMarks": graded.total_marks,
        "maxTotalMarks": graded.max_total_marks,
        "percentage": graded.percentage,
        "overallGrade": graded.overall_grade,
        "isPass": graded.is_pass(),
        "subjects": graded.subjects,
    })
}

fn insert_subject_rows(
    tx: &rusqlite::Transaction<'_>,
    result_id: &str,
    graded: &GradedResult,
    inputs: &[SubjectInput],
) -> Result<(), HandlerErr> {
    let mut stmt = tx
        .prepare(
            "INSERT INTO result_subjects(
               result_id, sort_order, subject_id, marks_obtained, max_marks, grade, is_pass, remarks
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .map_err(db_err("db_insert_failed"))?;
    for (i, (g, input)) in graded.subjects.iter().zip(inputs).enumerate() {
        stmt.execute((
            result_id,
            i as i64,
            &g.subject_id,
            g.marks_obtained,
            g.max_marks,
            g.grade.as_str(),
            g.is_pass as i64,
            &input.remarks,
        ))
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "result_subjects", "index": i }))
        })?;
    }
    Ok(())
}

fn load_result(conn: &Connection, result_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let head = conn
        .query_row(
            "SELECT student_id, class_id, academic_year, exam_type, exam_name, exam_date,
                    total_marks, max_total_marks, percentage, overall_grade, rank, total_students,
                    remarks, conduct_grade, attendance_total_days, attendance_present_days,
                    attendance_percentage, is_published, published_at, created_at, updated_at,
                    teacher_remarks, principal_remarks, is_promoted, extracurricular_sports,
                    extracurricular_arts, extracurricular_other, published_by
             FROM results WHERE id = ?",
            [result_id],
            |r| {
                Ok(json!({
                    "id": result_id,
                    "studentId": r.get::<_, String>(0)?,
                    "classId": r.get::<_, String>(1)?,
                    "academicYear": r.get::<_, String>(2)?,
                    "examType": r.get::<_, String>(3)?,
                    "examName": r.get::<_, String>(4)?,
                    "examDate": r.get::<_, String>(5)?,
                    "totalMarks": r.get::<_, f64>(6)?,
                    "maxTotalMarks": r.get::<_, f64>(7)?,
                    "percentage": r.get::<_, f64>(8)?,
                    "overallGrade": r.get::<_, String>(9)?,
                    "rank": r.get::<_, Option<i64>>(10)?,
                    "totalStudents": r.get::<_, Option<i64>>(11)?,
                    "remarks": r.get::<_, Option<String>>(12)?,
                    "teacherRemarks": r.get::<_, Option<String>>(21)?,
                    "principalRemarks": r.get::<_, Option<String>>(22)?,
                    "conductGrade": r.get::<_, String>(13)?,
                    "isPromoted": r.get::<_, i64>(23)? != 0,
                    "extracurricular": {
                        "sports": r.get::<_, Option<String>>(24)?,
                        "arts": r.get::<_, Option<String>>(25)?,
                        "other": r.get::<_, Option<String>>(26)?,
                    },
                    "attendance": {
                        "totalDays": r.get::<_, i64>(14)?,
                        "presentDays": r.get::<_, i64>(15)?,
                        "percentage": r.get::<_, f64>(16)?,
                    },
                    "isPublished": r.get::<_, i64>(17)? != 0,
                    "publishedAt": r.get::<_, Option<String>>(18)?,
                    "publishedBy": r.get::<_, Option<String>>(27)?,
                    "createdAt": r.get::<_, String>(19)?,
                    "updatedAt": r.get::<_, String>(20)?,
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(mut head) = head else {
        return Err(HandlerErr::not_found("result"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT rs.subject_id, s.name, s.code, rs.marks_obtained, rs.max_marks,
                    rs.grade, rs.is_pass, rs.remarks
             FROM result_subjects rs
             LEFT JOIN subjects s ON s.id = rs.subject_id
             WHERE rs.result_id = ?
             ORDER BY rs.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([result_id], |r| {
            let marks: f64 = r.get(3)?;
            let max: f64 = r.get(4)?;
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectName": r.get::<_, Option<String>>(1)?,
                "subjectCode": r.get::<_, Option<String>>(2)?,
                "marksObtained": marks,
                "maxMarks": max,
                "percentage": if max > 0.0 { marks / max * 100.0 } else { 0.0 },
                "grade": r.get::<_, String>(5)?,
                "isPass": r.get::<_, i64>(6)? != 0,
                "remarks": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let all_pass = subjects
        .iter()
        .all(|s| s.get("isPass").and_then(|v| v.as_bool()).unwrap_or(false));
    head["isPass"] = json!(all_pass);
    head["subjects"] = json!(subjects);
    Ok(head)
}

fn load_stored_scores(conn: &Connection, result_id: &str) -> Result<Vec<SubjectScore>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_id, marks_obtained, max_marks
             FROM result_subjects
             WHERE result_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let scores = stmt
        .query_map([result_id], |r| {
            Ok(SubjectScore {
                subject_id: r.get(0)?,
                marks_obtained: r.get(1)?,
                max_marks: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(scores)
}

/// Grades without persisting anything.
fn grade_preview(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let inputs = parse_subject_inputs(params)?;
    let scores = resolve_scores(state.db.as_ref(), &inputs)?;
    let graded = grading::grade_result(&scores)?;
    Ok(graded_json(&graded))
}

fn create_result(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let exam_type = parse_exam_type(params)?;
    let exam_name = get_required_str(params, "examName")?;
    let exam_date = get_required_date(params, "examDate")?.format("%Y-%m-%d").to_string();
    let report = parse_report_fields(params)?;
    let conduct_grade = report
        .conduct_grade
        .clone()
        .unwrap_or_else(|| DEFAULT_CONDUCT_GRADE.to_string());
    let extracurricular = report.extracurricular.clone().unwrap_or_default();

    let attendance = match params.get("attendance") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<AttendanceInput>(v.clone())
                .map_err(|e| HandlerErr::bad_params(format!("invalid attendance: {}", e)))?,
        ),
    };
    if let Some(a) = attendance {
        if a.present_days > a.total_days {
            return Err(HandlerErr::bad_params("attendance.presentDays exceeds totalDays"));
        }
    }

    let class_year: Option<String> = conn
        .query_row(
            "SELECT academic_year FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(class_year) = class_year else {
        return Err(HandlerErr::not_found("class"));
    };
    let academic_year = get_optional_str(params, "academicYear")?.unwrap_or(class_year);

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
    // Only the class's own students join its ranking cohort.
    if student_class != class_id {
        return Err(HandlerErr::bad_params("student is not enrolled in this class")
            .with_details(json!({ "studentClassId": student_class })));
    }

    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND class_id = ? AND exam_type = ? AND exam_date = ?",
            (&student_id, &class_id, &exam_type, &exam_date),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(existing) = duplicate {
        return Err(HandlerErr::new(
            "duplicate_result",
            "a result already exists for this student, class, exam type and date",
        )
        .with_details(json!({ "resultId": existing })));
    }

    let inputs = parse_subject_inputs(params)?;
    ensure_subjects_exist(conn, &inputs)?;
    let scores = resolve_scores(Some(conn), &inputs)?;
    let graded = grading::grade_result(&scores)?;

    let (att_total, att_present) = attendance
        .map(|a| (a.total_days, a.present_days))
        .unwrap_or((0, 0));
    let att_pct = attendance_percentage(att_present as usize, att_total as usize);

    let result_id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO results(
           id, student_id, class_id, academic_year, exam_type, exam_name, exam_date,
           total_marks, max_total_marks, percentage, overall_grade,
           remarks, teacher_remarks, principal_remarks, conduct_grade, is_promoted,
           extracurricular_sports, extracurricular_arts, extracurricular_other,
           attendance_total_days, attendance_present_days,
           attendance_percentage, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &result_id,
            &student_id,
            &class_id,
            &academic_year,
            &exam_type,
            &exam_name,
            &exam_date,
            graded.total_marks,
            graded.max_total_marks,
            graded.percentage,
            graded.overall_grade.as_str(),
            &report.remarks,
            &report.teacher_remarks,
            &report.principal_remarks,
            &conduct_grade,
            report.is_promoted.unwrap_or(false) as i64,
            &extracurricular.sports,
            &extracurricular.arts,
            &extracurricular.other,
            att_total,
            att_present,
            att_pct,
            &now,
            &now,
        ],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "results" }))
    })?;
    insert_subject_rows(&tx, &result_id, &graded, &inputs)?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(
        result_id = %result_id,
        student_id = %student_id,
        percentage = graded.percentage,
        grade = %graded.overall_grade,
        "result created"
    );
    load_result(conn, &result_id)
}

fn update_scores(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let result_id = get_required_str(params, "resultId")?;
    if !row_exists(conn, "results", &result_id)? {
        return Err(HandlerErr::not_found("result"));
    }

    let inputs = parse_subject_inputs(params)?;
    ensure_subjects_exist(conn, &inputs)?;
    let scores = resolve_scores(Some(conn), &inputs)?;
    let graded = grading::grade_result(&scores)?;

    // Rank is left as-is; it is refreshed by the next cohort ranking.
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM result_subjects WHERE result_id = ?", [&result_id])
        .map_err(db_err("db_delete_failed"))?;
    insert_subject_rows(&tx, &result_id, &graded, &inputs)?;
    tx.execute(
        "UPDATE results
         SET total_marks = ?, max_total_marks = ?, percentage = ?, overall_grade = ?, updated_at = ?
         WHERE id = ?",
        (
            graded.total_marks,
            graded.max_total_marks,
            graded.percentage,
            graded.overall_grade.as_str(),
            now_timestamp(),
            &result_id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(result_id = %result_id, percentage = graded.percentage, "result rescored");
    load_result(conn, &result_id)
}

/// Edits report-card fields only; marks, grades and rank are untouched.
fn update_report(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let result_id = get_required_str(params, "resultId")?;
    if !row_exists(conn, "results", &result_id)? {
        return Err(HandlerErr::not_found("result"));
    }
    let report = parse_report_fields(params)?;
    if report.is_empty() {
        return Err(HandlerErr::bad_params("no report fields to update"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    let text = |v: Option<String>| v.map(Value::Text).unwrap_or(Value::Null);
    for (column, value) in [
        ("remarks", report.remarks),
        ("teacher_remarks", report.teacher_remarks),
        ("principal_remarks", report.principal_remarks),
        ("conduct_grade", report.conduct_grade),
    ] {
        if value.is_some() {
            sets.push(column);
            binds.push(text(value));
        }
    }
    if let Some(p) = report.is_promoted {
        sets.push("is_promoted");
        binds.push(Value::Integer(p as i64));
    }
    if let Some(extra) = report.extracurricular {
        for (column, value) in [
            ("extracurricular_sports", extra.sports),
            ("extracurricular_arts", extra.arts),
            ("extracurricular_other", extra.other),
        ] {
            sets.push(column);
            binds.push(text(value));
        }
    }
    sets.push("updated_at");
    binds.push(Value::Text(now_timestamp()));
    binds.push(Value::Text(result_id.clone()));

    let assignments: Vec<String> = sets.iter().map(|c| format!("{} = ?", c)).collect();
    let sql = format!("UPDATE results SET {} WHERE id = ?", assignments.join(", "));
    conn.execute(&sql, params_from_iter(binds))
        .map_err(db_err("db_update_failed"))?;

    tracing::info!(result_id = %result_id, fields = ?sets, "report fields updated");
    load_result(conn, &result_id)
}

fn get_result(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let result_id = get_required_str(params, "resultId")?;
    load_result(conn, &result_id)
}

fn list_results(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT r.id, r.student_id, st.name, r.class_id, r.academic_year, r.exam_type,
                r.exam_name, r.exam_date, r.percentage, r.overall_grade, r.rank,
                r.total_students, r.is_published,
                NOT EXISTS(SELECT 1 FROM result_subjects rs
                           WHERE rs.result_id = r.id AND rs.is_pass = 0) AS all_pass
         FROM results r
         LEFT JOIN students st ON st.id = r.student_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [
        ("classId", "r.class_id"),
        ("studentId", "r.student_id"),
        ("academicYear", "r.academic_year"),
    ] {
        if let Some(v) = get_optional_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(Value::Text(v));
        }
    }
    if params.get("examType").is_some_and(|v| !v.is_null()) {
        let exam_type = parse_exam_type(params)?;
        sql.push_str(" AND r.exam_type = ?");
        binds.push(Value::Text(exam_type));
    }
    if get_optional_bool(params, "publishedOnly")?.unwrap_or(false) {
        sql.push_str(" AND r.is_published = 1");
    }
    sql.push_str(" ORDER BY r.exam_date DESC, r.rowid");

    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let results = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, Option<String>>(2)?,
                "classId": r.get::<_, String>(3)?,
                "academicYear": r.get::<_, String>(4)?,
                "examType": r.get::<_, String>(5)?,
                "examName": r.get::<_, String>(6)?,
                "examDate": r.get::<_, String>(7)?,
                "percentage": r.get::<_, f64>(8)?,
                "overallGrade": r.get::<_, String>(9)?,
                "rank": r.get::<_, Option<i64>>(10)?,
                "totalStudents": r.get::<_, Option<i64>>(11)?,
                "isPublished": r.get::<_, i64>(12)? != 0,
                "isPass": r.get::<_, i64>(13)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "results": results }))
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };
    respond(&req.id, list_results(conn, &req.params))
}

struct CohortMember {
    result_id: String,
    student_id: String,
    graded: GradedResult,
}

/// Regrades every member of a (class, examType, academicYear) cohort from its
/// stored scores and writes ranks back in a single transaction. Any member
/// that fails to grade aborts the whole cohort.
fn rank_cohort(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(params, "classId")?;
    let exam_type = parse_exam_type(params)?;
    let academic_year = get_required_str(params, "academicYear")?;
    let policy = match parse_tie_policy(params)? {
        Some(p) => p,
        None => ranking_tie_policy(conn)?,
    };
    if !row_exists(conn, "classes", &class_id)? {
        return Err(HandlerErr::not_found("class"));
    }

    // Insertion order decides the order among equal percentages.
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id FROM results
             WHERE class_id = ? AND exam_type = ? AND academic_year = ?
             ORDER BY rowid",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((&class_id, &exam_type, &academic_year), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut members = Vec::with_capacity(rows.len());
    for (result_id, student_id) in rows {
        let scores = load_stored_scores(conn, &result_id)?;
        let graded = grading::grade_result(&scores).map_err(|e| {
            tracing::warn!(result_id = %result_id, error = %e, "cohort member failed to grade");
            let index = e.index();
            HandlerErr::from(e).with_details(json!({ "resultId": result_id, "index": index }))
        })?;
        members.push(CohortMember {
            result_id,
            student_id,
            graded,
        });
    }

    let ranked = grading::rank_cohort(members, |m| m.graded.percentage, policy);

    let now = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for r in &ranked {
        let m = &r.item;
        tx.execute(
            "UPDATE results
             SET percentage = ?, overall_grade = ?, rank = ?, total_students = ?, updated_at = ?
             WHERE id = ?",
            (
                m.graded.percentage,
                m.graded.overall_grade.as_str(),
                r.rank as i64,
                r.total_students as i64,
                &now,
                &m.result_id,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "resultId": m.result_id }))
        })?;
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(
        class_id = %class_id,
        exam_type = %exam_type,
        academic_year = %academic_year,
        tie_policy = policy.as_str(),
        total_students = ranked.len(),
        "cohort ranked"
    );

    let ranks: Vec<serde_json::Value> = ranked
        .iter()
        .map(|r| {
            json!({
                "resultId": r.item.result_id,
                "studentId": r.item.student_id,
                "percentage": r.item.graded.percentage,
                "overallGrade": r.item.graded.overall_grade,
                "rank": r.rank,
                "totalStudents": r.total_students,
            })
        })
        .collect();
    Ok(json!({
        "classId": class_id,
        "examType": exam_type,
        "academicYear": academic_year,
        "tiePolicy": policy,
        "totalStudents": ranks.len(),
        "ranks": ranks,
    }))
}

fn publish_result(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let result_id = get_required_str(params, "resultId")?;
    let published = get_optional_bool(params, "published")?
        .ok_or_else(|| HandlerErr::bad_params("missing published"))?;
    let published_at = published.then(now_timestamp);
    // Unpublishing clears who published it.
    let published_by = if published {
        get_optional_str(params, "publishedBy")?
    } else {
        None
    };

    let changed = conn
        .execute(
            "UPDATE results
             SET is_published = ?, published_at = ?, published_by = ?, updated_at = ?
             WHERE id = ?",
            (
                published as i64,
                &published_at,
                &published_by,
                now_timestamp(),
                &result_id,
            ),
        )
        .map_err(db_err("db_update_failed"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("result"));
    }
    Ok(json!({
        "resultId": result_id,
        "isPublished": published,
        "publishedAt": published_at,
        "publishedBy": published_by,
    }))
}

fn delete_result(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let result_id = get_required_str(params, "resultId")?;
    if !row_exists(conn, "results", &result_id)? {
        return Err(HandlerErr::not_found("result"));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM result_subjects WHERE result_id = ?", [&result_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "result_subjects" }))
        })?;
    tx.execute("DELETE FROM results WHERE id = ?", [&result_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "results" }))
        })?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(result_id = %result_id, "result deleted");
    Ok(json!({ "resultId": result_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "results.grade" => grade_preview(state, &req.params),
        "results.list" => return Some(handle_results_list(state, req)),
        "results.create" => create_result(state, &req.params),
        "results.updateScores" => update_scores(state, &req.params),
        "results.updateReport" => update_report(state, &req.params),
        "results.get" => get_result(state, &req.params),
        "results.rankCohort" => rank_cohort(state, &req.params),
        "results.publish" => publish_result(state, &req.params),
        "results.delete" => delete_result(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
