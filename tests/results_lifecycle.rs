use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_emrsd");
    let mut child = Command::new(exe)
        .env_remove("EMRSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn emrsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or_else(|| panic!("missing {} in {}", key, v))
}

#[test]
fn result_create_grade_rescore_publish_delete() {
    let workspace = temp_dir("emrsd-results-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "IX-A", "grade": 9, "academicYear": "2024-2025" }),
    );
    let class_id = str_field(&class, "classId").to_string();

    let mut subject_ids = Vec::new();
    for (i, (name, code)) in [
        ("Mathematics", "math"),
        ("Science", "sci"),
        ("English", "eng"),
        ("Social Studies", "sst"),
    ]
    .iter()
    .enumerate()
    {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "subjects.create",
            json!({ "name": name, "code": code }),
        );
        assert_eq!(s.get("code").and_then(|v| v.as_str()), Some(code.to_uppercase().as_str()));
        assert_eq!(s.get("maxMarks").and_then(|v| v.as_f64()), Some(100.0));
        subject_ids.push(str_field(&s, "subjectId").to_string());
    }

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "name": "Ravi Kumar", "rollNumber": 7 }),
    );
    let student_id = str_field(&student, "studentId").to_string();

    // maxMarks omitted: the subjects' configured maximum (100) applies.
    let marks = [85.0, 78.0, 82.0, 88.0];
    let subjects: Vec<serde_json::Value> = subject_ids
        .iter()
        .zip(marks)
        .map(|(id, m)| json!({ "subjectId": id, "marksObtained": m }))
        .collect();

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.grade",
        json!({ "subjects": subjects }),
    );
    assert_eq!(preview.get("percentage").and_then(|v| v.as_f64()), Some(83.25));
    let listed = request_ok(&mut stdin, &mut reader, "5", "results.list", json!({}));
    assert_eq!(
        listed.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0),
        "preview must not persist"
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "examType": "mid_term",
            "examName": "Mid Term 2024",
            "examDate": "2024-10-15",
            "subjects": subjects,
            "attendance": { "totalDays": 90, "presentDays": 81 },
        }),
    );
    let result_id = str_field(&created, "id").to_string();
    assert_eq!(created.get("totalMarks").and_then(|v| v.as_f64()), Some(333.0));
    assert_eq!(created.get("maxTotalMarks").and_then(|v| v.as_f64()), Some(400.0));
    assert_eq!(created.get("percentage").and_then(|v| v.as_f64()), Some(83.25));
    assert_eq!(str_field(&created, "overallGrade"), "A");
    assert_eq!(str_field(&created, "academicYear"), "2024-2025");
    assert_eq!(str_field(&created, "conductGrade"), "Good");
    assert_eq!(created.get("isPass").and_then(|v| v.as_bool()), Some(true));
    assert!(created.get("rank").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        created
            .get("attendance")
            .and_then(|a| a.get("percentage"))
            .and_then(|v| v.as_f64()),
        Some(90.0)
    );
    let grades: Vec<&str> = created
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects")
        .iter()
        .map(|s| str_field(s, "grade"))
        .collect();
    assert_eq!(grades, vec!["A", "B+", "A", "A"]);

    let dup = request(
        &mut stdin,
        &mut reader,
        "7",
        "results.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "examType": "mid_term",
            "examName": "Mid Term 2024 (again)",
            "examDate": "2024-10-15",
            "subjects": subjects,
        }),
    );
    assert_eq!(error_code(&dup), "duplicate_result");

    let rescored = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.updateScores",
        json!({
            "resultId": result_id,
            "subjects": [
                { "subjectId": subject_ids[0], "marksObtained": 20, "maxMarks": 100 },
                { "subjectId": subject_ids[1], "marksObtained": 45, "maxMarks": 50, "remarks": "Excellent practicals" },
            ],
        }),
    );
    assert_eq!(rescored.get("totalMarks").and_then(|v| v.as_f64()), Some(65.0));
    assert_eq!(rescored.get("maxTotalMarks").and_then(|v| v.as_f64()), Some(150.0));
    assert_eq!(rescored.get("percentage").and_then(|v| v.as_f64()), Some(43.33));
    assert_eq!(str_field(&rescored, "overallGrade"), "C");
    assert_eq!(rescored.get("isPass").and_then(|v| v.as_bool()), Some(false));
    let rescored_subjects = rescored.get("subjects").and_then(|v| v.as_array()).expect("subjects");
    assert_eq!(rescored_subjects.len(), 2);
    assert_eq!(str_field(&rescored_subjects[0], "grade"), "F");
    assert_eq!(str_field(&rescored_subjects[1], "grade"), "A+");
    assert_eq!(str_field(&rescored_subjects[1], "remarks"), "Excellent practicals");

    let published_only = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.list",
        json!({ "publishedOnly": true }),
    );
    assert_eq!(
        published_only.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let published = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.publish",
        json!({ "resultId": result_id, "published": true }),
    );
    assert_eq!(published.get("isPublished").and_then(|v| v.as_bool()), Some(true));
    assert!(published.get("publishedAt").and_then(|v| v.as_str()).is_some());
    let published_only = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.list",
        json!({ "publishedOnly": true, "studentId": student_id }),
    );
    let rows = published_only.get("results").and_then(|v| v.as_array()).expect("results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("isPass").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(str_field(&rows[0], "studentName"), "Ravi Kumar");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "results.delete",
        json!({ "resultId": result_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));
    let missing = request(
        &mut stdin,
        &mut reader,
        "13",
        "results.get",
        json!({ "resultId": result_id }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_scores_reject_the_whole_result() {
    let workspace = temp_dir("emrsd-results-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "X-B", "grade": 10 }),
    );
    let class_id = str_field(&class, "classId").to_string();
    assert!(str_field(&class, "academicYear").contains('-'));
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Physics", "code": "PHY", "maxMarks": 80 }),
    );
    let subject_id = str_field(&subject, "subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "name": "Lakshmi" }),
    );
    let student_id = str_field(&student, "studentId").to_string();

    let base = json!({
        "studentId": student_id,
        "classId": class_id,
        "examType": "unit_test",
        "examName": "Unit Test 1",
        "examDate": "2024-07-01",
    });
    let with_subjects = |subjects: serde_json::Value| {
        let mut p = base.clone();
        p["subjects"] = subjects;
        p
    };

    let cases: [(serde_json::Value, Option<u64>); 4] = [
        (json!([]), None),
        (
            json!([
                { "subjectId": subject_id, "marksObtained": 40 },
                { "subjectId": subject_id, "marksObtained": -2 },
            ]),
            Some(1),
        ),
        (json!([{ "subjectId": subject_id, "marksObtained": 10, "maxMarks": 0 }]), Some(0)),
        (json!([{ "subjectId": subject_id, "marksObtained": 81 }]), Some(0)),
    ];
    for (i, (subjects, index)) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "results.create",
            with_subjects(subjects),
        );
        assert_eq!(error_code(&resp), "invalid_score", "case {}: {}", i, resp);
        let got_index = resp
            .get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("index"))
            .and_then(|v| v.as_u64());
        assert_eq!(got_index, index, "case {}", i);
    }

    let unknown_exam = {
        let mut p = with_subjects(json!([{ "subjectId": subject_id, "marksObtained": 40 }]));
        p["examType"] = json!("quiz");
        request(&mut stdin, &mut reader, "5", "results.create", p)
    };
    assert_eq!(error_code(&unknown_exam), "bad_params");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        listed.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0),
        "rejected results must not be persisted"
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.create",
        with_subjects(json!([{ "subjectId": subject_id, "marksObtained": 40 }])),
    );
    assert_eq!(created.get("percentage").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(str_field(&created, "overallGrade"), "C+");
    let result_id = str_field(&created, "id").to_string();

    // A failed rescore leaves the stored scores untouched.
    let bad_rescore = request(
        &mut stdin,
        &mut reader,
        "8",
        "results.updateScores",
        json!({ "resultId": result_id, "subjects": [{ "subjectId": subject_id, "marksObtained": -1 }] }),
    );
    assert_eq!(error_code(&bad_rescore), "invalid_score");
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.get",
        json!({ "resultId": result_id }),
    );
    assert_eq!(fetched.get("percentage").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(
        fetched.get("subjects").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_card_fields_round_out_a_result() {
    let workspace = temp_dir("emrsd-results-report");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "XII-A", "grade": 12, "academicYear": "2024-2025" }),
    );
    let class_id = str_field(&class, "classId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Chemistry", "code": "CHE" }),
    );
    let subject_id = str_field(&subject, "subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "name": "Sirisha" }),
    );
    let student_id = str_field(&student, "studentId").to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "examType": "annual",
            "examName": "Annual 2025",
            "examDate": "2025-03-20",
            "subjects": [{ "subjectId": subject_id, "marksObtained": 72 }],
            "teacherRemarks": "Consistent effort",
            "conductGrade": "Very Good",
            "isPromoted": true,
            "extracurricular": { "sports": "  Kabaddi team ", "arts": "" },
        }),
    );
    let result_id = str_field(&created, "id").to_string();
    assert_eq!(str_field(&created, "teacherRemarks"), "Consistent effort");
    assert!(created.get("principalRemarks").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(str_field(&created, "conductGrade"), "Very Good");
    assert_eq!(created.get("isPromoted").and_then(|v| v.as_bool()), Some(true));
    let extra = created.get("extracurricular").expect("extracurricular");
    assert_eq!(extra.get("sports").and_then(|v| v.as_str()), Some("Kabaddi team"));
    assert_eq!(extra.get("arts"), Some(&serde_json::Value::Null));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.updateReport",
        json!({ "resultId": result_id, "principalRemarks": "Promoted with merit", "isPromoted": false }),
    );
    assert_eq!(str_field(&updated, "principalRemarks"), "Promoted with merit");
    assert_eq!(str_field(&updated, "teacherRemarks"), "Consistent effort");
    assert_eq!(updated.get("isPromoted").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(updated.get("percentage").and_then(|v| v.as_f64()), Some(72.0));
    assert_eq!(str_field(&updated, "overallGrade"), "B+");

    let nothing = request(
        &mut stdin,
        &mut reader,
        "7",
        "results.updateReport",
        json!({ "resultId": result_id }),
    );
    assert_eq!(error_code(&nothing), "bad_params");
    let bad_conduct = request(
        &mut stdin,
        &mut reader,
        "8",
        "results.updateReport",
        json!({ "resultId": result_id, "conductGrade": "Outstanding" }),
    );
    assert_eq!(error_code(&bad_conduct), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.publish",
        json!({ "resultId": result_id, "published": true, "publishedBy": "principal-01" }),
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.get",
        json!({ "resultId": result_id }),
    );
    assert_eq!(str_field(&fetched, "publishedBy"), "principal-01");
    assert_eq!(fetched.get("isPublished").and_then(|v| v.as_bool()), Some(true));

    let withdrawn = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.publish",
        json!({ "resultId": result_id, "published": false }),
    );
    assert_eq!(withdrawn.get("publishedBy"), Some(&serde_json::Value::Null));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
