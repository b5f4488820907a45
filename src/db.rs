use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "emrs.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    tracing::debug!(path = %db_path.display(), "opened workspace database");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            grade INTEGER NOT NULL,
            academic_year TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            max_marks REAL NOT NULL DEFAULT 100
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            student_no TEXT,
            roll_number INTEGER,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            exam_name TEXT NOT NULL,
            exam_date TEXT NOT NULL,
            total_marks REAL NOT NULL,
            max_total_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            overall_grade TEXT NOT NULL,
            rank INTEGER,
            total_students INTEGER,
            remarks TEXT,
            teacher_remarks TEXT,
            principal_remarks TEXT,
            conduct_grade TEXT NOT NULL DEFAULT 'Good',
            is_promoted INTEGER NOT NULL DEFAULT 0,
            extracurricular_sports TEXT,
            extracurricular_arts TEXT,
            extracurricular_other TEXT,
            attendance_total_days INTEGER NOT NULL DEFAULT 0,
            attendance_present_days INTEGER NOT NULL DEFAULT 0,
            attendance_percentage REAL NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            published_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, class_id, exam_type, exam_date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_cohort ON results(class_id, exam_type, academic_year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student_year ON results(student_id, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subjects(
            result_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            subject_id TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            max_marks REAL NOT NULL,
            grade TEXT NOT NULL,
            is_pass INTEGER NOT NULL,
            remarks TEXT,
            PRIMARY KEY(result_id, sort_order),
            FOREIGN KEY(result_id) REFERENCES results(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            remarks TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, date)",
        [],
    )?;

    // Workspaces created before publishing existed lack these columns.
    ensure_results_publish_columns(&conn)?;
    ensure_results_report_columns(&conn)?;

    Ok(conn)
}

fn ensure_results_publish_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "results", "is_published")? {
        conn.execute(
            "ALTER TABLE results ADD COLUMN is_published INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "results", "published_at")? {
        conn.execute("ALTER TABLE results ADD COLUMN published_at TEXT", [])?;
    }
    if !table_has_column(conn, "results", "published_by")? {
        conn.execute("ALTER TABLE results ADD COLUMN published_by TEXT", [])?;
    }
    Ok(())
}

fn ensure_results_report_columns(conn: &Connection) -> anyhow::Result<()> {
    for column in [
        "teacher_remarks",
        "principal_remarks",
        "extracurricular_sports",
        "extracurricular_arts",
        "extracurricular_other",
    ] {
        if !table_has_column(conn, "results", column)? {
            conn.execute(&format!("ALTER TABLE results ADD COLUMN {} TEXT", column), [])?;
        }
    }
    if !table_has_column(conn, "results", "is_promoted")? {
        conn.execute(
            "ALTER TABLE results ADD COLUMN is_promoted INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
