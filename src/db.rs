use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("bulletin.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates every table this sidecar needs. Safe to call on an existing
/// workspace; all statements are idempotent.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            school_year TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            coefficient REAL NOT NULL DEFAULT 1,
            teacher_name TEXT,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_subjects_subject ON class_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            school_year TEXT NOT NULL,
            label TEXT NOT NULL,
            parent_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(parent_id) REFERENCES periods(id),
            UNIQUE(school_year, label)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periods_parent ON periods(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            title TEXT NOT NULL,
            max_score REAL NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(period_id) REFERENCES periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_class_period ON evaluations(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_subject ON evaluations(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            value REAL,
            absent INTEGER NOT NULL DEFAULT 0,
            excused INTEGER NOT NULL DEFAULT 0,
            validated INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(evaluation_id, student_id)
        )",
        [],
    )?;
    // Retake flag landed after the first workspaces shipped.
    ensure_grades_retake(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_evaluation ON grades(evaluation_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    // The (student_id, class_id, period_id) uniqueness is load-bearing:
    // generation relies on the constraint, not an existence check, so two
    // concurrent runs cannot both insert the same bulletin.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulletins(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            overall_average REAL,
            class_rank INTEGER,
            class_size INTEGER NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0,
            generated_at TEXT NOT NULL,
            generated_by TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            UNIQUE(student_id, class_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulletins_class_period ON bulletins(class_id, period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulletin_lines(
            id TEXT PRIMARY KEY,
            bulletin_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_average REAL,
            subject_rank INTEGER,
            weighted_average REAL,
            FOREIGN KEY(bulletin_id) REFERENCES bulletins(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(bulletin_id, subject_id)
        )",
        [],
    )?;
    ensure_bulletin_lines_remark(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulletin_lines_bulletin ON bulletin_lines(bulletin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulletin_lines_subject ON bulletin_lines(subject_id)",
        [],
    )?;

    Ok(())
}

fn ensure_grades_retake(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "retake")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grades ADD COLUMN retake INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_bulletin_lines_remark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "bulletin_lines", "remark")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE bulletin_lines ADD COLUMN remark TEXT", [])?;
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
