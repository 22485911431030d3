use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("casedesk.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT,
            active INTEGER NOT NULL,
            absent_on TEXT,
            backup_on TEXT,
            tester_on TEXT,
            yearly_load INTEGER NOT NULL DEFAULT 0,
            monthly_loads TEXT NOT NULL DEFAULT '{}'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_files(
            id TEXT PRIMARY KEY,
            day TEXT NOT NULL,
            created_at TEXT NOT NULL,
            case_type TEXT NOT NULL,
            is_new INTEGER NOT NULL DEFAULT 0,
            diagnosis_count INTEGER NOT NULL DEFAULT 0,
            is_test INTEGER NOT NULL DEFAULT 0,
            assigned_to TEXT,
            score INTEGER NOT NULL DEFAULT 0,
            is_absence_penalty INTEGER NOT NULL DEFAULT 0,
            is_backup_bonus INTEGER NOT NULL DEFAULT 0,
            reason TEXT,
            archived_day TEXT,
            FOREIGN KEY(assigned_to) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_day ON case_files(day)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_assigned ON case_files(assigned_to)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_archived_day ON case_files(archived_day)",
        [],
    )?;

    // Existing workspaces may predate these columns. Add if needed.
    ensure_case_files_reason(&conn)?;
    ensure_teachers_role(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_teacher ON notifications(teacher_id)",
        [],
    )?;

    // Older workspaces stored case types with mixed casing.
    migrate_case_type_casing(&conn)?;

    Ok(conn)
}

fn ensure_case_files_reason(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "case_files", "reason")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE case_files ADD COLUMN reason TEXT", [])?;
    Ok(())
}

fn ensure_teachers_role(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "teachers", "role")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE teachers ADD COLUMN role TEXT", [])?;
    Ok(())
}

fn migrate_case_type_casing(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE case_files SET case_type = LOWER(case_type)
         WHERE case_type != LOWER(case_type)",
        [],
    )?;
    Ok(())
}

pub fn meta_get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let v = conn
        .query_row("SELECT value FROM meta WHERE key = ?", [key], |r| r.get(0))
        .optional()?;
    Ok(v)
}

pub fn meta_set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value),
    )?;
    Ok(())
}

pub fn settings_all(conn: &Connection) -> anyhow::Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    let mut out = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        out.insert(k, v);
    }
    Ok(out)
}

pub fn settings_set(conn: &Connection, key: &str, value: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value),
    )?;
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
