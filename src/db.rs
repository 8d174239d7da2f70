use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::calc::Letter;
use crate::ingest::evidence::Activity;
use crate::ingest::identity::StudentRecord;
use crate::ingest::pipeline::{AccessUpsert, GradeUpsert, ImportResult};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("aula.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            document TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            username TEXT NOT NULL DEFAULT '',
            cohort TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cohort ON students(cohort)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_document ON students(document)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            cohort TEXT NOT NULL DEFAULT '',
            phase TEXT NOT NULL,
            detail TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_phase ON activities(phase)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_cohort ON activities(cohort)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entries(
            student_id TEXT NOT NULL,
            activity_id TEXT NOT NULL,
            score REAL NOT NULL,
            letter TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(student_id, activity_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(activity_id) REFERENCES activities(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_activity ON grade_entries(activity_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS access_records(
            student_id TEXT PRIMARY KEY,
            last_access TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_history(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            file_name TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            updated_count INTEGER NOT NULL,
            unmatched_count INTEGER NOT NULL,
            no_date_count INTEGER NOT NULL,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

/// Wall-clock stamp in the same canonical shape access timestamps use.
pub fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(match raw {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    })
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Roster in stable order; resolver determinism leans on this ordering.
pub fn list_students(conn: &Connection) -> anyhow::Result<Vec<StudentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, document, first_name, last_name, email, username, cohort, status
         FROM students ORDER BY sort_order, id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(StudentRecord {
            id: r.get(0)?,
            document: r.get(1)?,
            first_name: r.get(2)?,
            last_name: r.get(3)?,
            email: r.get(4)?,
            username: r.get(5)?,
            cohort: r.get(6)?,
            status: r.get(7)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Catalog in creation order so display-name numbering and group
/// representatives stay stable across reads.
pub fn list_activities(conn: &Connection) -> anyhow::Result<Vec<Activity>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, cohort, phase, detail FROM activities ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(Activity {
            id: r.get(0)?,
            name: r.get(1)?,
            cohort: r.get(2)?,
            phase: r.get(3)?,
            detail: r.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn insert_activity(conn: &Connection, activity: &Activity, now: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO activities(id, name, cohort, phase, detail, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (
            &activity.id,
            &activity.name,
            &activity.cohort,
            &activity.phase,
            &activity.detail,
            now,
        ),
    )?;
    Ok(())
}

/// Upserts one grade. The no-op guard keeps `updated_at` untouched when the
/// incoming score and letter already match, which is what makes re-importing
/// the same file invisible in the stored state.
pub fn upsert_grade_entry(conn: &Connection, up: &GradeUpsert, now: &str) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "INSERT INTO grade_entries(student_id, activity_id, score, letter, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(student_id, activity_id) DO UPDATE SET
            score = excluded.score,
            letter = excluded.letter,
            updated_at = excluded.updated_at
         WHERE grade_entries.score != excluded.score
            OR grade_entries.letter != excluded.letter",
        (
            &up.student_id,
            &up.activity_id,
            up.score,
            up.letter.as_str(),
            now,
        ),
    )?;
    Ok(changed > 0)
}

/// Newer-wins upsert; canonical timestamps compare lexicographically.
pub fn upsert_access_record(
    conn: &Connection,
    up: &AccessUpsert,
    now: &str,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "INSERT INTO access_records(student_id, last_access, updated_at)
         VALUES(?1, ?2, ?3)
         ON CONFLICT(student_id) DO UPDATE SET
            last_access = excluded.last_access,
            updated_at = excluded.updated_at
         WHERE excluded.last_access > access_records.last_access",
        (&up.student_id, &up.last_access, now),
    )?;
    Ok(changed > 0)
}

pub fn append_import_history(
    conn: &Connection,
    kind: &str,
    file_name: &str,
    sha256: &str,
    result: &ImportResult,
    now: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO import_history(
            id, kind, file_name, sha256,
            updated_count, unmatched_count, no_date_count, imported_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            uuid::Uuid::new_v4().to_string(),
            kind,
            file_name,
            sha256,
            result.updated_count as i64,
            result.unmatched_count as i64,
            result.no_date_count as i64,
            now,
        ),
    )?;
    Ok(())
}

/// Grade cells keyed by (student, activity) for the summary view.
pub fn grade_cells(
    conn: &Connection,
) -> anyhow::Result<std::collections::HashMap<(String, String), (f64, Letter)>> {
    let mut stmt =
        conn.prepare("SELECT student_id, activity_id, score, letter FROM grade_entries")?;
    let rows = stmt.query_map([], |r| {
        Ok((
            (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
            (r.get::<_, f64>(2)?, r.get::<_, String>(3)?),
        ))
    })?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (key, (score, letter)) = row?;
        out.insert(key, (score, Letter::from_db(&letter)));
    }
    Ok(out)
}

pub fn access_map(conn: &Connection) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT student_id, last_access FROM access_records")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (student_id, last_access) = row?;
        out.insert(student_id, last_access);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let dir = std::env::temp_dir().join(format!(
            "aulad-db-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        open_db(&dir).expect("open db")
    }

    fn seed_student(conn: &Connection, id: &str, document: &str) {
        conn.execute(
            "INSERT INTO students(id, document, first_name, last_name, sort_order)
             VALUES(?1, ?2, 'Ana', 'Ruiz', 0)",
            (id, document),
        )
        .expect("insert student");
    }

    fn seed_activity(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO activities(id, name, cohort, phase, detail)
             VALUES(?1, 'Evidencia 1', '', 'ejecucion', 'AA1-EV1')",
            [id],
        )
        .expect("insert activity");
    }

    #[test]
    fn grade_upsert_is_a_noop_when_unchanged() {
        let conn = mem_conn();
        seed_student(&conn, "s1", "1001");
        seed_activity(&conn, "a1");
        let up = GradeUpsert {
            student_id: "s1".to_string(),
            activity_id: "a1".to_string(),
            score: 85.0,
            letter: Letter::Approved,
        };
        assert!(upsert_grade_entry(&conn, &up, "2025-02-01 00:00:00").expect("upsert"));
        assert!(!upsert_grade_entry(&conn, &up, "2025-03-01 00:00:00").expect("upsert"));
        let stamp: String = conn
            .query_row(
                "SELECT updated_at FROM grade_entries WHERE student_id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("stamp");
        assert_eq!(stamp, "2025-02-01 00:00:00");
    }

    #[test]
    fn grade_upsert_rewrites_on_change() {
        let conn = mem_conn();
        seed_student(&conn, "s1", "1001");
        seed_activity(&conn, "a1");
        let mut up = GradeUpsert {
            student_id: "s1".to_string(),
            activity_id: "a1".to_string(),
            score: 85.0,
            letter: Letter::Approved,
        };
        upsert_grade_entry(&conn, &up, "2025-02-01 00:00:00").expect("upsert");
        up.score = 40.0;
        up.letter = Letter::Failed;
        assert!(upsert_grade_entry(&conn, &up, "2025-03-01 00:00:00").expect("upsert"));
        let (score, letter): (f64, String) = conn
            .query_row(
                "SELECT score, letter FROM grade_entries WHERE student_id = 's1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("row");
        assert_eq!(score, 40.0);
        assert_eq!(letter, "D");
    }

    #[test]
    fn access_upsert_keeps_the_newest_timestamp() {
        let conn = mem_conn();
        seed_student(&conn, "s1", "1001");
        let newer = AccessUpsert {
            student_id: "s1".to_string(),
            last_access: "2025-01-21 17:30:00".to_string(),
        };
        let older = AccessUpsert {
            student_id: "s1".to_string(),
            last_access: "2025-01-20 23:59:00".to_string(),
        };
        assert!(upsert_access_record(&conn, &newer, "x").expect("upsert"));
        assert!(!upsert_access_record(&conn, &older, "x").expect("upsert"));
        let stored: String = conn
            .query_row(
                "SELECT last_access FROM access_records WHERE student_id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("row");
        assert_eq!(stored, "2025-01-21 17:30:00");
    }

    #[test]
    fn settings_roundtrip_json() {
        let conn = mem_conn();
        assert!(settings_get_json(&conn, "setup.imports").expect("get").is_none());
        let value = serde_json::json!({ "defaultPhase": "analisis", "passingScore": 65 });
        settings_set_json(&conn, "setup.imports", &value).expect("set");
        let back = settings_get_json(&conn, "setup.imports")
            .expect("get")
            .expect("present");
        assert_eq!(back, value);
    }
}
