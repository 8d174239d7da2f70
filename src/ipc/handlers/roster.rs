use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db;
use crate::ingest::decode::{decode_table, CellValue};
use crate::ingest::identity::document_key;
use crate::ingest::normalize_text;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

/// Fixed-schema column lookup for roster files: exact names first, then
/// containment, all over normalized headers. A claimed column is never
/// handed to a second role.
fn find_column(normalized: &[String], claimed: &mut [bool], names: &[&str]) -> Option<usize> {
    for name in names {
        for (i, header) in normalized.iter().enumerate() {
            if !claimed[i] && header == name {
                claimed[i] = true;
                return Some(i);
            }
        }
    }
    for name in names {
        for (i, header) in normalized.iter().enumerate() {
            if !claimed[i] && header.contains(name) {
                claimed[i] = true;
                return Some(i);
            }
        }
    }
    None
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cohort = req.params.get("cohort").and_then(|v| v.as_str());

    let mut sql = String::from(
        "SELECT id, document, first_name, last_name, email, username, cohort, status
         FROM students",
    );
    if cohort.is_some() {
        sql.push_str(" WHERE cohort = ?1");
    }
    sql.push_str(" ORDER BY cohort, sort_order, id");

    let run = |conn: &rusqlite::Connection| -> anyhow::Result<Vec<Value>> {
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<Value> {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "document": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "email": r.get::<_, String>(4)?,
                "username": r.get::<_, String>(5)?,
                "cohort": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
            }))
        };
        let rows = match cohort {
            Some(c) => stmt.query_map([c], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    };
    let students = match run(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let cohorts = {
        let mut stmt = match conn.prepare(
            "SELECT cohort, COUNT(*) FROM students GROUP BY cohort ORDER BY cohort",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt.query_map([], |r| {
            Ok(json!({
                "cohort": r.get::<_, String>(0)?,
                "studentCount": r.get::<_, i64>(1)?,
            }))
        });
        let mut out = Vec::new();
        match rows {
            Ok(rows) => {
                for row in rows {
                    match row {
                        Ok(v) => out.push(v),
                        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                    }
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        out
    };

    ok(&req.id, json!({ "students": students, "cohorts": cohorts }))
}

fn handle_roster_import(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(in_path) = req.params.get("inPath").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.inPath", None);
    };
    let bytes = match std::fs::read(in_path) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "parse_failed",
                format!("cannot read {}: {}", in_path, e),
                None,
            )
        }
    };
    let rows = match decode_table(&bytes) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "parse_failed", e.to_string(), None),
    };
    let Some(header_at) = rows.iter().position(|r| r.iter().any(|c| !c.is_empty())) else {
        return err(&req.id, "parse_failed", "roster file has no rows", None);
    };
    let headers: Vec<String> = rows[header_at]
        .iter()
        .map(|c| normalize_text(&c.as_text()))
        .collect();

    let mut claimed = vec![false; headers.len()];
    let Some(document_col) = find_column(
        &headers,
        &mut claimed,
        &["documento", "numero de documento", "identificacion", "cedula"],
    ) else {
        return err(
            &req.id,
            "parse_failed",
            "roster file has no document column",
            None,
        );
    };
    // Username before the name columns so "nombre de usuario" never doubles
    // as a first-name column.
    let username_col = find_column(
        &headers,
        &mut claimed,
        &["nombre de usuario", "usuario", "username", "login"],
    );
    let email_col = find_column(&headers, &mut claimed, &["correo", "email", "e-mail"]);
    let last_name_col = find_column(
        &headers,
        &mut claimed,
        &["apellidos", "apellido(s)", "apellido"],
    );
    let first_name_col = find_column(&headers, &mut claimed, &["nombres", "nombre"]);
    let cohort_col = find_column(
        &headers,
        &mut claimed,
        &["ficha", "numero de ficha", "cohorte", "grupo"],
    );
    let status_col = find_column(&headers, &mut claimed, &["estado"]);

    let mut sort_next: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    let now = db::now_stamp();
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut skipped = 0usize;
    let mut warnings: Vec<Value> = Vec::new();

    for (i, row) in rows.iter().enumerate().skip(header_at + 1) {
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }
        let text_at = |col: Option<usize>| -> String {
            col.and_then(|c| row.get(c))
                .map(|cell: &CellValue| cell.as_text().trim().to_string())
                .unwrap_or_default()
        };
        let Some(document) = document_key(&text_at(Some(document_col))) else {
            skipped += 1;
            warnings.push(json!({
                "line": i + 1,
                "code": "missing_document",
                "message": "row has no usable document number",
            }));
            continue;
        };
        let first_name = text_at(first_name_col);
        let last_name = text_at(last_name_col);
        let email = text_at(email_col);
        let username = text_at(username_col);
        let cohort = text_at(cohort_col);
        let status = text_at(status_col);

        let existing: Result<Option<String>, _> = tx
            .query_row(
                "SELECT id FROM students WHERE document = ?1",
                [document.as_str()],
                |r| r.get(0),
            )
            .optional();
        match existing {
            Ok(Some(id)) => {
                // Blank cells leave the stored value alone.
                let res = tx.execute(
                    "UPDATE students SET
                        first_name = CASE WHEN ?1 = '' THEN first_name ELSE ?1 END,
                        last_name  = CASE WHEN ?2 = '' THEN last_name ELSE ?2 END,
                        email      = CASE WHEN ?3 = '' THEN email ELSE ?3 END,
                        username   = CASE WHEN ?4 = '' THEN username ELSE ?4 END,
                        cohort     = CASE WHEN ?5 = '' THEN cohort ELSE ?5 END,
                        status     = CASE WHEN ?6 = '' THEN status ELSE ?6 END,
                        updated_at = ?7
                     WHERE id = ?8",
                    (
                        &first_name, &last_name, &email, &username, &cohort, &status, &now, &id,
                    ),
                );
                if let Err(e) = res {
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                updated += 1;
            }
            Ok(None) => {
                let status = if status.is_empty() {
                    "active".to_string()
                } else {
                    status
                };
                let res = tx.execute(
                    "INSERT INTO students(
                        id, document, first_name, last_name, email, username,
                        cohort, status, sort_order, updated_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    (
                        Uuid::new_v4().to_string(),
                        &document,
                        &first_name,
                        &last_name,
                        &email,
                        &username,
                        &cohort,
                        &status,
                        sort_next,
                        &now,
                    ),
                );
                if let Err(e) = res {
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                sort_next += 1;
                created += 1;
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "created": created,
            "updated": updated,
            "skipped": skipped,
            "warnings": warnings,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.list" => Some(handle_roster_list(state, req)),
        "roster.importCsv" => Some(handle_roster_import(state, req)),
        _ => None,
    }
}
