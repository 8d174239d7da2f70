use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::db;
use crate::ingest::decode::decode_table;
use crate::ingest::evidence;
use crate::ingest::normalize_text;
use crate::ingest::pipeline::{self, ImportResult, PipelineSettings};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

fn file_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn result_json(result: &ImportResult) -> Value {
    json!({
        "updatedCount": result.updated_count,
        "unmatchedCount": result.unmatched_count,
        "noDateCount": result.no_date_count,
    })
}

fn load_settings(conn: &rusqlite::Connection) -> anyhow::Result<PipelineSettings> {
    let section = super::setup::load_imports(conn)?;
    Ok(PipelineSettings {
        default_phase: section
            .get("defaultPhase")
            .and_then(|v| v.as_str())
            .unwrap_or(evidence::DEFAULT_PHASE)
            .to_string(),
        passing_score: section
            .get("passingScore")
            .and_then(|v| v.as_f64())
            .unwrap_or(70.0),
    })
}

struct ImportFile {
    bytes: Vec<u8>,
    file_name: String,
    sha256: String,
}

fn read_import_file(req: &Request) -> Result<ImportFile, Value> {
    let Some(in_path) = req.params.get("inPath").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing params.inPath", None));
    };
    let bytes = std::fs::read(in_path).map_err(|e| {
        err(
            &req.id,
            "parse_failed",
            format!("cannot read {}: {}", in_path, e),
            Some(json!({ "path": in_path })),
        )
    })?;
    let file_name = Path::new(in_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| in_path.to_string());
    let sha256 = file_sha256(&bytes);
    Ok(ImportFile {
        bytes,
        file_name,
        sha256,
    })
}

fn handle_evidence(state: &mut AppState, req: &Request, apply: bool) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let file = match read_import_file(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let cohort = req
        .params
        .get("cohort")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let rows = match decode_table(&file.bytes) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "parse_failed", e.to_string(), None),
    };
    let roster = match db::list_students(conn) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let catalog = match db::list_activities(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut settings = match load_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(phase) = req.params.get("phase").and_then(|v| v.as_str()) {
        let phase = normalize_text(phase);
        if phase.is_empty() {
            return err(&req.id, "bad_params", "phase must not be blank", None);
        }
        settings.default_phase = phase;
    }

    let plan = match pipeline::plan_evidence_import(&rows, &roster, &catalog, &cohort, &settings) {
        Ok(p) => p,
        Err(e) => return err(&req.id, e.code, e.message, None),
    };

    let mut changed_cells = 0usize;
    let mut access_changed = 0usize;
    if apply {
        let tx = match conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        };
        let now = db::now_stamp();
        for activity in &plan.change_set.created {
            if let Err(e) = db::insert_activity(&tx, activity, &now) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
        for up in &plan.grade_upserts {
            match db::upsert_grade_entry(&tx, up, &now) {
                Ok(true) => changed_cells += 1,
                Ok(false) => {}
                Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        for up in &plan.access_upserts {
            match db::upsert_access_record(&tx, up, &now) {
                Ok(true) => access_changed += 1,
                Ok(false) => {}
                Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        if let Err(e) = db::append_import_history(
            &tx,
            "evidence",
            &file.file_name,
            &file.sha256,
            &plan.result,
            &now,
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let mut result = json!({
        "preview": !apply,
        "cohort": cohort,
        "fileName": file.file_name,
        "sha256": file.sha256,
        "rowsTotal": plan.rows_total,
        "result": result_json(&plan.result),
        "summary": plan.result.summary_line(),
        "evidenceGroups": plan.group_count,
        "groups": plan.group_summaries,
        "activitiesCreated": plan.change_set.created.len(),
        "gradeCells": plan.grade_upserts.len(),
        "accessRows": plan.access_upserts.len(),
        "warnings": plan.warnings,
    });
    if apply {
        result["changedCells"] = json!(changed_cells);
        result["accessChanged"] = json!(access_changed);
    }
    ok(&req.id, result)
}

fn handle_access(state: &mut AppState, req: &Request, apply: bool) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let file = match read_import_file(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let rows = match decode_table(&file.bytes) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "parse_failed", e.to_string(), None),
    };
    let roster = match db::list_students(conn) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let plan = match pipeline::plan_access_import(&rows, &roster) {
        Ok(p) => p,
        Err(e) => return err(&req.id, e.code, e.message, None),
    };

    let mut access_changed = 0usize;
    if apply {
        let tx = match conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        };
        let now = db::now_stamp();
        for up in &plan.access_upserts {
            match db::upsert_access_record(&tx, up, &now) {
                Ok(true) => access_changed += 1,
                Ok(false) => {}
                Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        if let Err(e) = db::append_import_history(
            &tx,
            "access",
            &file.file_name,
            &file.sha256,
            &plan.result,
            &now,
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let mut result = json!({
        "preview": !apply,
        "fileName": file.file_name,
        "sha256": file.sha256,
        "rowsTotal": plan.rows_total,
        "result": result_json(&plan.result),
        "summary": plan.result.summary_line(),
        "accessRows": plan.access_upserts.len(),
        "warnings": plan.warnings,
    });
    if apply {
        result["accessChanged"] = json!(access_changed);
    }
    ok(&req.id, result)
}

fn handle_history(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(50)
        .clamp(1, 500);

    let mut stmt = match conn.prepare(
        "SELECT id, kind, file_name, sha256,
                updated_count, unmatched_count, no_date_count, imported_at
         FROM import_history
         ORDER BY imported_at DESC, rowid DESC
         LIMIT ?1",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([limit], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "kind": r.get::<_, String>(1)?,
            "fileName": r.get::<_, String>(2)?,
            "sha256": r.get::<_, String>(3)?,
            "updatedCount": r.get::<_, i64>(4)?,
            "unmatchedCount": r.get::<_, i64>(5)?,
            "noDateCount": r.get::<_, i64>(6)?,
            "importedAt": r.get::<_, String>(7)?,
        }))
    });
    let mut imports = Vec::new();
    match rows {
        Ok(rows) => {
            for row in rows {
                match row {
                    Ok(v) => imports.push(v),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    ok(&req.id, json!({ "imports": imports }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "imports.evidence.preview" => Some(handle_evidence(state, req, false)),
        "imports.evidence.apply" => Some(handle_evidence(state, req, true)),
        "imports.access.preview" => Some(handle_access(state, req, false)),
        "imports.access.apply" => Some(handle_access(state, req, true)),
        "imports.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
