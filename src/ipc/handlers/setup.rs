use serde_json::{json, Map, Value};

use crate::db;
use crate::ingest::evidence::{self, PHASES};
use crate::ingest::normalize_text;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

const SECTION_KEY: &str = "setup.imports";

fn default_imports() -> Value {
    json!({
        "defaultPhase": evidence::DEFAULT_PHASE,
        "passingScore": 70.0
    })
}

fn merge_imports_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "defaultPhase" => {
                let Some(raw) = v.as_str() else {
                    return Err("defaultPhase must be string".into());
                };
                let phase = normalize_text(raw);
                if !PHASES.contains(&phase.as_str()) {
                    return Err(format!(
                        "defaultPhase must be one of: {}",
                        PHASES.join(", ")
                    ));
                }
                obj.insert(k.clone(), Value::String(phase));
            }
            "passingScore" => {
                let Some(n) = v.as_f64() else {
                    return Err("passingScore must be a number".into());
                };
                if !(0.0..=100.0).contains(&n) {
                    return Err("passingScore must be in 0..=100".into());
                }
                obj.insert(k.clone(), json!(n));
            }
            _ => return Err(format!("unknown imports field: {}", k)),
        }
    }
    Ok(())
}

/// Current imports section with defaults filled in. Malformed historical
/// values fall back to the defaults rather than blocking the setup UI.
pub fn load_imports(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    let mut current = default_imports();
    if let Some(saved) = db::settings_get_json(conn, SECTION_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            let _ = merge_imports_patch(&mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match load_imports(conn) {
        Ok(imports) => ok(&req.id, json!({ "imports": imports, "phases": PHASES })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    let mut current = match load_imports(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_imports_patch(&mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, SECTION_KEY, &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "imports": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.imports.get" => Some(handle_get(state, req)),
        "setup.imports.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
