use serde_json::{json, Value};

use crate::calc::{self, GradeCell};
use crate::db;
use crate::ingest::evidence::{self, Activity, CatalogGroup, COHORT_AGNOSTIC};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

fn cohort_param(req: &Request) -> Option<String> {
    req.params
        .get("cohort")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Activity a student's grade is read from within one group: own cohort,
/// then the cohort-agnostic instance, then the group representative.
fn student_activity<'a>(
    group: &CatalogGroup,
    activities: &'a [Activity],
    cohort: &str,
) -> &'a Activity {
    let at = group
        .instances
        .get(cohort)
        .or_else(|| group.instances.get(COHORT_AGNOSTIC))
        .copied()
        .unwrap_or(group.representative);
    &activities[at]
}

fn handle_summary(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cohort = cohort_param(req);

    let students = match db::list_students(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let activities = match db::list_activities(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let cells = match db::grade_cells(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let access = match db::access_map(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut groups = evidence::group_catalog(&activities, cohort.as_deref());
    groups.sort_by_key(|g| evidence::phase_rank(&g.phase));

    let group_json: Vec<Value> = groups
        .iter()
        .map(|g| {
            let rep = &activities[g.representative];
            json!({
                "activityId": rep.id,
                "name": rep.name,
                "phase": g.phase,
                "canonicalKey": g.canonical_key,
                "detail": rep.detail,
                "instanceCount": g.instances.len(),
            })
        })
        .collect();

    let mut student_json: Vec<Value> = Vec::new();
    for student in &students {
        if let Some(c) = cohort.as_deref() {
            if student.cohort != c {
                continue;
            }
        }
        let mut slots: Vec<Option<GradeCell>> = Vec::with_capacity(groups.len());
        let mut cell_json: Vec<Value> = Vec::with_capacity(groups.len());
        for group in &groups {
            let activity = student_activity(group, &activities, &student.cohort);
            let slot = cells
                .get(&(student.id.clone(), activity.id.clone()))
                .map(|&(score, letter)| GradeCell { score, letter });
            cell_json.push(match &slot {
                Some(cell) => json!({
                    "score": calc::round1(cell.score),
                    "letter": cell.letter.as_str(),
                }),
                None => Value::Null,
            });
            slots.push(slot);
        }
        let standing = calc::student_standing(&slots);
        student_json.push(json!({
            "id": student.id,
            "document": student.document,
            "firstName": student.first_name,
            "lastName": student.last_name,
            "cohort": student.cohort,
            "status": student.status,
            "pending": standing.pending,
            "average": standing.average.map(calc::round1),
            "finalLetter": standing.final_letter.as_str(),
            "lastAccess": access.get(&student.id),
            "cells": cell_json,
        }));
    }

    ok(
        &req.id,
        json!({
            "cohort": cohort,
            "activities": group_json,
            "students": student_json,
        }),
    )
}

fn handle_catalog_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cohort = cohort_param(req);
    let activities = match db::list_activities(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let listed: Vec<Value> = activities
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "name": a.name,
                "cohort": a.cohort,
                "phase": a.phase,
                "detail": a.detail,
                "canonicalKey": evidence::canonical_key(&a.detail),
            })
        })
        .collect();

    let mut groups = evidence::group_catalog(&activities, cohort.as_deref());
    groups.sort_by_key(|g| evidence::phase_rank(&g.phase));
    let grouped: Vec<Value> = groups
        .iter()
        .map(|g| {
            let instances: Vec<Value> = g
                .instances
                .iter()
                .map(|(cohort, &at)| {
                    json!({ "cohort": cohort, "activityId": activities[at].id })
                })
                .collect();
            json!({
                "canonicalKey": g.canonical_key,
                "phase": g.phase,
                "representativeId": activities[g.representative].id,
                "instances": instances,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({ "activities": listed, "groups": grouped }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.summary" => Some(handle_summary(state, req)),
        "catalog.list" => Some(handle_catalog_list(state, req)),
        _ => None,
    }
}
