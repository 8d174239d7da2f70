use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::calc::{self, Letter};
use crate::ingest::dates;
use crate::ingest::decode::CellValue;
use crate::ingest::evidence::{self, Activity, CatalogChangeSet, EvidenceGroup};
use crate::ingest::headers::{self, HeaderLayout};
use crate::ingest::identity::{RosterIndex, RowIdentity, StudentRecord};

/// Fatal import failure. One of these rejects the whole file; per-row
/// problems become warnings instead.
#[derive(Debug, Clone)]
pub struct ImportError {
    pub code: &'static str,
    pub message: String,
}

impl ImportError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ImportError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub updated_count: usize,
    pub unmatched_count: usize,
    pub no_date_count: usize,
}

impl ImportResult {
    pub fn summary_line(&self) -> String {
        format!(
            "{} actualizados, {} sin coincidencia, {} sin fecha",
            self.updated_count, self.unmatched_count, self.no_date_count
        )
    }
}

#[derive(Debug, Clone)]
pub struct GradeUpsert {
    pub student_id: String,
    pub activity_id: String,
    pub score: f64,
    pub letter: Letter,
}

#[derive(Debug, Clone)]
pub struct AccessUpsert {
    pub student_id: String,
    pub last_access: String,
}

pub struct PipelineSettings {
    pub default_phase: String,
    pub passing_score: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_phase: evidence::DEFAULT_PHASE.to_string(),
            passing_score: 70.0,
        }
    }
}

/// Everything an evidence-report import wants to persist, computed without
/// touching storage. Applying the plan is the caller's single transaction.
#[derive(Debug)]
pub struct EvidenceImportPlan {
    pub result: ImportResult,
    pub rows_total: usize,
    pub group_count: usize,
    /// One summary object per resolved group, for the preview UI.
    pub group_summaries: Vec<Value>,
    pub change_set: CatalogChangeSet,
    pub grade_upserts: Vec<GradeUpsert>,
    pub access_upserts: Vec<AccessUpsert>,
    pub warnings: Vec<Value>,
}

#[derive(Debug)]
pub struct AccessImportPlan {
    pub result: ImportResult,
    pub rows_total: usize,
    pub access_upserts: Vec<AccessUpsert>,
    pub warnings: Vec<Value>,
}

pub fn plan_evidence_import(
    rows: &[Vec<CellValue>],
    roster: &[StudentRecord],
    catalog: &[Activity],
    cohort_scope: &str,
    settings: &PipelineSettings,
) -> Result<EvidenceImportPlan, ImportError> {
    let (layout, data) = split_header(rows)?;
    if layout.evidence.is_empty() {
        return Err(ImportError::new(
            "no_evidence_columns",
            "no evidence columns recognized in the header row",
        ));
    }
    let resolution =
        evidence::resolve_columns(&layout.evidence, catalog, cohort_scope, &settings.default_phase);
    let index = RosterIndex::build(roster);

    let mut result = ImportResult::default();
    let mut warnings: Vec<Value> = Vec::new();
    let mut grade_upserts: Vec<GradeUpsert> = Vec::new();
    let mut newest_access: HashMap<String, String> = HashMap::new();
    let mut rows_total = 0usize;

    for (line, row) in data {
        rows_total += 1;
        let identity = extract_identity(&layout, row);
        let Some(student) = index.resolve(&identity) else {
            result.unmatched_count += 1;
            warnings.push(json!({
                "line": line,
                "code": "row_unmatched",
                "message": format!("no roster match for '{}'", identity.display()),
            }));
            continue;
        };
        result.updated_count += 1;

        if let Some(col) = layout.access_date {
            let cell = cell_at(row, col);
            if !cell.is_empty() {
                match dates::normalize_timestamp(cell) {
                    Some(ts) => remember_newest(&mut newest_access, &student.id, ts),
                    None => warnings.push(json!({
                        "line": line,
                        "code": "invalid_date",
                        "message": format!("unparseable access date '{}'", cell.as_text()),
                    })),
                }
            }
        }

        for group in &resolution.groups {
            if let Some((score, letter)) = read_grade(group, row, settings) {
                grade_upserts.push(GradeUpsert {
                    student_id: student.id.clone(),
                    activity_id: group.target_activity(&student.cohort).to_string(),
                    score,
                    letter,
                });
            }
        }
    }

    let group_summaries: Vec<Value> = resolution
        .groups
        .iter()
        .map(|g| {
            json!({
                "canonicalKey": g.canonical_key,
                "phase": g.phase,
                "hasScoreColumn": g.score_col.is_some(),
                "hasLetterColumn": g.letter_col.is_some(),
                "activityId": g.scope_activity_id,
            })
        })
        .collect();

    Ok(EvidenceImportPlan {
        result,
        rows_total,
        group_count: resolution.groups.len(),
        group_summaries,
        change_set: resolution.change_set,
        grade_upserts,
        access_upserts: drain_access(newest_access),
        warnings,
    })
}

pub fn plan_access_import(
    rows: &[Vec<CellValue>],
    roster: &[StudentRecord],
) -> Result<AccessImportPlan, ImportError> {
    let (layout, data) = split_header(rows)?;
    let Some(date_col) = layout.access_date else {
        return Err(ImportError::new(
            "no_access_column",
            "no last-access column recognized in the header row",
        ));
    };
    let index = RosterIndex::build(roster);

    let mut result = ImportResult::default();
    let mut warnings: Vec<Value> = Vec::new();
    let mut newest_access: HashMap<String, String> = HashMap::new();
    let mut rows_total = 0usize;

    for (line, row) in data {
        rows_total += 1;
        let identity = extract_identity(&layout, row);
        let Some(student) = index.resolve(&identity) else {
            result.unmatched_count += 1;
            warnings.push(json!({
                "line": line,
                "code": "row_unmatched",
                "message": format!("no roster match for '{}'", identity.display()),
            }));
            continue;
        };
        let cell = cell_at(row, date_col);
        if cell.is_empty() {
            result.no_date_count += 1;
            warnings.push(json!({
                "line": line,
                "code": "missing_date",
                "message": format!("'{}' has no access date", identity.display()),
            }));
            continue;
        }
        match dates::normalize_timestamp(cell) {
            Some(ts) => {
                result.updated_count += 1;
                remember_newest(&mut newest_access, &student.id, ts);
            }
            None => {
                result.no_date_count += 1;
                warnings.push(json!({
                    "line": line,
                    "code": "invalid_date",
                    "message": format!("unparseable access date '{}'", cell.as_text()),
                }));
            }
        }
    }

    Ok(AccessImportPlan {
        result,
        rows_total,
        access_upserts: drain_access(newest_access),
        warnings,
    })
}

/// Finds the header row, classifies it, and pairs each later non-empty row
/// with its 1-based line number.
fn split_header(
    rows: &[Vec<CellValue>],
) -> Result<(HeaderLayout, Vec<(usize, &Vec<CellValue>)>), ImportError> {
    let header_at = rows
        .iter()
        .position(|row| !row_is_empty(row))
        .ok_or_else(|| ImportError::new("empty_file", "file has no data rows"))?;
    let headers: Vec<String> = rows[header_at].iter().map(|c| c.as_text()).collect();
    let layout = headers::classify_headers(&headers);
    if !layout.has_identity_column() {
        return Err(ImportError::new(
            "no_header_row",
            "no identity column recognized in the header row",
        ));
    }
    let data = rows
        .iter()
        .enumerate()
        .skip(header_at + 1)
        .filter(|(_, row)| !row_is_empty(row))
        .map(|(i, row)| (i + 1, row))
        .collect();
    Ok((layout, data))
}

fn row_is_empty(row: &[CellValue]) -> bool {
    row.iter().all(|c| c.is_empty())
}

fn cell_at(row: &[CellValue], col: usize) -> &CellValue {
    row.get(col).unwrap_or(&CellValue::Empty)
}

fn text_at(row: &[CellValue], col: Option<usize>) -> String {
    match col {
        Some(col) => cell_at(row, col).as_text(),
        None => String::new(),
    }
}

fn extract_identity(layout: &HeaderLayout, row: &[CellValue]) -> RowIdentity {
    RowIdentity {
        document_text: text_at(row, layout.document),
        first_name: text_at(row, layout.first_name),
        last_name: text_at(row, layout.last_name),
        full_name_text: text_at(row, layout.full_name),
        username_text: text_at(row, layout.username),
        email_text: text_at(row, layout.email),
        secondary_email_text: text_at(row, layout.secondary_email),
    }
}

/// Reads one grade from a row. An explicit letter wins over the derived one;
/// a lone letter implies its default score; a lone score derives its letter
/// from the passing threshold. Both empty means no entry at all.
fn read_grade(
    group: &EvidenceGroup,
    row: &[CellValue],
    settings: &PipelineSettings,
) -> Option<(f64, Letter)> {
    let score = group
        .score_col
        .map(|col| cell_at(row, col))
        .and_then(parse_score);
    let letter = group
        .letter_col
        .map(|col| cell_at(row, col))
        .filter(|cell| !cell.is_empty())
        .and_then(|cell| Letter::parse(&cell.as_text()));

    match (score, letter) {
        (Some(score), Some(letter)) => Some((score, letter)),
        (Some(score), None) => Some((score, calc::letter_for_score(score, settings.passing_score))),
        (None, Some(letter)) => Some((calc::letter_default_score(letter), letter)),
        (None, None) => None,
    }
}

fn parse_score(cell: &CellValue) -> Option<f64> {
    let n = match cell {
        CellValue::Number(n) => *n,
        CellValue::Text(t) => {
            let t = t.trim().trim_end_matches('%').trim();
            if t.is_empty() {
                return None;
            }
            // Comma decimals come in from regional exports.
            let t = if t.contains(',') && !t.contains('.') {
                t.replace(',', ".")
            } else {
                t.to_string()
            };
            t.parse::<f64>().ok()?
        }
        CellValue::Empty => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.clamp(0.0, 100.0))
}

fn remember_newest(map: &mut HashMap<String, String>, student_id: &str, ts: String) {
    let keep = match map.get(student_id) {
        Some(existing) => ts.as_str() > existing.as_str(),
        None => true,
    };
    if keep {
        map.insert(student_id.to_string(), ts);
    }
}

fn drain_access(map: HashMap<String, String>) -> Vec<AccessUpsert> {
    let mut out: Vec<AccessUpsert> = map
        .into_iter()
        .map(|(student_id, last_access)| AccessUpsert {
            student_id,
            last_access,
        })
        .collect();
    out.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::decode::decode_table;

    fn student(id: &str, document: &str, first: &str, last: &str) -> StudentRecord {
        StudentRecord {
            id: id.to_string(),
            document: document.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: String::new(),
            username: String::new(),
            cohort: "2823456".to_string(),
            status: "active".to_string(),
        }
    }

    fn roster() -> Vec<StudentRecord> {
        vec![
            student("s1", "1001", "Ana", "Ruiz"),
            student("s2", "1002", "Luis", "Mora"),
        ]
    }

    fn plan_csv(csv: &str) -> EvidenceImportPlan {
        let rows = decode_table(csv.as_bytes()).expect("decode");
        plan_evidence_import(&rows, &roster(), &[], "2823456", &PipelineSettings::default())
            .expect("plan")
    }

    #[test]
    fn evidence_counters_partition_data_rows() {
        let plan = plan_csv(
            "Documento;AA1-EV1 (Real);AA1-EV1 (Letra)\n\
             1001;85;A\n\
             9999;10;D\n\
             1002;;\n",
        );
        assert_eq!(plan.rows_total, 3);
        assert_eq!(plan.result.updated_count, 2);
        assert_eq!(plan.result.unmatched_count, 1);
        assert_eq!(plan.result.no_date_count, 0);
        assert_eq!(
            plan.result.updated_count + plan.result.unmatched_count,
            plan.rows_total
        );
        // The matched row with both cells blank produces no grade.
        assert_eq!(plan.grade_upserts.len(), 1);
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn score_and_letter_twins_produce_one_entry() {
        let plan = plan_csv(
            "Documento;GA1-2-AA1-EV1 (Real);GA1-2-AA1-EV1 (Letra)\n\
             1001;85;A\n",
        );
        assert_eq!(plan.group_count, 1);
        assert_eq!(plan.group_summaries[0]["canonicalKey"], json!("ga1-2-aa1-ev1"));
        assert_eq!(plan.group_summaries[0]["hasScoreColumn"], json!(true));
        assert_eq!(plan.group_summaries[0]["hasLetterColumn"], json!(true));
        assert_eq!(plan.grade_upserts.len(), 1);
        let up = &plan.grade_upserts[0];
        assert_eq!(up.score, 85.0);
        assert_eq!(up.letter, Letter::Approved);
    }

    #[test]
    fn second_email_column_never_mints_an_activity() {
        let plan = plan_csv(
            "Documento;Correo institucional;Correo personal;AA1-EV1\n\
             1001;ana.ruiz@misena.edu.co;ana.ruiz@gmail.com;80\n",
        );
        assert_eq!(plan.group_count, 1);
        assert_eq!(plan.change_set.created.len(), 1);
        assert_eq!(plan.change_set.created[0].detail, "AA1-EV1");
        assert_eq!(plan.grade_upserts.len(), 1);
    }

    #[test]
    fn explicit_letter_overrides_threshold() {
        let plan = plan_csv(
            "Documento;AA1-EV1 (Real);AA1-EV1 (Letra)\n\
             1001;95;D\n",
        );
        assert_eq!(plan.grade_upserts[0].letter, Letter::Failed);
        assert_eq!(plan.grade_upserts[0].score, 95.0);
    }

    #[test]
    fn lone_score_derives_letter_lone_letter_implies_score() {
        let plan = plan_csv(
            "Documento;AA1-EV1;AA2-EV1\n\
             1001;64;A\n",
        );
        assert_eq!(plan.grade_upserts.len(), 2);
        assert_eq!(plan.grade_upserts[0].score, 64.0);
        assert_eq!(plan.grade_upserts[0].letter, Letter::Failed);
        assert_eq!(plan.grade_upserts[1].score, 100.0);
        assert_eq!(plan.grade_upserts[1].letter, Letter::Approved);
    }

    #[test]
    fn comma_decimal_scores_parse() {
        let plan = plan_csv(
            "Documento;AA1-EV1\n\
             1001;87,5\n",
        );
        assert_eq!(plan.grade_upserts[0].score, 87.5);
    }

    #[test]
    fn unmatched_rows_never_block_the_rest() {
        let plan = plan_csv(
            "Documento;AA1-EV1\n\
             9999;55\n\
             1001;91\n",
        );
        assert_eq!(plan.result.unmatched_count, 1);
        assert_eq!(plan.result.updated_count, 1);
        assert_eq!(plan.grade_upserts.len(), 1);
        assert_eq!(plan.grade_upserts[0].student_id, "s1");
    }

    #[test]
    fn missing_headers_are_fatal() {
        let rows = decode_table("basura;sin;sentido\n1;2;3\n".as_bytes()).expect("decode");
        let err = plan_evidence_import(
            &rows,
            &roster(),
            &[],
            "",
            &PipelineSettings::default(),
        )
        .expect_err("structural");
        assert_eq!(err.code, "no_header_row");

        let rows = decode_table("".as_bytes()).expect("decode");
        let err = plan_evidence_import(
            &rows,
            &roster(),
            &[],
            "",
            &PipelineSettings::default(),
        )
        .expect_err("structural");
        assert_eq!(err.code, "empty_file");
    }

    #[test]
    fn evidence_file_without_evidence_columns_is_fatal() {
        let rows = decode_table("Documento;Último acceso\n1001;45678\n".as_bytes())
            .expect("decode");
        let err = plan_evidence_import(
            &rows,
            &roster(),
            &[],
            "",
            &PipelineSettings::default(),
        )
        .expect_err("structural");
        assert_eq!(err.code, "no_evidence_columns");
    }

    #[test]
    fn access_counters_partition_three_ways() {
        let rows = decode_table(
            "Documento;Último acceso al curso\n\
             1001;45678\n\
             1002;nunca\n\
             9999;21/01/2025\n"
                .as_bytes(),
        )
        .expect("decode");
        let plan = plan_access_import(&rows, &roster()).expect("plan");
        assert_eq!(plan.rows_total, 3);
        assert_eq!(plan.result.updated_count, 1);
        assert_eq!(plan.result.no_date_count, 1);
        assert_eq!(plan.result.unmatched_count, 1);
        assert_eq!(
            plan.result.updated_count + plan.result.no_date_count + plan.result.unmatched_count,
            plan.rows_total
        );
        assert_eq!(plan.access_upserts.len(), 1);
        assert_eq!(plan.access_upserts[0].last_access, "2025-01-21 00:00:00");
    }

    #[test]
    fn access_file_without_date_column_is_fatal() {
        let rows = decode_table("Documento;Nombre\n1001;Ana\n".as_bytes()).expect("decode");
        let err = plan_access_import(&rows, &roster()).expect_err("structural");
        assert_eq!(err.code, "no_access_column");
    }

    #[test]
    fn duplicate_rows_keep_the_newest_access() {
        let rows = decode_table(
            "Documento;Último acceso al curso\n\
             1001;21/01/2025 08:00\n\
             1001;21/01/2025 17:30\n\
             1001;20/01/2025 23:59\n"
                .as_bytes(),
        )
        .expect("decode");
        let plan = plan_access_import(&rows, &roster()).expect("plan");
        assert_eq!(plan.access_upserts.len(), 1);
        assert_eq!(plan.access_upserts[0].last_access, "2025-01-21 17:30:00");
    }

    #[test]
    fn empty_date_never_coerces_to_day_zero() {
        let rows = decode_table(
            "Documento;Último acceso al curso\n1001;\n".as_bytes(),
        )
        .expect("decode");
        let plan = plan_access_import(&rows, &roster()).expect("plan");
        assert!(plan.access_upserts.is_empty());
        assert_eq!(plan.result.no_date_count, 1);
    }
}
