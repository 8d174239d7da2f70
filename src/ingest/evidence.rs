use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::ingest::headers::{ColumnKind, EvidenceColumn};
use crate::ingest::normalize_text;

/// Cohort value of an activity not tied to any cohort.
pub const COHORT_AGNOSTIC: &str = "";

pub const DEFAULT_PHASE: &str = "ejecucion";

/// Training phases in program order. Unknown phases sort after these.
pub const PHASES: &[&str] = &[
    "induccion",
    "analisis",
    "planeacion",
    "ejecucion",
    "evaluacion",
];

pub fn phase_rank(phase: &str) -> usize {
    PHASES.iter().position(|p| *p == phase).unwrap_or(PHASES.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: String,
    /// Display name, unique within a phase ("Evidencia 3").
    pub name: String,
    /// Owning cohort, or empty for a cohort-agnostic instance.
    pub cohort: String,
    pub phase: String,
    /// Raw column text the activity was first seen under; the canonical key
    /// is always re-derived from this, never stored.
    pub detail: String,
}

fn long_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"ga(\d+)\s*-\s*(\d+)\s*-\s*aa(\d+)\s*-\s*ev(\d+)")
            .expect("guide code pattern compiles")
    })
}

fn short_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"aa(\d+)\s*-\s*ev(\d+)").expect("activity code pattern compiles"))
}

fn ev_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bev(?:idencia)?\.?\s*0*(\d+)\b").expect("evidence number pattern compiles")
    })
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("integer pattern compiles"))
}

/// Code numbers compare without padding: EV01 and EV1 are one evidence.
fn strip_zeros(digits: &str) -> &str {
    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        "0"
    } else {
        stripped
    }
}

/// Canonical key shared by the textual variants of one evidence name. Rules
/// apply in specificity order against the normalized text: full guide code,
/// short activity code, `ev<N>` shorthand, first embedded integer, and
/// finally the whole normalized text.
pub fn canonical_key(detail: &str) -> String {
    let normalized = normalize_text(detail);
    if let Some(caps) = long_code_re().captures(&normalized) {
        return format!(
            "ga{}-{}-aa{}-ev{}",
            strip_zeros(&caps[1]),
            strip_zeros(&caps[2]),
            strip_zeros(&caps[3]),
            strip_zeros(&caps[4])
        );
    }
    if let Some(caps) = short_code_re().captures(&normalized) {
        return format!("aa{}-ev{}", strip_zeros(&caps[1]), strip_zeros(&caps[2]));
    }
    if let Some(caps) = ev_number_re().captures(&normalized) {
        return format!("ev{}", &caps[1]);
    }
    if let Some(m) = integer_re().find(&normalized) {
        let digits = m.as_str().trim_start_matches('0');
        return if digits.is_empty() { "0".to_string() } else { digits.to_string() };
    }
    normalized
}

/// An evidence column group resolved against the catalog. Score and letter
/// sources point at columns of the decoded sheet; instances map cohorts to
/// existing activity ids for per-student targeting.
#[derive(Debug, Clone)]
pub struct EvidenceGroup {
    pub canonical_key: String,
    pub phase: String,
    pub score_col: Option<usize>,
    pub letter_col: Option<usize>,
    /// Activity resolved or minted for the import's own cohort scope.
    pub scope_activity_id: String,
    instances: HashMap<String, String>,
}

impl EvidenceGroup {
    /// Grade target for one student: own-cohort instance, then the
    /// cohort-agnostic one, then the import-scope instance.
    pub fn target_activity(&self, cohort: &str) -> &str {
        if let Some(id) = self.instances.get(cohort) {
            return id;
        }
        if let Some(id) = self.instances.get(COHORT_AGNOSTIC) {
            return id;
        }
        &self.scope_activity_id
    }
}

/// Activities that must be inserted before grades can land. Nothing here
/// touches storage; the caller owns the transaction.
#[derive(Debug, Clone, Default)]
pub struct CatalogChangeSet {
    pub created: Vec<Activity>,
}

#[derive(Debug)]
pub struct EvidenceResolution {
    pub groups: Vec<EvidenceGroup>,
    pub change_set: CatalogChangeSet,
}

/// Folds classified evidence columns into groups keyed by (canonical key,
/// phase) and resolves each group against the catalog, minting activities
/// where no instance covers the import's cohort scope.
pub fn resolve_columns(
    columns: &[EvidenceColumn],
    catalog: &[Activity],
    cohort_scope: &str,
    default_phase: &str,
) -> EvidenceResolution {
    // (canonical key, phase) -> cohort -> activity id, plus how many
    // activities each phase already has for display-name numbering.
    let mut known: HashMap<(String, String), HashMap<String, String>> = HashMap::new();
    let mut phase_counts: HashMap<String, usize> = HashMap::new();
    for activity in catalog {
        let key = (canonical_key(&activity.detail), activity.phase.clone());
        known
            .entry(key)
            .or_default()
            .entry(activity.cohort.clone())
            .or_insert_with(|| activity.id.clone());
        *phase_counts.entry(activity.phase.clone()).or_insert(0) += 1;
    }

    let mut groups: Vec<EvidenceGroup> = Vec::new();
    let mut group_at: HashMap<(String, String), usize> = HashMap::new();
    let mut change_set = CatalogChangeSet::default();

    for column in columns {
        let phase = column
            .phase_hint
            .clone()
            .unwrap_or_else(|| default_phase.to_string());
        let key = (canonical_key(&column.base_name), phase.clone());

        let pos = match group_at.get(&key) {
            Some(&pos) => pos,
            None => {
                let instances = known.get(&key).cloned().unwrap_or_default();
                let scope_activity_id = match instances
                    .get(cohort_scope)
                    .or_else(|| instances.get(COHORT_AGNOSTIC))
                {
                    Some(id) => id.clone(),
                    None => {
                        let count = phase_counts.entry(phase.clone()).or_insert(0);
                        *count += 1;
                        let activity = Activity {
                            id: Uuid::new_v4().to_string(),
                            name: format!("Evidencia {}", count),
                            cohort: cohort_scope.to_string(),
                            phase: phase.clone(),
                            detail: column.base_name.clone(),
                        };
                        let id = activity.id.clone();
                        change_set.created.push(activity);
                        id
                    }
                };
                let mut instances = instances;
                instances
                    .entry(cohort_scope.to_string())
                    .or_insert_with(|| scope_activity_id.clone());
                groups.push(EvidenceGroup {
                    canonical_key: key.0.clone(),
                    phase: phase.clone(),
                    score_col: None,
                    letter_col: None,
                    scope_activity_id,
                    instances,
                });
                group_at.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };

        let group = &mut groups[pos];
        match column.kind {
            ColumnKind::Score => {
                if group.score_col.is_none() {
                    group.score_col = Some(column.index);
                }
            }
            ColumnKind::Letter => {
                if group.letter_col.is_none() {
                    group.letter_col = Some(column.index);
                }
            }
            ColumnKind::Combined => {
                if group.score_col.is_none() {
                    group.score_col = Some(column.index);
                }
                if group.letter_col.is_none() {
                    group.letter_col = Some(column.index);
                }
            }
        }
    }

    EvidenceResolution { groups, change_set }
}

/// One (canonical key, phase) group over the stored catalog, for views that
/// show an evidence once across its cohort instances.
#[derive(Debug, Clone)]
pub struct CatalogGroup {
    pub canonical_key: String,
    pub phase: String,
    /// Position of the representative activity in the input slice.
    pub representative: usize,
    /// cohort -> position in the input slice.
    pub instances: HashMap<String, usize>,
}

/// Groups catalog activities by composite key, in first-seen order. With a
/// cohort filter, only groups visible to that cohort survive and the
/// representative is that cohort's instance (or the agnostic one).
pub fn group_catalog(activities: &[Activity], cohort: Option<&str>) -> Vec<CatalogGroup> {
    let mut groups: Vec<CatalogGroup> = Vec::new();
    let mut at: HashMap<(String, String), usize> = HashMap::new();
    for (i, activity) in activities.iter().enumerate() {
        let key = (canonical_key(&activity.detail), activity.phase.clone());
        match at.get(&key) {
            Some(&pos) => {
                groups[pos]
                    .instances
                    .entry(activity.cohort.clone())
                    .or_insert(i);
            }
            None => {
                let mut instances = HashMap::new();
                instances.insert(activity.cohort.clone(), i);
                groups.push(CatalogGroup {
                    canonical_key: key.0.clone(),
                    phase: key.1.clone(),
                    representative: i,
                    instances,
                });
                at.insert(key, groups.len() - 1);
            }
        }
    }

    let Some(cohort) = cohort else {
        return groups;
    };
    groups
        .into_iter()
        .filter_map(|mut g| {
            let rep = g
                .instances
                .get(cohort)
                .or_else(|| g.instances.get(COHORT_AGNOSTIC))
                .copied()?;
            g.representative = rep;
            Some(g)
        })
        .collect()
}
