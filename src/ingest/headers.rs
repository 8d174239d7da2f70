use std::sync::OnceLock;

use regex::Regex;

use crate::ingest::normalize_text;

/// What a residual (non-identity) column carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Numeric score only, e.g. `EV1 (Real)`.
    Score,
    /// Letter only, e.g. `EV1 (Letra)`.
    Letter,
    /// Unsuffixed column; may hold either a score or a letter per cell.
    Combined,
}

#[derive(Debug, Clone)]
pub struct EvidenceColumn {
    pub index: usize,
    /// Header text with the score/letter suffix stripped; feeds the
    /// canonical-key derivation.
    pub base_name: String,
    pub kind: ColumnKind,
    pub phase_hint: Option<String>,
}

/// Column roles recognized in one header row. Indices point into the row.
#[derive(Debug, Clone, Default)]
pub struct HeaderLayout {
    pub document: Option<usize>,
    pub username: Option<usize>,
    pub email: Option<usize>,
    /// Second email-like header (institutional vs personal address).
    pub secondary_email: Option<usize>,
    pub full_name: Option<usize>,
    pub last_name: Option<usize>,
    pub first_name: Option<usize>,
    pub access_date: Option<usize>,
    pub evidence: Vec<EvidenceColumn>,
}

impl HeaderLayout {
    pub fn has_identity_column(&self) -> bool {
        self.document.is_some()
            || self.username.is_some()
            || self.email.is_some()
            || self.full_name.is_some()
            || self.last_name.is_some()
            || self.first_name.is_some()
    }
}

// Administrative columns that must never be mistaken for evidence. An exact
// keyword can still claim one (so "nombre de usuario" stays a username), but
// containment rules and the evidence fallback skip them.
const EXCLUDED_HEADERS: &[&str] = &[
    "nombre de usuario",
    "tipo de documento",
    "tipo documento",
    "estado",
    "institucion",
    "centro de formacion",
    "programa",
    "departamento",
    "ciudad",
    "pais",
    "grupos",
    "roles",
    "telefono",
    "celular",
    "direccion",
    "observaciones",
];

const DOCUMENT_EXACT: &[&str] = &[
    "documento",
    "numero de documento",
    "no. de documento",
    "no de documento",
    "documento de identidad",
    "numero de identificacion",
    "identificacion",
    "cedula",
    "id number",
];
const DOCUMENT_CONTAINS: &[&str] = &["documento", "identificacion", "cedula"];

const USERNAME_EXACT: &[&str] = &[
    "nombre de usuario",
    "usuario",
    "nombre usuario",
    "username",
    "login",
];
const USERNAME_CONTAINS: &[&str] = &["usuario", "username", "login"];

const EMAIL_EXACT: &[&str] = &[
    "direccion de correo",
    "correo electronico",
    "correo",
    "email",
    "e-mail",
];
const EMAIL_CONTAINS: &[&str] = &["correo", "email", "e-mail", "mail"];

const FULL_NAME_EXACT: &[&str] = &[
    "nombre completo",
    "nombres y apellidos",
    "apellidos y nombres",
    "aprendiz",
    "estudiante",
];
const FULL_NAME_CONTAINS: &[&str] = &[
    "nombre completo",
    "nombres y apellidos",
    "apellidos y nombres",
];

const LAST_NAME_EXACT: &[&str] = &["apellidos", "apellido", "apellido(s)"];
const LAST_NAME_CONTAINS: &[&str] = &["apellido"];

const FIRST_NAME_EXACT: &[&str] = &["nombres", "nombre", "nombre(s)", "primer nombre"];
const FIRST_NAME_CONTAINS: &[&str] = &["nombre"];

const ACCESS_EXACT: &[&str] = &[
    "ultimo acceso",
    "ultimo acceso al curso",
    "fecha de ultimo acceso",
    "ultimo ingreso",
    "fecha de ultimo ingreso",
    "ultima visita",
];
const ACCESS_CONTAINS: &[&str] = &["acceso", "ultimo ingreso", "ultima visita"];

const PHASE_KEYWORDS: &[(&str, &str)] = &[
    ("induccion", "induccion"),
    ("analisis", "analisis"),
    ("planeacion", "planeacion"),
    ("planificacion", "planeacion"),
    ("ejecucion", "ejecucion"),
    ("evaluacion", "evaluacion"),
];

fn letter_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[\s\-]*\(?\s*letra\s*\)?\s*$").expect("letter suffix pattern compiles")
    })
}

fn score_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[\s\-]*\(?\s*(?:real|promedio|nota|n[uú]mero|score)\s*\)?\s*$")
            .expect("score suffix pattern compiles")
    })
}

/// Assigns a role to every header. Identity and access-date roles claim their
/// columns in a fixed priority order; whatever survives unclaimed and
/// unexcluded is an evidence column.
pub fn classify_headers(headers: &[String]) -> HeaderLayout {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_text(h)).collect();
    let excluded: Vec<bool> = normalized
        .iter()
        .map(|h| EXCLUDED_HEADERS.contains(&h.as_str()))
        .collect();
    let mut claimed = vec![false; headers.len()];

    let mut layout = HeaderLayout::default();
    layout.document = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        DOCUMENT_EXACT,
        DOCUMENT_CONTAINS,
    );
    layout.username = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        USERNAME_EXACT,
        USERNAME_CONTAINS,
    );
    layout.email = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        EMAIL_EXACT,
        EMAIL_CONTAINS,
    );
    // The same rules run once more: a second email-like header is another
    // identity input, not an evidence column.
    layout.secondary_email = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        EMAIL_EXACT,
        EMAIL_CONTAINS,
    );
    // Full name before the split name roles, so "nombre completo" never
    // falls to the bare "nombre" rule.
    layout.full_name = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        FULL_NAME_EXACT,
        FULL_NAME_CONTAINS,
    );
    layout.last_name = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        LAST_NAME_EXACT,
        LAST_NAME_CONTAINS,
    );
    layout.first_name = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        FIRST_NAME_EXACT,
        FIRST_NAME_CONTAINS,
    );
    layout.access_date = claim_role(
        &normalized,
        &excluded,
        &mut claimed,
        ACCESS_EXACT,
        ACCESS_CONTAINS,
    );

    for (i, header) in headers.iter().enumerate() {
        if claimed[i] || excluded[i] || normalized[i].is_empty() {
            continue;
        }
        layout.evidence.push(evidence_column(i, header));
    }
    layout
}

fn claim_role(
    normalized: &[String],
    excluded: &[bool],
    claimed: &mut [bool],
    exact: &[&str],
    contains: &[&str],
) -> Option<usize> {
    for keyword in exact {
        for (i, header) in normalized.iter().enumerate() {
            if !claimed[i] && header == keyword {
                claimed[i] = true;
                return Some(i);
            }
        }
    }
    for keyword in contains {
        for (i, header) in normalized.iter().enumerate() {
            if !claimed[i] && !excluded[i] && !header.is_empty() && header.contains(keyword) {
                claimed[i] = true;
                return Some(i);
            }
        }
    }
    None
}

fn evidence_column(index: usize, raw: &str) -> EvidenceColumn {
    let trimmed = raw.trim();
    let (kind, base) = if let Some(m) = letter_suffix_re().find(trimmed) {
        (ColumnKind::Letter, trimmed[..m.start()].trim())
    } else if let Some(m) = score_suffix_re().find(trimmed) {
        (ColumnKind::Score, trimmed[..m.start()].trim())
    } else {
        (ColumnKind::Combined, trimmed)
    };
    // A header that is nothing but a suffix ("Nota") keeps its full text as
    // the base so its canonical key is not empty.
    let base = if base.is_empty() { trimmed } else { base };
    EvidenceColumn {
        index,
        base_name: base.to_string(),
        kind,
        phase_hint: phase_hint(trimmed),
    }
}

fn phase_hint(raw: &str) -> Option<String> {
    let normalized = normalize_text(raw);
    PHASE_KEYWORDS
        .iter()
        .find(|(keyword, _)| normalized.contains(keyword))
        .map(|(_, canonical)| (*canonical).to_string())
}
