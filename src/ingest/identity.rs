use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::ingest::normalize_text;

/// Roster row as the resolver sees it. Loading from storage happens
/// elsewhere; resolution itself touches no I/O.
#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: String,
    pub document: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub username: String,
    pub cohort: String,
    pub status: String,
}

/// Identity fields pulled out of one import row. Absent columns arrive as
/// empty strings.
#[derive(Debug, Clone, Default)]
pub struct RowIdentity {
    pub document_text: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name_text: String,
    pub username_text: String,
    pub email_text: String,
    pub secondary_email_text: String,
}

impl RowIdentity {
    /// Best human-readable label for warnings about this row.
    pub fn display(&self) -> String {
        if !self.full_name_text.trim().is_empty() {
            return self.full_name_text.trim().to_string();
        }
        let joined = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        if !joined.trim().is_empty() {
            return joined.trim().to_string();
        }
        if !self.username_text.trim().is_empty() {
            return self.username_text.trim().to_string();
        }
        self.document_text.trim().to_string()
    }
}

fn scientific_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d+(?:[.,]\d+)?[eE][+-]?\d+$").expect("scientific pattern compiles")
    })
}

/// Document matching key: digits only, leading zeros stripped. Spreadsheet
/// cells that degraded to scientific notation are rebuilt to the full
/// integer first, so `7.89E+4` and `0078900` both key as `78900`.
pub fn document_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let digits: String = if scientific_re().is_match(trimmed) {
        let n = trimmed.replace(',', ".").parse::<f64>().ok()?;
        if !n.is_finite() || n < 0.0 || n > 1e15 {
            return None;
        }
        format!("{}", n.round() as i64)
    } else {
        trimmed.chars().filter(|c| c.is_ascii_digit()).collect()
    };
    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

/// Name key: diacritics folded, lowercased, punctuation collapsed to single
/// spaces. "Pérez, Juan" and "perez juan" produce the same key.
pub fn name_key(raw: &str) -> String {
    let folded = normalize_text(raw);
    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn normalize_handle(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Lookup tables over one roster snapshot. On key collisions the earliest
/// roster row wins, everywhere, so resolution is deterministic for a given
/// roster order.
pub struct RosterIndex<'a> {
    students: &'a [StudentRecord],
    by_document: HashMap<String, usize>,
    by_email: HashMap<String, usize>,
    by_username: HashMap<String, usize>,
    by_name_key: HashMap<String, usize>,
    // Kept in roster order; the substring pass must not inherit hash-map
    // iteration order.
    email_local_parts: Vec<(String, usize)>,
    scan_name_keys: Vec<(String, usize)>,
}

impl<'a> RosterIndex<'a> {
    pub fn build(students: &'a [StudentRecord]) -> Self {
        let mut by_document = HashMap::new();
        let mut by_email = HashMap::new();
        let mut by_username = HashMap::new();
        let mut by_name_key = HashMap::new();
        let mut email_local_parts = Vec::new();
        let mut scan_name_keys = Vec::new();

        for (i, student) in students.iter().enumerate() {
            if let Some(key) = document_key(&student.document) {
                by_document.entry(key).or_insert(i);
            }
            let email = normalize_handle(&student.email);
            if !email.is_empty() {
                by_email.entry(email.clone()).or_insert(i);
                if let Some((local, _)) = email.split_once('@') {
                    if !local.is_empty() {
                        email_local_parts.push((local.to_string(), i));
                    }
                }
            }
            let username = normalize_handle(&student.username);
            if !username.is_empty() {
                by_username.entry(username).or_insert(i);
            }
            let first = name_key(&student.first_name);
            let last = name_key(&student.last_name);
            if !first.is_empty() || !last.is_empty() {
                let fl = join_key(&first, &last);
                let lf = join_key(&last, &first);
                by_name_key.entry(fl.clone()).or_insert(i);
                by_name_key.entry(lf).or_insert(i);
                scan_name_keys.push((fl, i));
            }
        }

        Self {
            students,
            by_document,
            by_email,
            by_username,
            by_name_key,
            email_local_parts,
            scan_name_keys,
        }
    }

    pub fn resolve(&self, row: &RowIdentity) -> Option<&'a StudentRecord> {
        self.resolve_index(row).map(|i| &self.students[i])
    }

    fn resolve_index(&self, row: &RowIdentity) -> Option<usize> {
        // 1. Document number.
        if let Some(key) = document_key(&row.document_text) {
            if let Some(&i) = self.by_document.get(&key) {
                return Some(i);
            }
        }
        // 2. A document cell sometimes holds an email address instead.
        if row.document_text.contains('@') {
            if let Some(&i) = self.by_email.get(&normalize_handle(&row.document_text)) {
                return Some(i);
            }
        }
        // 3. Username, exact.
        let username = normalize_handle(&row.username_text);
        if !username.is_empty() {
            if let Some(&i) = self.by_username.get(&username) {
                return Some(i);
            }
        }
        // 4. Email columns, primary then secondary, against both email and
        // username rosters.
        for raw in [&row.email_text, &row.secondary_email_text] {
            let email = normalize_handle(raw);
            if email.is_empty() {
                continue;
            }
            if let Some(&i) = self.by_email.get(&email) {
                return Some(i);
            }
            if let Some(&i) = self.by_username.get(&email) {
                return Some(i);
            }
        }
        // 5. Username against the local part of roster emails; LMS accounts
        // are routinely provisioned that way.
        if !username.is_empty() {
            for (local, i) in &self.email_local_parts {
                if local == &username {
                    return Some(*i);
                }
            }
        }
        // 6. Names: exact permutation keys first, then the token-subset scan.
        let keys = row_name_keys(row);
        for key in &keys {
            if let Some(&i) = self.by_name_key.get(key) {
                return Some(i);
            }
        }
        let tokens: Vec<&str> = match keys.first() {
            Some(k) => k.split(' ').filter(|t| !t.is_empty()).collect(),
            None => return None,
        };
        if tokens.is_empty() {
            return None;
        }
        for (candidate, i) in &self.scan_name_keys {
            if tokens.iter().all(|t| candidate.contains(t)) {
                return Some(*i);
            }
        }
        None
    }
}

fn join_key(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    format!("{} {}", a, b)
}

fn row_name_keys(row: &RowIdentity) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let full = name_key(&row.full_name_text);
    if !full.is_empty() {
        keys.push(full);
    }
    let first = name_key(&row.first_name);
    let last = name_key(&row.last_name);
    if !first.is_empty() || !last.is_empty() {
        push_unique(&mut keys, join_key(&first, &last));
        push_unique(&mut keys, join_key(&last, &first));
    }
    keys
}

fn push_unique(keys: &mut Vec<String>, key: String) {
    if !key.is_empty() && !keys.contains(&key) {
        keys.push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(
        id: &str,
        document: &str,
        first: &str,
        last: &str,
        email: &str,
        username: &str,
    ) -> StudentRecord {
        StudentRecord {
            id: id.to_string(),
            document: document.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            username: username.to_string(),
            cohort: "2823456".to_string(),
            status: "active".to_string(),
        }
    }

    fn row(document: &str) -> RowIdentity {
        RowIdentity {
            document_text: document.to_string(),
            ..RowIdentity::default()
        }
    }

    #[test]
    fn document_key_strips_noise_and_leading_zeros() {
        assert_eq!(document_key("0078900").as_deref(), Some("78900"));
        assert_eq!(document_key("78900").as_deref(), Some("78900"));
        assert_eq!(document_key("78900cc").as_deref(), Some("78900"));
        assert_eq!(document_key("CC 1.023.456.789").as_deref(), Some("1023456789"));
    }

    #[test]
    fn document_key_rebuilds_scientific_notation() {
        assert_eq!(document_key("7.89E+4").as_deref(), Some("78900"));
        assert_eq!(document_key("1,0234568E+9").as_deref(), Some("1023456800"));
        assert_eq!(document_key("5e3").as_deref(), Some("5000"));
    }

    #[test]
    fn document_key_rejects_digitless_input() {
        assert_eq!(document_key(""), None);
        assert_eq!(document_key("  "), None);
        assert_eq!(document_key("sin documento"), None);
        assert_eq!(document_key("000"), None);
    }

    #[test]
    fn same_document_in_three_disguises_matches_one_student() {
        let roster = vec![student("s1", "78900", "Ana", "Ruiz", "", "")];
        let index = RosterIndex::build(&roster);
        for text in ["0078900", "78900", "78900cc", "7.89E+4"] {
            let matched = index.resolve(&row(text)).map(|s| s.id.as_str());
            assert_eq!(matched, Some("s1"), "input {:?}", text);
        }
    }

    #[test]
    fn document_cell_holding_an_email_matches_by_email() {
        let roster = vec![student("s1", "", "Ana", "Ruiz", "ana.ruiz@misena.edu.co", "")];
        let index = RosterIndex::build(&roster);
        let matched = index.resolve(&row("Ana.Ruiz@misena.edu.co"));
        assert_eq!(matched.map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn username_matches_exactly_then_by_email_local_part() {
        let roster = vec![
            student("s1", "1", "Ana", "Ruiz", "", "aruiz77"),
            student("s2", "2", "Luis", "Mora", "lmora12@misena.edu.co", ""),
        ];
        let index = RosterIndex::build(&roster);

        let mut r = RowIdentity::default();
        r.username_text = "ARUIZ77".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));

        let mut r = RowIdentity::default();
        r.username_text = "lmora12".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s2"));
    }

    #[test]
    fn email_column_is_tried_against_usernames_too() {
        let roster = vec![student("s1", "1", "Ana", "Ruiz", "", "ana.ruiz@soy.sena.edu.co")];
        let index = RosterIndex::build(&roster);
        let mut r = RowIdentity::default();
        r.email_text = "ana.ruiz@soy.sena.edu.co".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn secondary_email_resolves_when_the_first_misses() {
        let roster = vec![student("s1", "1", "Ana", "Ruiz", "ana.ruiz@gmail.com", "")];
        let index = RosterIndex::build(&roster);
        let mut r = RowIdentity::default();
        r.email_text = "ana.ruiz@misena.edu.co".to_string();
        r.secondary_email_text = "Ana.Ruiz@gmail.com".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn name_permutations_and_diacritics_fold_together() {
        let roster = vec![student("s1", "1", "Juan José", "Pérez García", "", "")];
        let index = RosterIndex::build(&roster);

        let mut r = RowIdentity::default();
        r.full_name_text = "PEREZ GARCIA, JUAN JOSE".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));

        let mut r = RowIdentity::default();
        r.first_name = "juan jose".to_string();
        r.last_name = "perez garcia".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn token_subset_tolerates_missing_middle_names() {
        let roster = vec![student("s1", "1", "Juan José", "Pérez García", "", "")];
        let index = RosterIndex::build(&roster);
        let mut r = RowIdentity::default();
        r.full_name_text = "Juan Pérez".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn token_subset_same_surname_is_first_roster_order() {
        // Two siblings sharing every token of the shorter name: the scan
        // stops at the earliest roster row. Known limitation, kept
        // deterministic rather than guessed at.
        let roster = vec![
            student("s1", "1", "María Camila", "Rojas Duque", "", ""),
            student("s2", "2", "María", "Rojas Duque", "", ""),
        ];
        let index = RosterIndex::build(&roster);
        let mut r = RowIdentity::default();
        r.full_name_text = "María Rojas".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s1"));
    }

    #[test]
    fn cascade_prefers_document_over_names() {
        let roster = vec![
            student("s1", "100", "Ana", "Ruiz", "", ""),
            student("s2", "200", "Ana", "Ruiz", "", ""),
        ];
        let index = RosterIndex::build(&roster);
        let mut r = row("200");
        r.full_name_text = "Ana Ruiz".to_string();
        assert_eq!(index.resolve(&r).map(|s| s.id.as_str()), Some("s2"));
    }

    #[test]
    fn unresolvable_row_matches_nobody() {
        let roster = vec![student("s1", "100", "Ana", "Ruiz", "", "")];
        let index = RosterIndex::build(&roster);
        let mut r = row("999");
        r.full_name_text = "Pedro Nel Ospina".to_string();
        assert!(index.resolve(&r).is_none());
    }
}
