use serde::{Deserialize, Serialize};

use crate::ingest::normalize_text;

/// Qualitative grade letter. Stored and serialized as the single letters the
/// reports use: `A` approved, `D` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Letter {
    #[serde(rename = "A")]
    Approved,
    #[serde(rename = "D")]
    Failed,
}

impl Letter {
    pub fn as_str(self) -> &'static str {
        match self {
            Letter::Approved => "A",
            Letter::Failed => "D",
        }
    }

    pub fn is_passing(self) -> bool {
        matches!(self, Letter::Approved)
    }

    /// Parses a letter cell. Tolerates the synonyms graders type in place of
    /// the bare letters.
    pub fn parse(raw: &str) -> Option<Letter> {
        match normalize_text(raw).as_str() {
            "a" | "aprobado" | "aprobada" | "aprobo" | "aprueba" => Some(Letter::Approved),
            "d" | "no aprobado" | "no aprobada" | "reprobado" | "reprobada" | "desaprobado"
            | "perdio" => Some(Letter::Failed),
            _ => None,
        }
    }

    pub fn from_db(raw: &str) -> Letter {
        if raw.trim().eq_ignore_ascii_case("a") {
            Letter::Approved
        } else {
            Letter::Failed
        }
    }
}

/// Score implied by a lone letter, used when a letter column has no score
/// twin to read from.
pub fn letter_default_score(letter: Letter) -> f64 {
    match letter {
        Letter::Approved => 100.0,
        Letter::Failed => 0.0,
    }
}

/// Letter implied by a lone score.
pub fn letter_for_score(score: f64, passing_score: f64) -> Letter {
    if score >= passing_score {
        Letter::Approved
    } else {
        Letter::Failed
    }
}

/// One stored grade for a (student, activity) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeCell {
    pub score: f64,
    pub letter: Letter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    /// Visible activities with no entry or a non-passing letter.
    pub pending: usize,
    /// Mean over all visible activities with missing entries counted as
    /// zero; `None` only when every entry is missing.
    pub average: Option<f64>,
    pub final_letter: Letter,
}

/// Standing over the activities visible in one view, one slot per activity.
/// All-or-nothing on purpose: a single missing or failed evidence keeps the
/// final letter at `D`.
pub fn student_standing(cells: &[Option<GradeCell>]) -> StudentStanding {
    let total = cells.len();
    let mut present = 0usize;
    let mut approved = 0usize;
    let mut sum = 0.0f64;
    for cell in cells.iter().flatten() {
        present += 1;
        sum += cell.score;
        if cell.letter.is_passing() {
            approved += 1;
        }
    }
    let average = if present == 0 {
        None
    } else {
        Some(sum / total as f64)
    };
    StudentStanding {
        pending: total - approved,
        average,
        final_letter: if approved == total {
            Letter::Approved
        } else {
            Letter::Failed
        },
    }
}

/// Half-up rounding to one decimal for display.
pub fn round1(x: f64) -> f64 {
    ((x * 10.0) + 0.5).floor() / 10.0
}
