pub mod dates;
pub mod decode;
pub mod evidence;
pub mod headers;
pub mod identity;
pub mod pipeline;

/// Shared normalization for header and name matching: trimmed, lowercased,
/// diacritics folded to ASCII, inner whitespace collapsed to single spaces.
pub fn normalize_text(s: &str) -> String {
    let mut folded = String::with_capacity(s.len());
    for c in s.chars() {
        for lc in c.to_lowercase() {
            folded.push(fold_diacritic(lc));
        }
    }
    let mut out = String::with_capacity(folded.len());
    for part in folded.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        _ => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_spanish_diacritics() {
        assert_eq!(normalize_text("Último Acceso"), "ultimo acceso");
        assert_eq!(normalize_text("  Número de  Documento "), "numero de documento");
        assert_eq!(normalize_text("Año\tlectivo"), "ano lectivo");
    }

    #[test]
    fn normalize_keeps_punctuation() {
        assert_eq!(normalize_text("Apellido(s)"), "apellido(s)");
        assert_eq!(normalize_text("E-mail"), "e-mail");
    }
}
