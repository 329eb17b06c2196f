//! String helpers for name keys: case folding, query normalization and
//! code-point conversion for the trie.

/// Fold a name with the Unicode default case mapping. Both stored keys and
/// queries go through this, so equality is case-insensitive.
pub fn fold_case(s: &str) -> String {
    s.chars().flat_map(|c| c.to_lowercase()).collect()
}

/// Normalize a raw query: trim, collapse interior whitespace runs to a
/// single space, and case-fold.
pub fn normalize_query(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.extend(c.to_lowercase());
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Trie keys are stored as code points, not bytes, so edit distances count
/// characters.
pub fn to_code_points(s: &str) -> Vec<char> {
    s.chars().collect()
}

pub fn from_code_points(cps: &[char]) -> String {
    cps.iter().collect()
}

pub fn eq_fold(a: &str, b: &str) -> bool {
    fold_case(a) == fold_case(b)
}

/// Does `full` start with `prefix`, comparing case-folded?
pub fn starts_with_fold(full: &str, prefix: &str) -> bool {
    fold_case(full).starts_with(&fold_case(prefix))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fold_case() {
        assert_eq!(fold_case("Homo Sapiens"), "homo sapiens");
        assert_eq!(fold_case("BACTERIA"), "bacteria");
        // non-ASCII goes through the full case mapping
        assert_eq!(fold_case("Ölandsk"), "ölandsk");
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Homo   sapiens "), "homo sapiens");
        assert_eq!(normalize_query("Aster"), "aster");
        assert_eq!(normalize_query(""), "");
        // trailing space is significant to autocomplete, but normalization
        // strips it; the caller keeps the raw form when it matters
        assert_eq!(normalize_query("Homo "), "homo");
    }

    #[test]
    fn test_code_points() {
        let cps = to_code_points("Ölandsk");
        assert_eq!(cps.len(), 7);
        assert_eq!(from_code_points(&cps), "Ölandsk");
    }

    #[test]
    fn test_eq_fold() {
        assert!(eq_fold("ASTERACEAE", "Asteraceae"));
        assert!(starts_with_fold("Homo sapiens", "homo sa"));
        assert!(!starts_with_fold("Homo", "homo sa"));
    }
}
