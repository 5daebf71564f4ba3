//! Lexical and semantic utilities: normalization, string similarity,
//! acronym detection, blocking keys and vector similarity.
//!
//! Everything here is a pure function over its inputs.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::defaults::BLOCKING_MAX_EDIT_KEY_LEN;

/// Tokens ignored when building lexical keys and acronyms.
pub const STOP_WORDS: &[&str] = &["the", "of", "and", "for", "a", "an", "in", "on", "to"];

static PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)\s*\(([^()]+)\)\s*$").expect("valid parenthetical regex"));

static ANY_PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([^()]*\)").expect("valid parenthetical regex"));

/// Whether a normalized token is a stop word.
pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Normalize a surface form for comparison.
///
/// Lowercases, spells out `&`, turns punctuation into spaces and collapses
/// whitespace. `"SAP S/4HANA"` becomes `"sap s 4hana"`.
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase().replace('&', " and ");
    let mut out = String::with_capacity(lowered.len());
    let mut pending_space = false;
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Remove every parenthetical segment, e.g. `"Foo (FOO)"` → `"Foo"`.
pub fn strip_parenthetical(s: &str) -> String {
    ANY_PARENTHETICAL.replace_all(s, "").trim().to_string()
}

/// Split a trailing parenthetical: `"General Data Protection Regulation (GDPR)"`
/// → `("General Data Protection Regulation", "GDPR")`.
pub fn split_parenthetical(s: &str) -> Option<(String, String)> {
    let caps = PARENTHETICAL.captures(s.trim())?;
    let head = caps.get(1)?.as_str().trim();
    let inner = caps.get(2)?.as_str().trim();
    if head.is_empty() || inner.is_empty() {
        return None;
    }
    Some((head.to_string(), inner.to_string()))
}

/// Lexical key used by the exact-match blocking index.
///
/// Normalized tokens with stop words and parentheticals removed. Falls back to
/// the plain normalized form when nothing else is left.
pub fn lexical_key(name: &str) -> String {
    let stripped = strip_parenthetical(name);
    let base = if stripped.is_empty() {
        normalize(name)
    } else {
        normalize(&stripped)
    };
    let key = base
        .split(' ')
        .filter(|t| !t.is_empty() && !is_stop_word(t))
        .collect::<Vec<_>>()
        .join(" ");
    if key.is_empty() {
        normalize(name)
    } else {
        key
    }
}

/// Whether two names are identical after normalization (or share a lexical key).
pub fn exact_normalized_match(a: &str, b: &str) -> bool {
    let na = normalize(a);
    if na.is_empty() {
        return false;
    }
    na == normalize(b) || lexical_key(a) == lexical_key(b)
}

/// Raw string similarity in [0, 1] (Jaro-Winkler over normalized forms).
pub fn string_similarity(a: &str, b: &str) -> f32 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    strsim::jaro_winkler(&na, &nb) as f32
}

/// Jaccard similarity over normalized tokens.
pub fn token_jaccard(a: &str, b: &str) -> f32 {
    let ta: HashSet<String> = normalize(a).split(' ').map(str::to_string).collect();
    let tb: HashSet<String> = normalize(b).split(' ').map(str::to_string).collect();
    jaccard(&ta, &tb)
}

/// Jaccard overlap of two name sets (canonical name plus aliases), compared by
/// lexical key.
pub fn alias_overlap<A: AsRef<str>, B: AsRef<str>>(a_names: &[A], b_names: &[B]) -> f32 {
    let ka: HashSet<String> = a_names
        .iter()
        .map(|n| lexical_key(n.as_ref()))
        .filter(|k| !k.is_empty())
        .collect();
    let kb: HashSet<String> = b_names
        .iter()
        .map(|n| lexical_key(n.as_ref()))
        .filter(|k| !k.is_empty())
        .collect();
    jaccard(&ka, &kb)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f32 / union as f32
}

fn alnum_upper(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Whether a surface form looks like an acronym (`GDPR`, `ISO/IEC`, `APIs`).
pub fn looks_like_acronym(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.chars().any(char::is_whitespace) {
        return false;
    }
    let letters: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 2 || alnum_upper(s).chars().count() > 10 {
        return false;
    }
    // Allow a trailing plural "s" (APIs).
    let body = match letters.split_last() {
        Some((last, rest)) if *last == 's' && rest.len() >= 2 => rest,
        _ => &letters[..],
    };
    body.iter().all(|c| c.is_uppercase())
}

/// Candidate acronyms for a multi-word expansion.
///
/// Returns the initials of the significant tokens and, when different, the
/// initials of every token. Single-token inputs have no acronym.
pub fn acronym_of(expansion: &str) -> Vec<String> {
    let normalized = normalize(&strip_parenthetical(expansion));
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 2 {
        return Vec::new();
    }
    let significant = initials(tokens.iter().copied().filter(|t| !is_stop_word(t)));
    let all = initials(tokens.iter().copied());
    let mut out = Vec::with_capacity(2);
    if significant.chars().count() >= 2 {
        out.push(significant);
    }
    if !out.contains(&all) {
        out.push(all);
    }
    out
}

fn initials<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    tokens
        .filter_map(|t| t.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Every acronym a name can be referred to by.
///
/// An acronym-shaped name yields itself; a name with a parenthetical acronym
/// yields that acronym; a multi-word name yields its initials.
pub fn acronym_forms(name: &str) -> Vec<String> {
    let mut forms = Vec::new();
    let mut push = |f: String| {
        if !f.is_empty() && !forms.contains(&f) {
            forms.push(f);
        }
    };
    if looks_like_acronym(name) {
        push(alnum_upper(name));
    }
    if let Some((head, inner)) = split_parenthetical(name) {
        if looks_like_acronym(&inner) {
            push(alnum_upper(&inner));
        }
        if looks_like_acronym(&head) {
            push(alnum_upper(&head));
        }
        for a in acronym_of(&head) {
            push(a);
        }
    } else {
        for a in acronym_of(name) {
            push(a);
        }
    }
    forms
}

fn is_short_form_of(short: &str, long: &str) -> bool {
    let acronym = alnum_upper(short);
    if let Some((head, inner)) = split_parenthetical(long) {
        if looks_like_acronym(&inner) && alnum_upper(&inner) == acronym {
            return true;
        }
        return acronym_of(&head).contains(&acronym);
    }
    acronym_of(long).contains(&acronym)
}

/// Acronym-match signal: 1.0 when either surface form is the acronym of the
/// other (directly or through a parenthetical), else 0.0.
pub fn acronym_match(a: &str, b: &str) -> f32 {
    let a_short = looks_like_acronym(a);
    let b_short = looks_like_acronym(b);
    let matched = match (a_short, b_short) {
        (true, true) => alnum_upper(a) == alnum_upper(b),
        (true, false) => is_short_form_of(a, b),
        (false, true) => is_short_form_of(b, a),
        (false, false) => match (split_parenthetical(a), split_parenthetical(b)) {
            // Two expansions sharing the same declared acronym.
            (Some((_, ia)), Some((_, ib))) => {
                looks_like_acronym(&ia) && alnum_upper(&ia) == alnum_upper(&ib)
            }
            (Some((_, ia)), None) => looks_like_acronym(&ia) && is_short_form_of(&ia, b),
            (None, Some((_, ib))) => looks_like_acronym(&ib) && is_short_form_of(&ib, a),
            (None, None) => false,
        },
    };
    if matched {
        1.0
    } else {
        0.0
    }
}

/// A key plus every single-character deletion of it.
///
/// Two keys within edit distance 1 always share at least one variant, which is
/// what the small-edit-distance blocking bucket relies on.
pub fn deletion_variants(key: &str) -> Vec<String> {
    let chars: Vec<char> = key.chars().collect();
    let mut out = vec![key.to_string()];
    if chars.len() < 3 || chars.len() > BLOCKING_MAX_EDIT_KEY_LEN {
        return out;
    }
    for i in 0..chars.len() {
        let variant: String = chars
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, c)| *c)
            .collect();
        if !out.contains(&variant) {
            out.push(variant);
        }
    }
    out
}

/// First `len` characters of a key, or `None` for keys too short to be useful.
pub fn prefix_key(key: &str, len: usize) -> Option<String> {
    if key.chars().count() < len.min(3).max(1) {
        return None;
    }
    Some(key.chars().take(len).collect())
}

/// Cosine similarity clamped to [0, 1]. Mismatched or empty vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  SAP   S/4HANA "), "sap s 4hana");
        assert_eq!(normalize("AT&T"), "at and t");
        assert_eq!(normalize("Müller-Lyon"), "müller lyon");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn test_lexical_key_drops_stop_words_and_parentheticals() {
        assert_eq!(
            lexical_key("The General Data Protection Regulation (GDPR)"),
            "general data protection regulation"
        );
        assert_eq!(lexical_key("Bank of England"), "bank england");
        assert_eq!(lexical_key("The"), "the");
    }

    #[test]
    fn test_exact_normalized_match() {
        assert!(exact_normalized_match("ISO 27001", "iso-27001"));
        assert!(exact_normalized_match("Bank of England", "bank England"));
        assert!(!exact_normalized_match("SAP HANA", "SAP S/4HANA"));
        assert!(!exact_normalized_match("", ""));
    }

    #[test]
    fn test_string_similarity_bounds() {
        assert_eq!(string_similarity("kafka", "Kafka"), 1.0);
        assert_eq!(string_similarity("", "kafka"), 0.0);
        let s = string_similarity("SAP S/4HANA", "SAP HANA");
        assert!(s > 0.75 && s < 1.0, "got {}", s);
    }

    #[test]
    fn test_acronym_shape() {
        assert!(looks_like_acronym("GDPR"));
        assert!(looks_like_acronym("APIs"));
        assert!(looks_like_acronym("ISO/IEC"));
        assert!(!looks_like_acronym("Gdpr"));
        assert!(!looks_like_acronym("G"));
        assert!(!looks_like_acronym("NOT AN ACRONYM"));
    }

    #[test]
    fn test_acronym_of() {
        assert_eq!(
            acronym_of("General Data Protection Regulation"),
            vec!["GDPR".to_string()]
        );
        let forms = acronym_of("Bank of England");
        assert!(forms.contains(&"BE".to_string()));
        assert!(forms.contains(&"BOE".to_string()));
        assert!(acronym_of("Kafka").is_empty());
    }

    #[test]
    fn test_split_parenthetical() {
        let (head, inner) = split_parenthetical("General Data Protection Regulation (GDPR)").unwrap();
        assert_eq!(head, "General Data Protection Regulation");
        assert_eq!(inner, "GDPR");
        assert!(split_parenthetical("No parenthetical").is_none());
        assert!(split_parenthetical("(GDPR)").is_none());
    }

    #[test]
    fn test_acronym_match_gdpr() {
        assert_eq!(
            acronym_match("GDPR", "General Data Protection Regulation (GDPR)"),
            1.0
        );
        assert_eq!(
            acronym_match("General Data Protection Regulation", "GDPR"),
            1.0
        );
        assert_eq!(
            acronym_match(
                "General Data Protection Regulation (GDPR)",
                "EU General Data Protection Regulation (GDPR)"
            ),
            1.0
        );
        assert_eq!(acronym_match("HIPAA", "General Data Protection Regulation"), 0.0);
        assert_eq!(acronym_match("SAP HANA", "SAP S/4HANA"), 0.0);
    }

    #[test]
    fn test_acronym_forms() {
        let forms = acronym_forms("General Data Protection Regulation (GDPR)");
        assert_eq!(forms, vec!["GDPR".to_string()]);
        assert_eq!(acronym_forms("gdpr"), Vec::<String>::new());
        assert_eq!(acronym_forms("GDPR"), vec!["GDPR".to_string()]);
    }

    #[test]
    fn test_alias_overlap() {
        let a = ["Kubernetes", "k8s"];
        let b = ["K8s", "kube"];
        let overlap = alias_overlap(&a, &b);
        assert!((overlap - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(alias_overlap::<&str, &str>(&[], &["x"]), 0.0);
    }

    #[test]
    fn test_token_jaccard() {
        assert_eq!(token_jaccard("data protection", "Data Protection"), 1.0);
        assert!((token_jaccard("data protection act", "data act") - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_deletion_variants_share_a_key_within_distance_one() {
        let a = deletion_variants("postgres");
        let b = deletion_variants("postgre");
        assert!(a.iter().any(|v| b.contains(v)));
        let c = deletion_variants("mysql");
        assert!(!a.iter().any(|v| c.contains(v)));
        assert_eq!(deletion_variants("ab"), vec!["ab".to_string()]);
    }

    #[test]
    fn test_prefix_key() {
        assert_eq!(prefix_key("kubernetes", 5), Some("kuber".to_string()));
        assert_eq!(prefix_key("k8", 5), None);
        assert_eq!(prefix_key("sap", 5), Some("sap".to_string()));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
