//! Text folding shared by the matcher, the confirmation parser and quick-parse.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Filler words ignored when scoring a request against catalog names.
pub const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "with", "and", "please", "pls", "some", "de", "do", "da", "dos", "das",
    "com", "e", "um", "uma", "por", "favor", "el", "la", "los", "las", "con", "y",
];

pub fn strip_accents(input: &str) -> String {
    input.nfd().filter(|ch| !is_combining_mark(*ch)).collect()
}

/// Lowercase, accent-free, punctuation-free, single-spaced form of `input`.
pub fn normalize(input: &str) -> String {
    let folded: String = strip_accents(input)
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokenize(normalized: &str) -> Vec<String> {
    normalized.split_whitespace().map(str::to_owned).collect()
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Naive singular form covering the English and Romance plurals seen in orders.
pub fn singularize(token: &str) -> String {
    if token.len() <= 3 || token.chars().any(|ch| ch.is_ascii_digit()) {
        return token.to_owned();
    }
    if let Some(stem) = token.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if let Some(stem) = token.strip_suffix("oes") {
        return format!("{stem}o");
    }
    if let Some(stem) = token.strip_suffix("aes") {
        return format!("{stem}ao");
    }
    if token.ends_with("ss") || token.ends_with("us") {
        return token.to_owned();
    }
    token.strip_suffix('s').map(str::to_owned).unwrap_or_else(|| token.to_owned())
}

pub fn tokens_match(left: &str, right: &str) -> bool {
    left == right || singularize(left) == singularize(right)
}

#[cfg(test)]
mod tests {
    use super::{normalize, singularize, strip_accents, tokens_match};

    #[test]
    fn normalize_folds_case_accents_and_spacing() {
        assert_eq!(normalize("  Pão  de Queijo! "), "pao de queijo");
        assert_eq!(normalize("Coca-Cola 2L"), "coca cola 2l");
        assert_eq!(strip_accents("não"), "nao");
    }

    #[test]
    fn singularize_handles_common_plurals() {
        assert_eq!(singularize("sodas"), "soda");
        assert_eq!(singularize("cherries"), "cherry");
        assert_eq!(singularize("tomatoes"), "tomato");
        assert_eq!(singularize("glass"), "glass");
        assert_eq!(singularize("gas"), "gas");
        assert_eq!(singularize("500ml"), "500ml");
    }

    #[test]
    fn tokens_match_is_plural_tolerant() {
        assert!(tokens_match("waters", "water"));
        assert!(!tokens_match("water", "wafer"));
    }
}
