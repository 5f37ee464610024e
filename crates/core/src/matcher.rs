//! Deterministic fuzzy resolution of free-text item names against a catalog
//! snapshot. No learned models: exact, containment, then token overlap.

use serde::{Deserialize, Serialize};

use crate::domain::catalog::ProductCandidate;
use crate::text::{is_stopword, normalize, singularize, tokenize, tokens_match};

#[derive(Clone, Debug, PartialEq)]
pub struct MatcherConfig {
    pub min_score: f64,
    pub ambiguity_margin: f64,
    /// Segments with at most this many tokens are treated as ambiguous when
    /// several candidates score close to the best.
    pub ambiguity_max_tokens: usize,
    pub max_options: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { min_score: 0.6, ambiguity_margin: 0.1, ambiguity_max_tokens: 2, max_options: 10 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Match { candidate: ProductCandidate },
    Ambiguous { options: Vec<ProductCandidate> },
    NoMatch,
}

#[derive(Clone, Debug, Default)]
pub struct ProductMatcher {
    config: MatcherConfig,
}

impl ProductMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, segment: &str, catalog: &[ProductCandidate]) -> MatchResult {
        let normalized = normalize(segment);
        if normalized.is_empty() || catalog.is_empty() {
            return MatchResult::NoMatch;
        }

        let exact = catalog.iter().find(|candidate| candidate.normalized_name == normalized);
        if let Some(candidate) = exact {
            return MatchResult::Match { candidate: candidate.clone() };
        }

        let contained: Vec<&ProductCandidate> = catalog
            .iter()
            .filter(|candidate| {
                contains_phrase(&candidate.normalized_name, &normalized)
                    || contains_phrase(&normalized, &candidate.normalized_name)
            })
            .collect();
        match contained.as_slice() {
            [single] => return MatchResult::Match { candidate: (*single).clone() },
            [] => {}
            many => return self.ambiguous(many.iter().copied()),
        }

        self.resolve_by_tokens(&normalized, catalog)
    }

    fn resolve_by_tokens(&self, normalized: &str, catalog: &[ProductCandidate]) -> MatchResult {
        let segment_tokens: Vec<String> =
            tokenize(normalized).into_iter().filter(|token| !is_stopword(token)).collect();
        if segment_tokens.is_empty() {
            return MatchResult::NoMatch;
        }

        let mut scored: Vec<(f64, &ProductCandidate)> = catalog
            .iter()
            .map(|candidate| (token_score(&segment_tokens, &candidate.tokens), candidate))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        let Some(&(best, best_candidate)) = scored.first() else {
            return MatchResult::NoMatch;
        };
        if best < self.config.min_score {
            return MatchResult::NoMatch;
        }

        let close: Vec<&ProductCandidate> = scored
            .iter()
            .take_while(|(score, _)| best - *score <= self.config.ambiguity_margin)
            .map(|(_, candidate)| *candidate)
            .collect();
        if close.len() > 1 && segment_tokens.len() <= self.config.ambiguity_max_tokens {
            return self.ambiguous(close.into_iter());
        }

        MatchResult::Match { candidate: best_candidate.clone() }
    }

    fn ambiguous<'a>(&self, options: impl Iterator<Item = &'a ProductCandidate>) -> MatchResult {
        let mut options: Vec<ProductCandidate> = options.cloned().collect();
        options.truncate(self.config.max_options);
        MatchResult::Ambiguous { options }
    }
}

/// Whole-word containment of `needle` inside `haystack` (both normalized).
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let haystack: Vec<String> = tokenize(haystack).iter().map(|token| singularize(token)).collect();
    let needle: Vec<String> = tokenize(needle).iter().map(|token| singularize(token)).collect();
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// Fraction of segment tokens present in the candidate's token set.
fn token_score(segment_tokens: &[String], candidate_tokens: &[String]) -> f64 {
    let hits = segment_tokens
        .iter()
        .filter(|token| candidate_tokens.iter().any(|candidate| tokens_match(token, candidate)))
        .count();
    hits as f64 / segment_tokens.len() as f64
}
