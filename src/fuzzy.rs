// 🔍 Fuzzy Matcher - last-resort approximate match
//
// Ratio-based similarity (normalized Levenshtein) against canonical
// normalized names. A match is accepted only at or above the threshold;
// everything below goes to the unresolved bucket.
//
// Ties: when several candidates share the top score, the lexicographically
// smallest candidate name wins. Candidates are expected in sorted order but
// the tie-break does not depend on it.

use serde::{Deserialize, Serialize};

/// Similarity floor for accepting a fuzzy match
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.82;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    threshold: f64,
}

impl FuzzyMatcher {
    pub fn new() -> Self {
        FuzzyMatcher {
            threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        FuzzyMatcher { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Similarity in [0, 1]; identical strings score 1.0
    pub fn score(a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        strsim::normalized_levenshtein(a, b)
    }

    /// Best candidate regardless of threshold
    pub fn best_candidate<S: AsRef<str>>(&self, normalized: &str, candidates: &[S]) -> Option<FuzzyMatch> {
        let mut best: Option<FuzzyMatch> = None;

        for candidate in candidates {
            let candidate = candidate.as_ref();
            let score = Self::score(normalized, candidate);

            let better = match &best {
                None => true,
                Some(current) => {
                    score > current.score
                        || (score == current.score && candidate < current.candidate.as_str())
                }
            };

            if better {
                best = Some(FuzzyMatch {
                    candidate: candidate.to_string(),
                    score,
                });
            }
        }

        best
    }

    /// Best candidate if it clears the threshold
    pub fn find_match<S: AsRef<str>>(&self, normalized: &str, candidates: &[S]) -> Option<FuzzyMatch> {
        if normalized.is_empty() {
            return None;
        }
        self.best_candidate(normalized, candidates)
            .filter(|m| m.score >= self.threshold)
    }
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_scores_one() {
        let matcher = FuzzyMatcher::new();
        let m = matcher
            .find_match("vila olimpica del poblenou", &["poblenou", "vila olimpica del poblenou"])
            .unwrap();
        assert_eq!(m.candidate, "vila olimpica del poblenou");
        assert_eq!(m.score, 1.0);
    }

    #[test]
    fn test_typo_matches() {
        let matcher = FuzzyMatcher::new();
        // one substitution in 14 chars: 1 - 1/14 ≈ 0.93
        let m = matcher
            .find_match("vila de gracie", &["vila de gracia", "salut", "coll"])
            .unwrap();
        assert_eq!(m.candidate, "vila de gracia");
        assert!(m.score >= 0.82);
    }

    #[test]
    fn test_below_threshold_rejected() {
        let matcher = FuzzyMatcher::new();
        // 1 - 1/4 = 0.75
        assert!((FuzzyMatcher::score("abcx", "abcd") - 0.75).abs() < 1e-9);
        assert_eq!(matcher.find_match("abcx", &["abcd"]), None);
        assert!(matcher.best_candidate("abcx", &["abcd"]).is_some());
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        let matcher = FuzzyMatcher::with_threshold(0.5);
        // "abcd" is one edit away from both
        let forward = matcher.find_match("abcd", &["abce", "abcf"]).unwrap();
        let reverse = matcher.find_match("abcd", &["abcf", "abce"]).unwrap();
        assert_eq!(forward.candidate, "abce");
        assert_eq!(reverse.candidate, "abce");
    }

    #[test]
    fn test_short_names_not_confused() {
        let matcher = FuzzyMatcher::new();
        assert_eq!(matcher.find_match("sant antoni", &["sant andreu"]), None);
        assert_eq!(matcher.find_match("clot", &["coll"]), None);
    }

    #[test]
    fn test_empty_input_never_matches() {
        let matcher = FuzzyMatcher::with_threshold(0.0);
        assert_eq!(matcher.find_match("", &["raval"]), None);
        let none: [&str; 0] = [];
        assert_eq!(matcher.find_match("raval", &none), None);
    }
}
