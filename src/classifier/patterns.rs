//! Message patterns learned from training data.
//!
//! Each training message is generalized by replacing digit runs and path
//! segments with regex classes; a generalized pattern that covers at least
//! three examples is compiled and kept. Matching a learned pattern yields a
//! keyword-inferred classification at fixed confidence 0.7.

use super::Classification;
use crate::errors::{ErrorCode, ErrorSeverity, ErrorType};
use super::features::TrainingExample;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

const MIN_PATTERN_OCCURRENCES: usize = 3;
const PATTERN_CONFIDENCE: f64 = 0.7;

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/\\][\w\-\.]+").unwrap());

/// Compiled patterns learned from training examples
#[derive(Default)]
pub struct PatternIndex {
    patterns: HashMap<String, Regex>,
}

impl PatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the learned patterns from a training set
    pub fn learn(&mut self, examples: &[TrainingExample]) {
        let mut occurrences: HashMap<String, usize> = HashMap::new();

        for example in examples {
            for pattern in generalize(&example.error_message) {
                *occurrences.entry(pattern).or_insert(0) += 1;
            }
        }

        for (pattern, count) in occurrences {
            if count < MIN_PATTERN_OCCURRENCES {
                continue;
            }
            match Regex::new(&pattern) {
                Ok(regex) => {
                    self.patterns.insert(pattern, regex);
                }
                Err(e) => {
                    debug!(pattern = %pattern, error = %e, "Skipping uncompilable learned pattern");
                }
            }
        }
    }

    /// Classification for the first learned pattern matching the message
    pub fn classify(&self, message: &str) -> Option<Classification> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(message))
            .and_then(|(pattern, _)| infer_from_pattern(pattern))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }
}

/// Generalized forms of a message: digit runs replaced, then path segments
fn generalize(message: &str) -> Vec<String> {
    let digits_generalized = NUMBER_RE.replace_all(message, r"\d+").into_owned();
    let paths_generalized = PATH_RE
        .replace_all(&digits_generalized, r"[/\\][\w\-\.]+")
        .into_owned();
    vec![digits_generalized, paths_generalized]
}

/// Keyword inference over the pattern text; unrecognized patterns yield no
/// classification
fn infer_from_pattern(pattern: &str) -> Option<Classification> {
    let lower = pattern.to_lowercase();

    if lower.contains("timeout") {
        return Some(Classification {
            code: ErrorCode::PluginTimeout,
            error_type: ErrorType::Timeout,
            severity: ErrorSeverity::Error,
            category: "timeout".to_string(),
            subcategory: String::new(),
            confidence: PATTERN_CONFIDENCE,
            reason: "Pattern-based timeout detection".to_string(),
            suggestions: vec![],
            tags: vec![],
            timestamp: Utc::now(),
        });
    }

    if lower.contains("network") || lower.contains("connection") {
        return Some(Classification {
            code: ErrorCode::PluginNetworkError,
            error_type: ErrorCode::PluginNetworkError.error_type(),
            severity: ErrorSeverity::Error,
            category: "network".to_string(),
            subcategory: String::new(),
            confidence: PATTERN_CONFIDENCE,
            reason: "Pattern-based network detection".to_string(),
            suggestions: vec![],
            tags: vec![],
            timestamp: Utc::now(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(message: &str) -> TrainingExample {
        TrainingExample {
            error_message: message.to_string(),
            unit_id: "p1".to_string(),
            expected_code: ErrorCode::PluginTimeout,
            expected_type: ErrorType::Timeout,
            expected_severity: ErrorSeverity::Error,
            weight: 1.0,
        }
    }

    #[test]
    fn test_generalize_digits_and_paths() {
        let patterns = generalize("timeout after 30s reading /var/log/app.log");
        assert!(patterns[0].contains(r"\d+"));
        assert!(patterns[1].contains(r"[/\\][\w\-\.]+"));
    }

    #[test]
    fn test_learn_requires_three_occurrences() {
        let mut index = PatternIndex::new();
        index.learn(&[example("timeout after 5s"), example("timeout after 9s")]);
        assert!(index.is_empty());

        index.learn(&[
            example("timeout after 5s"),
            example("timeout after 9s"),
            example("timeout after 30s"),
        ]);
        assert!(!index.is_empty());
    }

    #[test]
    fn test_learned_pattern_classifies_timeout() {
        let mut index = PatternIndex::new();
        index.learn(&[
            example("connection timeout after 5s"),
            example("connection timeout after 9s"),
            example("connection timeout after 30s"),
        ]);

        let classification = index.classify("connection timeout after 120s");
        let classification = classification.expect("pattern should match");
        assert_eq!(classification.code, ErrorCode::PluginTimeout);
        assert!((classification.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_network_inference() {
        let classification = infer_from_pattern("network unreachable host").unwrap();
        assert_eq!(classification.code, ErrorCode::PluginNetworkError);

        assert!(infer_from_pattern("disk quota exceeded").is_none());
    }

    #[test]
    fn test_unmatched_message_yields_none() {
        let mut index = PatternIndex::new();
        index.learn(&[
            example("timeout after 5s"),
            example("timeout after 9s"),
            example("timeout after 30s"),
        ]);
        assert!(index.classify("completely different failure").is_none());
    }
}
