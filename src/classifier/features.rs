//! Feature extraction and trained feature weights.
//!
//! Features are binary-ish indicators extracted from an error message and its
//! unit id. Training assigns each feature an entropy-based weight over the
//! expected codes in the training set; feedback nudges weights up or down by
//! 10% within [0.1, 10.0].

use crate::errors::{ErrorCode, ErrorSeverity, ErrorType};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

const KEYWORDS: [&str; 19] = [
    "timeout",
    "connection",
    "network",
    "permission",
    "denied",
    "not found",
    "invalid",
    "failed",
    "error",
    "exception",
    "null",
    "undefined",
    "memory",
    "cpu",
    "disk",
    "authentication",
    "authorization",
    "config",
    "format",
];

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/\\][\w\-\.]+").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[\w\-\./]+").unwrap());

/// Extract the feature map for one error observation
pub fn extract_features(message: &str, unit_id: &str) -> HashMap<String, f64> {
    let mut features = HashMap::new();

    features.insert(format!("unit_{}", unit_id), 1.0);

    let len = message.len();
    let bucket = if len < 50 {
        "length_short"
    } else if len < 200 {
        "length_medium"
    } else {
        "length_long"
    };
    features.insert(bucket.to_string(), 1.0);

    let lower = message.to_lowercase();
    for keyword in KEYWORDS {
        if lower.contains(keyword) {
            features.insert(format!("keyword_{}", keyword), 1.0);
        }
    }

    let digit_runs = NUMBER_RE.find_iter(message).count();
    if digit_runs > 0 {
        features.insert("has_numbers".to_string(), digit_runs as f64);
    }
    if PATH_RE.is_match(message) {
        features.insert("has_path".to_string(), 1.0);
    }
    if URL_RE.is_match(message) {
        features.insert("has_url".to_string(), 1.0);
    }

    features
}

/// One labeled example used to train the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub error_message: String,
    pub unit_id: String,
    pub expected_code: ErrorCode,
    pub expected_type: ErrorType,
    pub expected_severity: ErrorSeverity,
    #[serde(default)]
    pub weight: f64,
}

/// Outcome feedback for a past classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationFeedback {
    pub error_message: String,
    pub unit_id: String,
    pub predicted_code: ErrorCode,
    pub actual_code: ErrorCode,
    pub correct: bool,
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

const MAX_ACCURACY_HISTORY: usize = 100;

/// Trained per-feature weights plus the rolling accuracy record
#[derive(Default)]
pub struct FeatureWeights {
    weights: HashMap<String, f64>,
    accuracy_history: Vec<f64>,
}

/// Result of weight-based scoring
pub struct WeightScore {
    pub code: ErrorCode,
    pub confidence: f64,
}

impl FeatureWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute weights from a training set using per-feature entropy over
    /// the expected codes
    pub fn train(&mut self, examples: &[TrainingExample]) {
        let total = examples.len();
        let mut frequency: HashMap<String, HashMap<ErrorCode, usize>> = HashMap::new();

        for example in examples {
            let features = extract_features(&example.error_message, &example.unit_id);
            for feature in features.keys() {
                *frequency
                    .entry(feature.clone())
                    .or_default()
                    .entry(example.expected_code)
                    .or_insert(0) += 1;
            }
        }

        for (feature, code_freq) in frequency {
            self.weights.insert(feature, entropy(&code_freq, total));
        }
    }

    /// Score every code by summed feature value x weight; highest positive
    /// score wins, confidence normalized to [0, 1]
    pub fn score(&self, features: &HashMap<String, f64>) -> Option<WeightScore> {
        let mut scores: HashMap<ErrorCode, f64> = HashMap::new();

        for (feature, value) in features {
            if let Some(weight) = self.weights.get(feature) {
                for code in ErrorCode::iter() {
                    *scores.entry(code).or_insert(0.0) += value * weight;
                }
            }
        }

        let mut best: Option<(ErrorCode, f64)> = None;
        for code in ErrorCode::iter() {
            if let Some(&score) = scores.get(&code) {
                match best {
                    Some((_, best_score)) if score <= best_score => {}
                    _ => best = Some((code, score)),
                }
            }
        }

        best.filter(|(_, score)| *score > 0.0)
            .map(|(code, score)| WeightScore {
                code,
                confidence: (score / 10.0).min(1.0),
            })
    }

    /// Apply feedback: record the batch accuracy and nudge every feature of
    /// each observation up (correct) or down (incorrect) by 10%
    pub fn update(&mut self, feedback: &[ClassificationFeedback]) {
        if feedback.is_empty() {
            return;
        }

        let correct = feedback.iter().filter(|fb| fb.correct).count();
        let accuracy = correct as f64 / feedback.len() as f64;
        self.accuracy_history.push(accuracy);
        if self.accuracy_history.len() > MAX_ACCURACY_HISTORY {
            self.accuracy_history.remove(0);
        }

        for fb in feedback {
            let features = extract_features(&fb.error_message, &fb.unit_id);
            let factor = if fb.correct { 1.1 } else { 0.9 };
            for feature in features.keys() {
                let weight = self.weights.entry(feature.clone()).or_insert(1.0);
                *weight = (*weight * factor).clamp(0.1, 10.0);
            }
        }
    }

    /// Accuracy of the most recent feedback batch, 0.0 before any feedback
    pub fn accuracy(&self) -> f64 {
        self.accuracy_history.last().copied().unwrap_or(0.0)
    }

    pub fn weight(&self, feature: &str) -> Option<f64> {
        self.weights.get(feature).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn clear(&mut self) {
        self.weights.clear();
        self.accuracy_history.clear();
    }
}

fn entropy(code_freq: &HashMap<ErrorCode, usize>, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }

    let mut entropy = 0.0;
    for &freq in code_freq.values() {
        if freq > 0 {
            let p = freq as f64 / total as f64;
            entropy -= p * p.log2();
        }
    }
    entropy
}
