//! Hybrid error classification.
//!
//! Three classifiers run on every error: user-defined rules (first full
//! conjunction at descending priority), learned message patterns, and trained
//! feature weights. The result with the highest confidence wins; when nothing
//! is confident, the default Unknown classification at confidence 0.1 is
//! returned. Classification never fails the calling pipeline.

pub mod features;
pub mod patterns;
pub mod rules;

pub use features::{ClassificationFeedback, FeatureWeights, TrainingExample};
pub use patterns::PatternIndex;
pub use rules::{
    ClassificationAction, ClassificationRule, ConditionField, ConditionOperator, RuleCondition,
    RuleStore,
};

use crate::error::{ResilienceError, Result};
use crate::errors::{ErrorCode, ErrorSeverity, ErrorType, PluginError};
use crate::metrics::SharedMetrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DEFAULT_CONFIDENCE: f64 = 0.1;

/// Result of classifying one error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub code: ErrorCode,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub category: String,
    pub subcategory: String,
    pub confidence: f64,
    pub reason: String,
    pub suggestions: Vec<String>,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Classification {
    fn default_with_reason(reason: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unknown,
            error_type: ErrorType::Unknown,
            severity: ErrorSeverity::Error,
            category: "unknown".to_string(),
            subcategory: String::new(),
            confidence: DEFAULT_CONFIDENCE,
            reason: reason.into(),
            suggestions: vec![],
            tags: vec![],
            timestamp: Utc::now(),
        }
    }
}

/// Rule, pattern, and feature-weight classification merged by confidence
pub struct HybridClassifier {
    rules: RwLock<RuleStore>,
    patterns: RwLock<PatternIndex>,
    weights: RwLock<FeatureWeights>,
    metrics: Option<SharedMetrics>,
}

impl HybridClassifier {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(RuleStore::new()),
            patterns: RwLock::new(PatternIndex::new()),
            weights: RwLock::new(FeatureWeights::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Classify an error observed for `unit_id`. Always produces a result.
    pub fn classify(&self, error: &PluginError, unit_id: &str) -> Classification {
        let message = error.message();
        let features = features::extract_features(message, unit_id);

        let rule_result = self
            .rules
            .read()
            .first_match(message, unit_id, &features)
            .map(|rule| Classification {
                code: rule.action.code,
                error_type: rule.action.error_type,
                severity: rule.action.severity,
                category: rule.action.category.clone(),
                subcategory: rule.action.subcategory.clone(),
                confidence: rule.weight,
                reason: format!("Matched rule: {}", rule.name),
                suggestions: rule.action.suggestions.clone(),
                tags: rule.action.tags.clone(),
                timestamp: Utc::now(),
            });

        let pattern_result = self.patterns.read().classify(message);

        let weight_result = self.weights.read().score(&features).map(|score| {
            Classification {
                code: score.code,
                error_type: score.code.error_type(),
                severity: score.code.severity(),
                category: String::new(),
                subcategory: String::new(),
                confidence: score.confidence,
                reason: "Weight-based classification".to_string(),
                suggestions: vec![],
                tags: vec![],
                timestamp: Utc::now(),
            }
        });

        let result = merge(rule_result, pattern_result, weight_result);

        if let Some(metrics) = &self.metrics {
            let error_type = result.error_type.to_string();
            metrics.increment_counter(
                "error_classification_total",
                &[("unit_id", unit_id), ("error_type", &error_type)],
            );
            metrics.record_histogram(
                "classification_confidence",
                result.confidence,
                &[("unit_id", unit_id)],
            );
        }

        debug!(
            unit_id = %unit_id,
            code = %result.code,
            error_type = %result.error_type,
            confidence = result.confidence,
            reason = %result.reason,
            "Error classified"
        );

        result
    }

    /// Train patterns and feature weights from labeled examples
    pub fn train(&self, examples: &[TrainingExample]) -> Result<()> {
        if examples.is_empty() {
            return Err(ResilienceError::Validation(
                "training data is empty".to_string(),
            ));
        }

        self.weights.write().train(examples);
        self.patterns.write().learn(examples);

        info!(
            training_samples = examples.len(),
            features_count = self.weights.read().len(),
            patterns_count = self.patterns.read().len(),
            "Classifier trained"
        );

        Ok(())
    }

    pub fn add_rule(&self, rule: ClassificationRule) -> Result<()> {
        self.rules.write().add(rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<()> {
        self.rules.write().remove(rule_id).map(|_| ())
    }

    pub fn rules(&self) -> Vec<ClassificationRule> {
        self.rules.read().all()
    }

    /// Apply outcome feedback, adjusting feature weights and recording
    /// batch accuracy
    pub fn update_weights(&self, feedback: &[ClassificationFeedback]) {
        if feedback.is_empty() {
            return;
        }

        let correct = feedback.iter().filter(|fb| fb.correct).count();
        self.weights.write().update(feedback);

        info!(
            feedback_count = feedback.len(),
            correct_count = correct,
            accuracy = self.weights.read().accuracy(),
            "Classifier weights updated"
        );
    }

    /// Accuracy of the most recent feedback batch
    pub fn accuracy(&self) -> f64 {
        self.weights.read().accuracy()
    }

    /// Discard all rules, patterns, and learned weights
    pub fn reset(&self) {
        self.rules.write().clear();
        self.patterns.write().clear();
        self.weights.write().clear();
        info!("Classifier reset");
    }
}

impl Default for HybridClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn merge(
    rule: Option<Classification>,
    pattern: Option<Classification>,
    weight: Option<Classification>,
) -> Classification {
    [rule, pattern, weight]
        .into_iter()
        .flatten()
        .filter(|c| c.confidence > 0.0)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .unwrap_or_else(|| Classification::default_with_reason("No confident classification"))
}
