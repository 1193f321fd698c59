//! Hybrid classifier integration tests.

use chrono::Utc;
use plugin_resilience::classifier::{
    ClassificationAction, ClassificationFeedback, ClassificationRule, ConditionField,
    ConditionOperator, HybridClassifier, RuleCondition, TrainingExample,
};
use plugin_resilience::errors::{ErrorCode, ErrorSeverity, ErrorType, PluginError};

fn unknown(message: &str) -> PluginError {
    PluginError::new(ErrorCode::Unknown, message)
}

fn timeout_examples() -> Vec<TrainingExample> {
    (1..=4)
        .map(|i| TrainingExample {
            error_message: format!("connection timeout after {} seconds", i * 10),
            unit_id: "netease".to_string(),
            expected_code: ErrorCode::PluginTimeout,
            expected_type: ErrorType::Timeout,
            expected_severity: ErrorSeverity::Error,
            weight: 1.0,
        })
        .collect()
}

fn strong_network_rule() -> ClassificationRule {
    ClassificationRule {
        id: "network".to_string(),
        name: "network rule".to_string(),
        description: String::new(),
        conditions: vec![RuleCondition::new(
            ConditionField::Message,
            ConditionOperator::Contains,
            "timeout",
        )],
        action: ClassificationAction {
            code: ErrorCode::PluginNetworkError,
            error_type: ErrorType::Runtime,
            severity: ErrorSeverity::Error,
            category: "network".to_string(),
            subcategory: String::new(),
            tags: vec!["net".to_string()],
            suggestions: vec!["check connectivity".to_string()],
        },
        priority: 10,
        enabled: true,
        weight: 0.95,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn trained_classifier_recognizes_unseen_timeout_message() {
    let classifier = HybridClassifier::new();
    classifier.train(&timeout_examples()).unwrap();

    // Same generalized shape, numbers the classifier never saw
    let result = classifier.classify(
        &unknown("connection timeout after 30 seconds"),
        "netease",
    );
    assert_eq!(result.code, ErrorCode::PluginTimeout);
    assert_eq!(result.error_type, ErrorType::Timeout);
    assert!(result.confidence >= 0.7);
}

#[test]
fn high_weight_rule_overrides_learned_pattern() {
    let classifier = HybridClassifier::new();
    classifier.train(&timeout_examples()).unwrap();
    classifier.add_rule(strong_network_rule()).unwrap();

    let result = classifier.classify(
        &unknown("connection timeout after 5 seconds"),
        "netease",
    );
    // Rule weight 0.95 outranks pattern confidence 0.7
    assert_eq!(result.code, ErrorCode::PluginNetworkError);
    assert!(result.reason.contains("network rule"));
    assert_eq!(result.suggestions, vec!["check connectivity".to_string()]);

    // Removing the rule lets the pattern win again
    classifier.remove_rule("network").unwrap();
    let result = classifier.classify(
        &unknown("connection timeout after 5 seconds"),
        "netease",
    );
    assert_eq!(result.code, ErrorCode::PluginTimeout);
}

#[test]
fn untrained_classifier_defaults_without_failing() {
    let classifier = HybridClassifier::new();
    for message in ["", "?!#@", "glyph soup \u{1F980}", "x"] {
        let result = classifier.classify(&unknown(message), "any");
        assert_eq!(result.code, ErrorCode::Unknown);
        assert!((result.confidence - 0.1).abs() < 1e-9);
    }
}

#[test]
fn feedback_batches_drive_reported_accuracy() {
    let classifier = HybridClassifier::new();
    classifier.train(&timeout_examples()).unwrap();
    assert_eq!(classifier.accuracy(), 0.0);

    let feedback: Vec<ClassificationFeedback> = (0..4)
        .map(|i| ClassificationFeedback {
            error_message: "connection timeout after 10 seconds".to_string(),
            unit_id: "netease".to_string(),
            predicted_code: ErrorCode::PluginTimeout,
            actual_code: if i < 3 {
                ErrorCode::PluginTimeout
            } else {
                ErrorCode::PluginNetworkError
            },
            correct: i < 3,
            confidence: 0.7,
            timestamp: Utc::now(),
        })
        .collect();

    classifier.update_weights(&feedback);
    assert!((classifier.accuracy() - 0.75).abs() < 1e-9);
}

#[test]
fn reset_discards_trained_state() {
    let classifier = HybridClassifier::new();
    classifier.train(&timeout_examples()).unwrap();
    classifier.add_rule(strong_network_rule()).unwrap();

    classifier.reset();
    assert!(classifier.rules().is_empty());
    let result = classifier.classify(
        &unknown("connection timeout after 30 seconds"),
        "netease",
    );
    assert_eq!(result.code, ErrorCode::Unknown);
}

#[test]
fn disabled_rule_does_not_match() {
    let classifier = HybridClassifier::new();
    let mut rule = strong_network_rule();
    rule.enabled = false;
    classifier.add_rule(rule).unwrap();

    let result = classifier.classify(&unknown("request timeout"), "netease");
    assert_eq!(result.code, ErrorCode::Unknown);
}
