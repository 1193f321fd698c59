//! User-defined classification rules.
//!
//! Rules are ordered by descending priority; the first rule whose conditions
//! all hold determines the classification with the rule's weight as
//! confidence.

use crate::error::ResilienceError;
use crate::errors::{ErrorCode, ErrorSeverity, ErrorType};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::Display;
use tracing::info;

/// Field a rule condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Message,
    UnitId,
    Feature,
}

/// Comparison applied by a rule condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Contains,
    Equals,
    Regex,
    StartsWith,
    EndsWith,
}

/// Single condition within a rule; all of a rule's conditions must hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: String,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl RuleCondition {
    pub fn new(field: ConditionField, operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
            compiled: None,
        }
    }

    fn compile(&mut self) -> Result<(), ResilienceError> {
        if self.operator == ConditionOperator::Regex {
            let regex = Regex::new(&self.value).map_err(|e| {
                ResilienceError::Validation(format!(
                    "invalid regex in rule condition '{}': {}",
                    self.value, e
                ))
            })?;
            self.compiled = Some(regex);
        }
        Ok(())
    }

    fn evaluate(&self, message: &str, unit_id: &str, features: &HashMap<String, f64>) -> bool {
        match self.field {
            ConditionField::Message => self.evaluate_string(message),
            ConditionField::UnitId => self.evaluate_string(unit_id),
            ConditionField::Feature => features.contains_key(&self.value),
        }
    }

    fn evaluate_string(&self, value: &str) -> bool {
        let lower = value.to_lowercase();
        let target = self.value.to_lowercase();
        match self.operator {
            ConditionOperator::Contains => lower.contains(&target),
            ConditionOperator::Equals => lower == target,
            ConditionOperator::StartsWith => lower.starts_with(&target),
            ConditionOperator::EndsWith => lower.ends_with(&target),
            ConditionOperator::Regex => self
                .compiled
                .as_ref()
                .map(|regex| regex.is_match(value))
                .unwrap_or(false),
        }
    }
}

/// Classification a matched rule assigns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationAction {
    pub code: ErrorCode,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub subcategory: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<RuleCondition>,
    pub action: ClassificationAction,
    pub priority: i32,
    pub enabled: bool,
    pub weight: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ClassificationRule {
    pub fn matches(&self, message: &str, unit_id: &str, features: &HashMap<String, f64>) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.evaluate(message, unit_id, features))
    }
}

/// Rules kept sorted by descending priority
#[derive(Default)]
pub struct RuleStore {
    rules: Vec<ClassificationRule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut rule: ClassificationRule) -> Result<(), ResilienceError> {
        if self.rules.iter().any(|existing| existing.id == rule.id) {
            return Err(ResilienceError::AlreadyExists(format!(
                "classification rule '{}'",
                rule.id
            )));
        }

        for condition in &mut rule.conditions {
            condition.compile()?;
        }

        rule.created_at = Utc::now();
        rule.updated_at = Utc::now();

        let position = self
            .rules
            .iter()
            .position(|existing| rule.priority > existing.priority)
            .unwrap_or(self.rules.len());
        info!(
            rule_id = %rule.id,
            rule_name = %rule.name,
            priority = rule.priority,
            "Classification rule added"
        );
        self.rules.insert(position, rule);

        Ok(())
    }

    pub fn remove(&mut self, rule_id: &str) -> Result<ClassificationRule, ResilienceError> {
        let position = self
            .rules
            .iter()
            .position(|rule| rule.id == rule_id)
            .ok_or_else(|| {
                ResilienceError::NotFound(format!("classification rule '{}'", rule_id))
            })?;
        info!(rule_id = %rule_id, "Classification rule removed");
        Ok(self.rules.remove(position))
    }

    /// Rules in evaluation order (descending priority)
    pub fn all(&self) -> Vec<ClassificationRule> {
        self.rules.clone()
    }

    /// First enabled rule whose conditions all hold
    pub fn first_match(
        &self,
        message: &str,
        unit_id: &str,
        features: &HashMap<String, f64>,
    ) -> Option<&ClassificationRule> {
        self.rules
            .iter()
            .filter(|rule| rule.enabled)
            .find(|rule| rule.matches(message, unit_id, features))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}
