//! Command-line based process labelling

use serde::{Deserialize, Serialize};

/// Label given to processes no criterion matches
pub const DEFAULT_LABEL: &str = "main process";

/// A single (keyword, label) rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCriterion {
    pub keyword: String,
    pub label: String,
}

impl LabelCriterion {
    pub fn new(keyword: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            label: label.into(),
        }
    }

    pub fn matches(&self, cmdline: &str) -> bool {
        cmdline.contains(&self.keyword)
    }
}

/// Ordered rule list; the first matching criterion wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelCriteria {
    rules: Vec<LabelCriterion>,
}

impl LabelCriteria {
    pub fn new(rules: Vec<LabelCriterion>) -> Self {
        Self { rules }
    }

    /// Label for a command line, falling back to [`DEFAULT_LABEL`]
    pub fn classify(&self, cmdline: &str) -> String {
        self.rules
            .iter()
            .find(|rule| rule.matches(cmdline))
            .map(|rule| rule.label.clone())
            .unwrap_or_else(|| DEFAULT_LABEL.to_string())
    }

    /// Every label this rule list can produce, in rule order
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::with_capacity(self.rules.len() + 1);
        for rule in &self.rules {
            if !labels.contains(&rule.label) {
                labels.push(rule.label.clone());
            }
        }
        if !labels.iter().any(|l| l == DEFAULT_LABEL) {
            labels.push(DEFAULT_LABEL.to_string());
        }
        labels
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl From<Vec<LabelCriterion>> for LabelCriteria {
    fn from(rules: Vec<LabelCriterion>) -> Self {
        Self::new(rules)
    }
}
