//! Issue registry
//!
//! Repair issues surfaced to the user, keyed by (domain, issue_id).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Severity of a repair issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Error,
    Warning,
}

/// A repair issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Domain that owns the issue
    pub domain: String,
    pub issue_id: String,
    /// Domain the issue is about, when it differs from the owner
    pub issue_domain: Option<String>,
    pub is_fixable: bool,
    pub severity: IssueSeverity,
    pub translation_key: Option<String>,
    pub translation_placeholders: HashMap<String, String>,
    /// Free-form data attached by the creator
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
}

impl Issue {
    pub fn new(domain: impl Into<String>, issue_id: impl Into<String>, severity: IssueSeverity) -> Self {
        Self {
            domain: domain.into(),
            issue_id: issue_id.into(),
            issue_domain: None,
            is_fixable: false,
            severity,
            translation_key: None,
            translation_placeholders: HashMap::new(),
            data: serde_json::Value::Null,
            created: Utc::now(),
        }
    }

    pub fn with_issue_domain(mut self, issue_domain: impl Into<String>) -> Self {
        self.issue_domain = Some(issue_domain.into());
        self
    }

    pub fn with_translation_key(mut self, key: impl Into<String>) -> Self {
        self.translation_key = Some(key.into());
        self
    }

    pub fn with_placeholder(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.translation_placeholders.insert(name.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn fixable(mut self, is_fixable: bool) -> Self {
        self.is_fixable = is_fixable;
        self
    }
}

/// In-memory registry of repair issues
#[derive(Debug, Default)]
pub struct IssueRegistry {
    issues: DashMap<(String, String), Issue>,
}

impl IssueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an issue. The original creation time is kept on replace.
    pub fn create(&self, mut issue: Issue) {
        let key = (issue.domain.clone(), issue.issue_id.clone());
        if let Some(existing) = self.issues.get(&key) {
            issue.created = existing.created;
            debug!(domain = %key.0, issue_id = %key.1, "Updated issue");
        } else {
            info!(domain = %key.0, issue_id = %key.1, "Created issue");
        }
        self.issues.insert(key, issue);
    }

    /// Delete an issue; deleting an unknown issue is a no-op
    pub fn delete(&self, domain: &str, issue_id: &str) -> Option<Issue> {
        let (_, issue) = self
            .issues
            .remove(&(domain.to_string(), issue_id.to_string()))?;
        info!(domain, issue_id, "Deleted issue");
        Some(issue)
    }

    pub fn get(&self, domain: &str, issue_id: &str) -> Option<Issue> {
        self.issues
            .get(&(domain.to_string(), issue_id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.issues.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_delete() {
        let registry = IssueRegistry::new();
        registry.create(
            Issue::new("homeassistant", "config_entry_reauth_hue_abc", IssueSeverity::Error)
                .with_issue_domain("hue")
                .with_translation_key("config_entry_reauth")
                .with_placeholder("name", "Living room bridge")
                .with_data(serde_json::json!({"flow_id": "f1"})),
        );

        let issue = registry
            .get("homeassistant", "config_entry_reauth_hue_abc")
            .unwrap();
        assert_eq!(issue.issue_domain.as_deref(), Some("hue"));
        assert_eq!(issue.translation_placeholders["name"], "Living room bridge");
        assert!(!issue.is_fixable);

        assert!(registry.delete("homeassistant", "config_entry_reauth_hue_abc").is_some());
        assert!(registry.delete("homeassistant", "config_entry_reauth_hue_abc").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replace_keeps_creation_time() {
        let registry = IssueRegistry::new();
        registry.create(Issue::new("homeassistant", "i1", IssueSeverity::Warning));
        let created = registry.get("homeassistant", "i1").unwrap().created;

        registry.create(Issue::new("homeassistant", "i1", IssueSeverity::Critical));
        let issue = registry.get("homeassistant", "i1").unwrap();
        assert_eq!(issue.created, created);
        assert_eq!(issue.severity, IssueSeverity::Critical);
        assert_eq!(registry.len(), 1);
    }
}
