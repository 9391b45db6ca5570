//! Auto-labeling rule model and file-backed rule store
//!
//! Rules live in a single JSON document (`{version, lastUpdated, rules}`)
//! that is always rewritten whole. There is no locking: two tool calls that
//! mutate rules at the same time race, and the last writer wins.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::errors::{AppError, AppResult};
use crate::query;

/// Envelope format version written on every save
pub const RULES_FORMAT_VERSION: &str = "1.0";

/// Stored auto-labeling rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Name of the label applied to matching messages
    pub label_name: String,
    /// Sender pattern, searched as `from:<pattern>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_pattern: Option<String>,
    /// Subject phrase, searched as `subject:"<pattern>"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_pattern: Option<String>,
    /// Any-of subject phrases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_contains: Option<Vec<String>>,
    /// Raw search query; overrides every pattern field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// New enabled rule with no criteria
    pub fn new(label_name: impl Into<String>) -> Self {
        Self {
            label_name: label_name.into(),
            sender_pattern: None,
            subject_pattern: None,
            subject_contains: None,
            query: None,
            enabled: true,
            created: Utc::now(),
            last_run: None,
        }
    }
}

/// On-disk envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_version() -> String {
    RULES_FORMAT_VERSION.to_owned()
}

/// Partial rule update
///
/// `None` leaves a field unchanged. An empty string (or empty list for
/// `subject_contains`) clears an optional criterion.
#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub label_name: Option<String>,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub subject_contains: Option<Vec<String>>,
    pub query: Option<String>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    fn apply(self, rule: &mut Rule) {
        if let Some(label_name) = self.label_name {
            rule.label_name = label_name;
        }
        if let Some(v) = self.sender_pattern {
            rule.sender_pattern = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = self.subject_pattern {
            rule.subject_pattern = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = self.subject_contains {
            rule.subject_contains = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = self.query {
            rule.query = (!v.is_empty()).then_some(v);
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
    }
}

/// Result of an import
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub total: usize,
    pub merged: bool,
}

/// Whole-file rule persistence
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
    default_export_path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>, default_export_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_export_path: default_export_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all rules
    ///
    /// A missing or corrupt file yields an empty list; this never fails.
    pub async fn load(&self) -> Vec<Rule> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot read rule file");
                return Vec::new();
            }
        };
        match serde_json::from_str::<RuleSetConfig>(&raw) {
            Ok(config) => config.rules,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "rule file is not valid, treating as empty");
                Vec::new()
            }
        }
    }

    /// Replace the stored rule list
    pub async fn save(&self, rules: &[Rule]) -> AppResult<()> {
        write_envelope(&self.path, rules).await?;
        tracing::debug!(path = %self.path.display(), count = rules.len(), "rules saved");
        Ok(())
    }

    /// Append a rule, returning its index
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `label_name` is empty
    /// - `InvalidRequest` if the rule has no search criteria
    pub async fn add(&self, rule: Rule) -> AppResult<usize> {
        validate_rule(&rule)?;
        let mut rules = self.load().await;
        rules.push(rule);
        self.save(&rules).await?;
        Ok(rules.len() - 1)
    }

    pub async fn get(&self, index: usize) -> AppResult<Rule> {
        let rules = self.load().await;
        rules
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, rules.len()))
    }

    /// Apply a patch to the rule at `index`
    ///
    /// The patched rule must still have a label name and search criteria.
    pub async fn update(&self, index: usize, patch: RulePatch) -> AppResult<Rule> {
        let mut rules = self.load().await;
        let len = rules.len();
        let rule = rules.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
        let mut updated = rule.clone();
        patch.apply(&mut updated);
        validate_rule(&updated)?;
        *rule = updated.clone();
        self.save(&rules).await?;
        Ok(updated)
    }

    /// Remove the rule at `index`; later rules shift down by one
    pub async fn remove(&self, index: usize) -> AppResult<Rule> {
        let mut rules = self.load().await;
        if index >= rules.len() {
            return Err(out_of_range(index, rules.len()));
        }
        let removed = rules.remove(index);
        self.save(&rules).await?;
        Ok(removed)
    }

    /// Record a completed run on a stored rule
    ///
    /// The rule is located at `index` if its `created` timestamp still
    /// matches, otherwise by `created` and label name anywhere in the list.
    /// Returns `false` if the rule no longer exists.
    pub async fn touch_last_run(
        &self,
        index: usize,
        label_name: &str,
        created: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut rules = self.load().await;
        let position = match rules.get(index) {
            Some(rule) if rule.created == created => Some(index),
            _ => rules
                .iter()
                .position(|r| r.created == created && r.label_name == label_name),
        };
        let Some(position) = position else {
            return Ok(false);
        };
        rules[position].last_run = Some(at);
        self.save(&rules).await?;
        Ok(true)
    }

    /// Write the current rules to `path` (or the default export path)
    pub async fn export(&self, path: Option<&Path>) -> AppResult<(PathBuf, usize)> {
        let target = path.map_or_else(|| self.default_export_path.clone(), Path::to_path_buf);
        let rules = self.load().await;
        write_envelope(&target, &rules).await?;
        tracing::info!(path = %target.display(), count = rules.len(), "rules exported");
        Ok((target, rules.len()))
    }

    /// Read a rule set from `path` and replace (or, with `merge`, extend)
    /// the stored rules
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the file cannot be read, is not JSON, lacks a
    ///   `rules` array, or holds a rule without a label name
    pub async fn import(&self, path: &Path, merge: bool) -> AppResult<ImportSummary> {
        let raw = fs::read_to_string(path).await.map_err(|e| {
            AppError::InvalidInput(format!("cannot read import file {}: {e}", path.display()))
        })?;
        let imported = parse_import(&raw)?;

        let mut rules = if merge {
            self.load().await
        } else {
            Vec::new()
        };
        let count = imported.len();
        rules.extend(imported);
        self.save(&rules).await?;
        tracing::info!(path = %path.display(), imported = count, total = rules.len(), merge, "rules imported");
        Ok(ImportSummary {
            imported: count,
            total: rules.len(),
            merged: merge,
        })
    }
}

fn parse_import(raw: &str) -> AppResult<Vec<Rule>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| AppError::InvalidInput(format!("import file is not valid JSON: {e}")))?;
    let entries = value
        .get("rules")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| AppError::invalid("import file must contain a 'rules' array"))?;

    let mut rules = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let rule: Rule = serde_json::from_value(entry.clone())
            .map_err(|e| AppError::InvalidInput(format!("rule {i} is malformed: {e}")))?;
        if rule.label_name.trim().is_empty() {
            return Err(AppError::InvalidInput(format!(
                "rule {i} is missing label_name"
            )));
        }
        rules.push(rule);
    }
    Ok(rules)
}

/// Validate a rule for creation or update
pub fn validate_rule(rule: &Rule) -> AppResult<()> {
    if rule.label_name.trim().is_empty() {
        return Err(AppError::invalid("label_name must not be empty"));
    }
    if !query::has_criteria(rule) {
        return Err(AppError::request(
            "rule needs a query or at least one of sender_pattern, subject_pattern, subject_contains",
        ));
    }
    Ok(())
}

fn out_of_range(index: usize, len: usize) -> AppError {
    AppError::InvalidRequest(format!(
        "rule index {index} is out of range; {len} rule(s) stored"
    ))
}

/// Serialize the envelope to a sibling temp file, then rename over `path`
async fn write_envelope(path: &Path, rules: &[Rule]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| {
            AppError::Internal(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    let envelope = RuleSetConfig {
        version: RULES_FORMAT_VERSION.to_owned(),
        last_updated: Utc::now(),
        rules: rules.to_vec(),
    };
    let body = serde_json::to_string_pretty(&envelope)
        .map_err(|e| AppError::Internal(format!("serialization failure: {e}")))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)
        .await
        .map_err(|e| AppError::Internal(format!("cannot write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::Internal(format!("cannot replace {}: {e}", path.display())))
}
