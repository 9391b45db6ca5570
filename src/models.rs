//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation. Inputs are
//! checked again by the validators in `server` before reaching the engine.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::compose::OutgoingMessage;
use crate::rules::{Rule, RulePatch};

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Message summary for search results
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: Option<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub label_ids: Vec<String>,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    pub size_bytes: usize,
    /// Gmail part id (e.g., `1`, `2.1`)
    pub part_id: String,
    /// Id for fetching the attachment body separately
    pub attachment_id: Option<String>,
}

/// Full message detail returned by `read_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageDetail {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    /// All headers or curated subset (if `include_headers=true`)
    pub headers: Option<Vec<(String, String)>>,
    /// Plain text body (truncated to `body_max_chars`)
    pub body_text: Option<String>,
    /// Sanitized HTML body (if `include_html=true`, truncated)
    pub body_html: Option<String>,
    pub attachments: Option<Vec<AttachmentInfo>>,
}

/// Input: search messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchEmailsInput {
    /// Gmail search query (e.g., `from:alice is:unread`)
    pub query: String,
    /// Maximum messages to return (1..100, default 10)
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Page token from a previous search
    pub page_token: Option<String>,
}

/// Input: read one message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadEmailInput {
    pub message_id: String,
    /// Maximum body characters (100..20000, default 2000)
    #[serde(default = "default_body_max_chars")]
    pub body_max_chars: usize,
    /// Include headers in response
    #[serde(default = "default_true")]
    pub include_headers: bool,
    /// Include all headers (if `true`, overrides curated header list)
    #[serde(default)]
    pub include_all_headers: bool,
    /// Include sanitized HTML body
    #[serde(default)]
    pub include_html: bool,
}

/// Input: change labels on one message
///
/// Requires at least one of `add_label_ids` / `remove_label_ids`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ModifyEmailInput {
    pub message_id: String,
    pub add_label_ids: Option<Vec<String>>,
    pub remove_label_ids: Option<Vec<String>>,
}

/// Input: message id only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MessageIdInput {
    pub message_id: String,
}

/// Input: permanently delete one message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteEmailInput {
    pub message_id: String,
    /// Explicit confirmation required (must be `true`)
    pub confirm: bool,
}

/// Input: change labels on a list of messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BatchModifyEmailsInput {
    pub message_ids: Vec<String>,
    pub add_label_ids: Option<Vec<String>>,
    pub remove_label_ids: Option<Vec<String>>,
    /// Ids per call (1..1000, default from `GMAIL_MCP_DEFAULT_BATCH_SIZE`)
    pub batch_size: Option<usize>,
}

/// Input: permanently delete a list of messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BatchDeleteEmailsInput {
    pub message_ids: Vec<String>,
    /// Ids per call (1..1000, default from `GMAIL_MCP_DEFAULT_BATCH_SIZE`)
    pub batch_size: Option<usize>,
    /// Explicit confirmation required (must be `true`)
    pub confirm: bool,
}

/// Input: compose a message to send or save as a draft
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComposeEmailInput {
    /// Recipient addresses (at least one)
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    /// Plain text body
    pub body: String,
    /// Optional HTML alternative to `body`
    pub html_body: Option<String>,
    /// Gmail thread to file the message under
    pub thread_id: Option<String>,
    /// `Message-ID` header of the message being replied to
    pub in_reply_to: Option<String>,
}

impl ComposeEmailInput {
    /// Split into the message to render and the target thread
    pub fn into_message(self) -> (OutgoingMessage, Option<String>) {
        (
            OutgoingMessage {
                to: self.to,
                cc: self.cc,
                bcc: self.bcc,
                subject: self.subject,
                body_text: self.body,
                body_html: self.html_body,
                in_reply_to: self.in_reply_to,
            },
            self.thread_id,
        )
    }
}

/// Input: create a label
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateLabelInput {
    pub name: String,
    /// `show` or `hide` (default `show`)
    pub message_list_visibility: Option<String>,
    /// `labelShow`, `labelShowIfUnread`, or `labelHide` (default `labelShow`)
    pub label_list_visibility: Option<String>,
}

/// Input: rename a label or change its visibility
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateLabelInput {
    pub label_id: String,
    pub name: Option<String>,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
}

/// Input: label id only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LabelIdInput {
    pub label_id: String,
}

/// Input: label name only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LabelNameInput {
    pub name: String,
}

/// Input: delete or trash every message matching a query
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteEmailsByQueryInput {
    pub query: String,
    /// Messages per page (10..500, default from `GMAIL_MCP_DEFAULT_BATCH_SIZE`)
    pub batch_size: Option<usize>,
    /// Report the estimated match count without changing anything
    #[serde(default)]
    pub dry_run: bool,
    /// Permanently delete instead of moving to trash
    #[serde(default)]
    pub permanent: bool,
    /// Explicit confirmation, required unless `dry_run=true`
    #[serde(default)]
    pub confirm: bool,
}

/// Label operation applied by `bulk_label_emails`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Add,
    Remove,
    /// Remove all non-system labels, then add the given ones
    Replace,
}

/// Input: add, remove, or replace labels on every message matching a query
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BulkLabelEmailsInput {
    pub query: String,
    pub action: LabelAction,
    /// Label names (resolved to ids, exact and case-sensitive)
    pub label_names: Vec<String>,
    /// Create labels that do not exist yet (ignored for `remove`)
    #[serde(default)]
    pub create_missing_labels: bool,
    /// Messages per page (10..500, default from `GMAIL_MCP_DEFAULT_BATCH_SIZE`)
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Rule criteria as supplied by a caller
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RuleInput {
    /// Label applied to matching messages (created on first run if absent)
    pub label_name: String,
    /// Sender pattern, searched as `from:<pattern>`
    pub sender_pattern: Option<String>,
    /// Subject phrase, searched as `subject:"<pattern>"`
    pub subject_pattern: Option<String>,
    /// Any-of subject phrases
    pub subject_contains: Option<Vec<String>>,
    /// Raw Gmail query; overrides the pattern fields
    pub query: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl From<RuleInput> for Rule {
    fn from(input: RuleInput) -> Self {
        let mut rule = Rule::new(input.label_name);
        rule.sender_pattern = input.sender_pattern;
        rule.subject_pattern = input.subject_pattern;
        rule.subject_contains = input.subject_contains;
        rule.query = input.query;
        rule.enabled = input.enabled;
        rule
    }
}

/// Input: rule index only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RuleIndexInput {
    /// Zero-based position from `list_auto_labeling_rules`
    pub index: usize,
}

/// Input: partial rule update
///
/// Omitted fields are unchanged; an empty string or list clears a criterion.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateRuleInput {
    pub index: usize,
    pub label_name: Option<String>,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub subject_contains: Option<Vec<String>>,
    pub query: Option<String>,
    pub enabled: Option<bool>,
}

impl UpdateRuleInput {
    pub fn into_patch(self) -> (usize, RulePatch) {
        (
            self.index,
            RulePatch {
                label_name: self.label_name,
                sender_pattern: self.sender_pattern,
                subject_pattern: self.subject_pattern,
                subject_contains: self.subject_contains,
                query: self.query,
                enabled: self.enabled,
            },
        )
    }
}

/// Input: run the stored rules
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunRulesInput {
    /// Count matches without labeling or stamping `last_run`
    #[serde(default)]
    pub dry_run: bool,
    /// Cap on matched messages per rule
    pub max_per_rule: Option<usize>,
    /// Search page size (1..500, default 100)
    #[serde(default = "default_rule_batch_size")]
    pub batch_size: usize,
    /// Maximum search pages per rule (1..100, default 10)
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
}

/// Input: run inline rules, or the stored ones when none are given
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AutoLabelEmailsInput {
    pub rules: Option<Vec<RuleInput>>,
    /// Append the inline rules to the rule store before running
    #[serde(default)]
    pub save_rules: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub max_per_rule: Option<usize>,
    #[serde(default = "default_rule_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
}

/// Input: export rules
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExportRulesInput {
    /// Target file (default `<config dir>/auto-label-rules-export.json`)
    pub path: Option<String>,
}

/// Input: import rules
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ImportRulesInput {
    /// File in the `{version, lastUpdated, rules}` format
    pub path: String,
    /// Append to the stored rules instead of replacing them
    #[serde(default)]
    pub merge: bool,
}

/// Default value for `bool` fields (true)
fn default_true() -> bool {
    true
}

/// Default value for `max_results` in search
fn default_max_results() -> usize {
    10
}

/// Default value for `body_max_chars` in read_email
///
/// 2,000 characters is typically sufficient to understand message content.
fn default_body_max_chars() -> usize {
    2_000
}

fn default_rule_batch_size() -> usize {
    100
}

fn default_max_batches() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        AutoLabelEmailsInput, BulkLabelEmailsInput, ComposeEmailInput, DeleteEmailsByQueryInput,
        LabelAction, RuleInput, UpdateRuleInput,
    };
    use crate::rules::Rule;

    #[test]
    fn run_defaults_match_runner_defaults() {
        let input: AutoLabelEmailsInput = serde_json::from_value(json!({})).expect("input");
        assert!(input.rules.is_none());
        assert!(!input.dry_run);
        assert_eq!(input.batch_size, 100);
        assert_eq!(input.max_batches, 10);
    }

    #[test]
    fn compose_input_maps_body_fields() {
        let input: ComposeEmailInput = serde_json::from_value(json!({
            "to": ["alice@example.com"],
            "subject": "Hi",
            "body": "Hello",
            "thread_id": "t1",
        }))
        .expect("input");
        let (message, thread_id) = input.into_message();
        assert!(message.cc.is_empty() && message.bcc.is_empty());
        assert_eq!(message.body_text, "Hello");
        assert!(message.body_html.is_none());
        assert_eq!(thread_id.as_deref(), Some("t1"));
    }

    #[test]
    fn delete_by_query_is_unconfirmed_trash_by_default() {
        let input: DeleteEmailsByQueryInput =
            serde_json::from_value(json!({ "query": "older_than:1y" })).expect("input");
        assert!(!input.permanent);
        assert!(!input.confirm);
        assert!(input.batch_size.is_none());
    }

    #[test]
    fn label_action_is_lowercase() {
        let input: BulkLabelEmailsInput = serde_json::from_value(json!({
            "query": "from:a",
            "action": "replace",
            "label_names": ["Project-Y"],
        }))
        .expect("input");
        assert_eq!(input.action, LabelAction::Replace);
        assert!(serde_json::from_value::<BulkLabelEmailsInput>(json!({
            "query": "q", "action": "move", "label_names": []
        }))
        .is_err());
    }

    #[test]
    fn rule_input_converts_enabled_rule() {
        let input: RuleInput = serde_json::from_value(json!({
            "label_name": "Receipts",
            "subject_contains": ["invoice"],
        }))
        .expect("input");
        let rule = Rule::from(input);
        assert!(rule.enabled);
        assert_eq!(rule.subject_contains, Some(vec!["invoice".to_owned()]));
        assert!(rule.last_run.is_none());
    }

    #[test]
    fn update_input_keeps_omitted_fields_unset() {
        let input: UpdateRuleInput =
            serde_json::from_value(json!({ "index": 2, "enabled": false })).expect("input");
        let (index, patch) = input.into_patch();
        assert_eq!(index, 2);
        assert_eq!(patch.enabled, Some(false));
        assert!(patch.label_name.is_none());
        assert!(patch.query.is_none());
    }
}
