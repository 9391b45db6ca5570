//! Remote mailbox capability interface
//!
//! The rule engine, batch executor, and tool handlers only talk to the
//! mailbox through [`Mailbox`]. The production implementation is
//! [`crate::gmail::GmailClient`]; tests use an in-memory fake.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Labels that a label replace never removes
pub const SYSTEM_LABELS: &[&str] = &[
    "INBOX",
    "SENT",
    "DRAFT",
    "SPAM",
    "TRASH",
    "IMPORTANT",
    "STARRED",
    "UNREAD",
];

/// Whether a label id is one of [`SYSTEM_LABELS`]
pub fn is_system_label(label_id: &str) -> bool {
    SYSTEM_LABELS.contains(&label_id)
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("gmail api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("oauth error: {0}")]
    Auth(String),
    #[error("unauthorized after refresh")]
    Unauthorized,
}

pub type MailboxResult<T> = Result<T, MailboxError>;

/// One page of message identifiers from a search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    /// Advisory total reported by the server, never exact
    pub result_size_estimate: u64,
}

/// How much of a message to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Ids and label ids only
    Minimal,
    /// Headers and snippet
    Metadata,
    /// Headers, snippet, and decoded body parts
    Full,
}

impl MessageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Metadata => "metadata",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePartBody {
    #[serde(default)]
    pub size: i64,
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Option<MessagePartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
    pub size_estimate: Option<u64>,
}

/// Draft as returned by `drafts.create`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    pub message: Option<Message>,
}

/// Label as returned by the labels endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub label_type: Option<String>,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
    pub messages_total: Option<u64>,
    pub messages_unread: Option<u64>,
}

/// Visibility settings for a new label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelVisibility {
    /// `show` or `hide`
    pub message_list_visibility: String,
    /// `labelShow`, `labelShowIfUnread`, or `labelHide`
    pub label_list_visibility: String,
}

impl Default for LabelVisibility {
    fn default() -> Self {
        Self {
            message_list_visibility: "show".to_owned(),
            label_list_visibility: "labelShow".to_owned(),
        }
    }
}

/// Partial label update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_list_visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_list_visibility: Option<String>,
}

/// Remote mailbox operations
///
/// Every method is a single remote operation. Implementations may
/// re-authenticate once on 401 but never retry other failures.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Search message ids, one page at a time
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> MailboxResult<MessagePage>;

    async fn get_message(&self, id: &str, format: MessageFormat) -> MailboxResult<Message>;

    async fn modify_message(
        &self,
        id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()>;

    /// Modify labels on up to 1000 messages in one call
    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()>;

    /// Permanently delete up to 1000 messages in one call
    async fn batch_delete(&self, ids: &[String]) -> MailboxResult<()>;

    async fn trash_message(&self, id: &str) -> MailboxResult<()>;

    /// Permanently delete one message
    async fn delete_message(&self, id: &str) -> MailboxResult<()>;

    async fn list_labels(&self) -> MailboxResult<Vec<Label>>;

    async fn create_label(&self, name: &str, visibility: &LabelVisibility)
    -> MailboxResult<Label>;

    async fn update_label(&self, id: &str, patch: &LabelPatch) -> MailboxResult<Label>;

    async fn delete_label(&self, id: &str) -> MailboxResult<()>;

    /// Send a base64url-encoded RFC 5322 message
    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Message>;

    /// Save a base64url-encoded RFC 5322 message as a draft
    async fn create_draft(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Draft>;
}

/// Find a label by exact, case-sensitive name
pub fn find_label_by_name<'a>(labels: &'a [Label], name: &str) -> Option<&'a Label> {
    labels.iter().find(|label| label.name == name)
}

/// Look up a label by exact name, creating it with default visibility if absent
///
/// Lists labels on every call; callers that resolve several labels pay one
/// round trip each.
pub async fn resolve_or_create_label(mailbox: &dyn Mailbox, name: &str) -> MailboxResult<Label> {
    let labels = mailbox.list_labels().await?;
    if let Some(existing) = find_label_by_name(&labels, name) {
        return Ok(existing.clone());
    }
    tracing::info!(label_name = name, "creating missing label");
    mailbox
        .create_label(name, &LabelVisibility::default())
        .await
}
