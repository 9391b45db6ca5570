//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the message, compose,
//! label, bulk, and auto-labeling tools. Handles input validation and response
//! formatting; the rule engine itself lives in `runner`, `batch`, and `rules`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::batch::{
    BatchExecutor, BatchOperationResult, BatchRun, BulkAction, MAX_IDS_PER_CALL, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, QueryRunOptions, clamp_page_size,
};
use crate::compose::OutgoingMessage;
use crate::config::ServerConfig;
use crate::content;
use crate::errors::{AppError, AppResult};
use crate::mailbox::{
    Label, LabelPatch, LabelVisibility, Mailbox, Message, MessageFormat, find_label_by_name,
    is_system_label,
};
use crate::models::{
    AutoLabelEmailsInput, BatchDeleteEmailsInput, BatchModifyEmailsInput, BulkLabelEmailsInput,
    ComposeEmailInput, CreateLabelInput, DeleteEmailInput, DeleteEmailsByQueryInput, ExportRulesInput,
    ImportRulesInput, LabelAction, LabelIdInput, LabelNameInput, MessageDetail, MessageIdInput,
    MessageSummary, Meta, ModifyEmailInput, ReadEmailInput, RuleIndexInput, RuleInput,
    RunRulesInput, SearchEmailsInput, ToolEnvelope, UpdateLabelInput, UpdateRuleInput,
};
use crate::query::effective_query;
use crate::rules::{ImportSummary, Rule, RuleStore, validate_rule};
use crate::runner::{RuleRunner, RuleSource, RunOptions, RunReport};

/// Maximum messages per search result page
const MAX_SEARCH_RESULTS: usize = 100;
/// Maximum attachments to return per message
const MAX_ATTACHMENTS: usize = 50;
/// Maximum length of a search query or id argument
const MAX_QUERY_CHARS: usize = 2_048;
const MAX_ID_CHARS: usize = 256;
/// Gmail rejects longer label names
const MAX_LABEL_NAME_CHARS: usize = 225;
/// RFC 5321 address and RFC 5322 line limits
const MAX_ADDRESS_CHARS: usize = 320;
const MAX_SUBJECT_CHARS: usize = 998;
/// Bounds for rule runs
const MAX_RUN_BATCH_SIZE: usize = 500;
const MAX_RUN_BATCHES: usize = 100;

const MESSAGE_LIST_VISIBILITY: &[&str] = &["show", "hide"];
const LABEL_LIST_VISIBILITY: &[&str] = &["labelShow", "labelShowIfUnread", "labelHide"];

/// Gmail MCP server
///
/// Holds the shared mailbox client and rule store. Implements MCP tool
/// handlers via `#[tool]` attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct GmailMcpServer {
    /// Server config (paths, batch defaults)
    config: Arc<ServerConfig>,
    /// Remote mailbox (Gmail REST client in production)
    mailbox: Arc<dyn Mailbox>,
    /// Persistent auto-labeling rules
    rules: Arc<RuleStore>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GmailMcpServer {
    /// Create a new MCP server instance over `mailbox`
    pub fn new(config: ServerConfig, mailbox: Arc<dyn Mailbox>) -> Self {
        let rules = RuleStore::new(config.rules_path.clone(), config.rules_export_path.clone());
        tracing::debug!(rules_path = %rules.path().display(), "rule store configured");
        Self {
            config: Arc::new(config),
            mailbox,
            rules: Arc::new(rules),
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Search messages
    ///
    /// Lists one page of ids for a Gmail query, then fetches headers and
    /// snippet for each id concurrently.
    #[tool(
        name = "search_emails",
        description = "Search messages using Gmail query syntax"
    )]
    async fn search_emails(
        &self,
        Parameters(input): Parameters<SearchEmailsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.search_emails_impl(input).await.map(|data| {
                (
                    format!(
                        "{} message(s) returned",
                        data["messages"].as_array().map_or(0, Vec::len)
                    ),
                    data,
                )
            }),
        )
    }

    /// Tool: Get parsed message details
    ///
    /// Returns structured message data with headers, body text/HTML, and
    /// attachment metadata. Supports bounded enrichment (char limits,
    /// optional HTML).
    #[tool(name = "read_email", description = "Get parsed message details")]
    async fn read_email(
        &self,
        Parameters(input): Parameters<ReadEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.read_email_impl(input)
                .await
                .map(|data| ("Message retrieved".to_owned(), data)),
        )
    }

    #[tool(
        name = "modify_email",
        description = "Add or remove labels on one message"
    )]
    async fn modify_email(
        &self,
        Parameters(input): Parameters<ModifyEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.modify_email_impl(input)
                .await
                .map(|data| ("Labels updated".to_owned(), data)),
        )
    }

    #[tool(name = "trash_email", description = "Move one message to trash")]
    async fn trash_email(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.trash_email_impl(input)
                .await
                .map(|data| ("Message moved to trash".to_owned(), data)),
        )
    }

    /// Tool: Permanently delete one message
    ///
    /// Requires explicit `confirm=true`.
    #[tool(
        name = "delete_email",
        description = "Permanently delete one message (requires confirm=true)"
    )]
    async fn delete_email(
        &self,
        Parameters(input): Parameters<DeleteEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.delete_email_impl(input)
                .await
                .map(|data| ("Message permanently deleted".to_owned(), data)),
        )
    }

    /// Tool: Change labels on explicit message ids
    ///
    /// Ids are chunked by `batch_size`; a failed chunk is retried per message.
    #[tool(
        name = "batch_modify_emails",
        description = "Add or remove labels on many messages, in batches"
    )]
    async fn batch_modify_emails(
        &self,
        Parameters(input): Parameters<BatchModifyEmailsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.batch_modify_emails_impl(input)
                .await
                .and_then(|result| with_summary(result, |r| batch_summary("modified", r))),
        )
    }

    #[tool(
        name = "batch_delete_emails",
        description = "Permanently delete many messages, in batches (requires confirm=true)"
    )]
    async fn batch_delete_emails(
        &self,
        Parameters(input): Parameters<BatchDeleteEmailsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.batch_delete_emails_impl(input)
                .await
                .and_then(|result| with_summary(result, |r| batch_summary("deleted", r))),
        )
    }

    /// Tool: Send a new message
    ///
    /// Plain text body with an optional HTML alternative. Pass `thread_id`
    /// and `in_reply_to` to answer within an existing conversation.
    #[tool(
        name = "send_email",
        description = "Send an email (to/cc/bcc, subject, text body, optional HTML body)"
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<ComposeEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.send_email_impl(input).await.and_then(|sent| {
                with_summary(sent, |s| format!("Message sent (id {})", s.message_id))
            }),
        )
    }

    #[tool(
        name = "draft_email",
        description = "Save an email as a draft without sending it"
    )]
    async fn draft_email(
        &self,
        Parameters(input): Parameters<ComposeEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.draft_email_impl(input).await.and_then(|draft| {
                with_summary(draft, |d| {
                    format!("Draft created (id {})", d.draft_id.as_deref().unwrap_or("?"))
                })
            }),
        )
    }

    /// Tool: List all labels
    ///
    /// System labels first, then user labels by name.
    #[tool(
        name = "list_email_labels",
        description = "List system and user labels"
    )]
    async fn list_email_labels(&self) -> Result<Json<ToolEnvelope<Vec<Label>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_email_labels_impl().await.map(|labels| {
                let system = labels.iter().filter(|l| is_system_label(&l.id)).count();
                (
                    format!(
                        "{} label(s): {system} system, {} user",
                        labels.len(),
                        labels.len() - system
                    ),
                    labels,
                )
            }),
        )
    }

    #[tool(name = "create_label", description = "Create a new label")]
    async fn create_label(
        &self,
        Parameters(input): Parameters<CreateLabelInput>,
    ) -> Result<Json<ToolEnvelope<Label>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.create_label_impl(input)
                .await
                .map(|label| (format!("Label '{}' created", label.name), label)),
        )
    }

    /// Tool: Rename a label or change its visibility
    ///
    /// System labels cannot be changed.
    #[tool(
        name = "update_label",
        description = "Rename a user label or change its visibility"
    )]
    async fn update_label(
        &self,
        Parameters(input): Parameters<UpdateLabelInput>,
    ) -> Result<Json<ToolEnvelope<Label>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.update_label_impl(input)
                .await
                .map(|label| (format!("Label '{}' updated", label.name), label)),
        )
    }

    #[tool(name = "delete_label", description = "Delete a user label")]
    async fn delete_label(
        &self,
        Parameters(input): Parameters<LabelIdInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.delete_label_impl(input)
                .await
                .map(|data| ("Label deleted".to_owned(), data)),
        )
    }

    #[tool(
        name = "get_or_create_label",
        description = "Find a label by exact name, creating it if absent"
    )]
    async fn get_or_create_label(
        &self,
        Parameters(input): Parameters<LabelNameInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_or_create_label_impl(input).await.map(|data| {
                let summary = if data["created"].as_bool().unwrap_or(false) {
                    "Label created"
                } else {
                    "Existing label found"
                };
                (summary.to_owned(), data)
            }),
        )
    }

    /// Tool: Trash or permanently delete every message matching a query
    ///
    /// Requires `confirm=true` unless `dry_run=true`. Pages are processed
    /// until the listing is exhausted.
    #[tool(
        name = "delete_emails_by_query",
        description = "Trash (or permanently delete) all messages matching a query; dry_run previews"
    )]
    async fn delete_emails_by_query(
        &self,
        Parameters(input): Parameters<DeleteEmailsByQueryInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.delete_emails_by_query_impl(input)
                .await
                .and_then(|run| with_summary(run, run_summary)),
        )
    }

    /// Tool: Add, remove, or replace labels on every message matching a query
    #[tool(
        name = "bulk_label_emails",
        description = "Add, remove, or replace labels on all messages matching a query; dry_run previews"
    )]
    async fn bulk_label_emails(
        &self,
        Parameters(input): Parameters<BulkLabelEmailsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.bulk_label_emails_impl(input)
                .await
                .and_then(|data| with_summary(data, |d| run_summary(&d.run))),
        )
    }

    /// Tool: Store a new auto-labeling rule
    ///
    /// The rule needs a query or at least one pattern field.
    #[tool(
        name = "add_auto_labeling_rule",
        description = "Store an auto-labeling rule (sender/subject patterns or a raw query)"
    )]
    async fn add_auto_labeling_rule(
        &self,
        Parameters(input): Parameters<RuleInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.add_rule_impl(input).await.and_then(|rule| {
                with_summary(rule, |r| format!("Rule {} added for label '{}'", r.index, r.rule.label_name))
            }),
        )
    }

    #[tool(
        name = "list_auto_labeling_rules",
        description = "List stored auto-labeling rules with their effective queries"
    )]
    async fn list_auto_labeling_rules(
        &self,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            with_summary(self.list_rules_impl().await, |rules| {
                let enabled = rules.iter().filter(|r| r.rule.enabled).count();
                format!("{} rule(s) stored, {enabled} enabled", rules.len())
            }),
        )
    }

    #[tool(
        name = "update_auto_labeling_rule",
        description = "Update fields of a stored rule by index; empty values clear a criterion"
    )]
    async fn update_auto_labeling_rule(
        &self,
        Parameters(input): Parameters<UpdateRuleInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.update_rule_impl(input)
                .await
                .and_then(|rule| with_summary(rule, |r| format!("Rule {} updated", r.index))),
        )
    }

    #[tool(
        name = "remove_auto_labeling_rule",
        description = "Remove a stored rule by index; later rules shift down"
    )]
    async fn remove_auto_labeling_rule(
        &self,
        Parameters(input): Parameters<RuleIndexInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.remove_rule_impl(input).await.and_then(|rule| {
                with_summary(rule, |r| format!("Rule {} for label '{}' removed", r.index, r.rule.label_name))
            }),
        )
    }

    /// Tool: Run every stored rule
    ///
    /// Per-rule failures are reported in the result, never as a tool error.
    #[tool(
        name = "run_auto_labeling_rules",
        description = "Run stored auto-labeling rules; dry_run counts matches only"
    )]
    async fn run_auto_labeling_rules(
        &self,
        Parameters(input): Parameters<RunRulesInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.run_rules_impl(input)
                .await
                .and_then(|report| with_summary(report, report_summary)),
        )
    }

    /// Tool: Run inline rules (optionally saving them) or the stored rules
    #[tool(
        name = "auto_label_emails",
        description = "Label messages using inline rules (optionally saved) or the stored rules"
    )]
    async fn auto_label_emails(
        &self,
        Parameters(input): Parameters<AutoLabelEmailsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.auto_label_impl(input)
                .await
                .and_then(|report| with_summary(report, report_summary)),
        )
    }

    #[tool(
        name = "export_auto_labeling_rules",
        description = "Write stored rules to a JSON file"
    )]
    async fn export_auto_labeling_rules(
        &self,
        Parameters(input): Parameters<ExportRulesInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.export_rules_impl(input).await.map(|data| {
                (
                    format!("{} rule(s) exported", data["count"].as_u64().unwrap_or(0)),
                    data,
                )
            }),
        )
    }

    #[tool(
        name = "import_auto_labeling_rules",
        description = "Replace (or with merge=true, extend) stored rules from a JSON file"
    )]
    async fn import_auto_labeling_rules(
        &self,
        Parameters(input): Parameters<ImportRulesInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.import_rules_impl(input).await.and_then(|summary| {
                with_summary(summary, |s| {
                    format!("{} rule(s) imported, {} stored", s.imported, s.total)
                })
            }),
        )
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for GmailMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Gmail MCP server. Search, read, send, draft, and label messages; manage labels; run auto-labeling rules. Destructive tools require confirm=true; bulk tools support dry_run.",
        )
    }
}

/// Stored rule with its position and synthesized query
#[derive(Debug, Serialize)]
struct StoredRule {
    index: usize,
    query: String,
    #[serde(flatten)]
    rule: Rule,
}

impl StoredRule {
    fn new(index: usize, rule: Rule) -> Self {
        Self {
            index,
            query: effective_query(&rule),
            rule,
        }
    }
}

/// Result of `send_email` / `draft_email`
#[derive(Debug, Serialize)]
struct ComposedMessage {
    message_id: String,
    thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    draft_id: Option<String>,
    label_ids: Vec<String>,
}

/// Result of `bulk_label_emails`
#[derive(Debug, Serialize)]
struct BulkLabelResult {
    label_ids: Vec<String>,
    /// Labels created for this run (in a dry run: labels that would be created)
    created_labels: Vec<String>,
    #[serde(flatten)]
    run: BatchRun,
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool, separated
/// from the public `#[tool]` methods that handle response formatting.
impl GmailMcpServer {
    async fn search_emails_impl(&self, input: SearchEmailsInput) -> AppResult<serde_json::Value> {
        validate_query(&input.query)?;
        validate_range(input.max_results, 1, MAX_SEARCH_RESULTS, "max_results")?;
        if let Some(token) = &input.page_token {
            validate_id(token, "page_token")?;
        }

        let page = self
            .mailbox
            .list_messages(
                &input.query,
                input.max_results as u32,
                input.page_token.as_deref(),
            )
            .await?;
        let fetched = join_all(
            page.ids
                .iter()
                .map(|id| self.mailbox.get_message(id, MessageFormat::Metadata)),
        )
        .await;
        let messages = fetched
            .into_iter()
            .map(|message| message.map(|m| summarize(&m)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(serde_json::json!({
            "query": input.query,
            "result_size_estimate": page.result_size_estimate,
            "messages": messages,
            "next_page_token": page.next_page_token,
        }))
    }

    async fn read_email_impl(&self, input: ReadEmailInput) -> AppResult<serde_json::Value> {
        validate_id(&input.message_id, "message_id")?;
        validate_range(input.body_max_chars, 100, 20_000, "body_max_chars")?;

        let message = self
            .mailbox
            .get_message(&input.message_id, MessageFormat::Full)
            .await?;
        let parsed = content::parse_message(&message, input.body_max_chars, input.include_html)?;
        let headers = if input.include_headers || input.include_all_headers {
            Some(content::curated_headers(
                &parsed.headers_all,
                input.include_all_headers,
            ))
        } else {
            None
        };

        let detail = MessageDetail {
            id: message.id,
            thread_id: message.thread_id,
            label_ids: message.label_ids,
            date: parsed.date,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            subject: parsed.subject,
            snippet: message.snippet,
            headers,
            body_text: parsed.body_text,
            body_html: parsed.body_html_sanitized,
            attachments: Some(
                parsed
                    .attachments
                    .into_iter()
                    .take(MAX_ATTACHMENTS)
                    .collect(),
            ),
        };
        Ok(serde_json::json!({ "message": detail }))
    }

    async fn modify_email_impl(&self, input: ModifyEmailInput) -> AppResult<serde_json::Value> {
        validate_id(&input.message_id, "message_id")?;
        let (add, remove) = label_changes(input.add_label_ids, input.remove_label_ids)?;
        self.mailbox
            .modify_message(&input.message_id, &add, &remove)
            .await?;
        Ok(serde_json::json!({
            "message_id": input.message_id,
            "added_label_ids": add,
            "removed_label_ids": remove,
        }))
    }

    async fn trash_email_impl(&self, input: MessageIdInput) -> AppResult<serde_json::Value> {
        validate_id(&input.message_id, "message_id")?;
        self.mailbox.trash_message(&input.message_id).await?;
        Ok(serde_json::json!({ "message_id": input.message_id, "trashed": true }))
    }

    async fn delete_email_impl(&self, input: DeleteEmailInput) -> AppResult<serde_json::Value> {
        require_confirm(input.confirm, "delete_email")?;
        validate_id(&input.message_id, "message_id")?;
        self.mailbox.delete_message(&input.message_id).await?;
        tracing::info!(message_id = %input.message_id, "message permanently deleted");
        Ok(serde_json::json!({ "message_id": input.message_id, "deleted": true }))
    }

    async fn batch_modify_emails_impl(
        &self,
        input: BatchModifyEmailsInput,
    ) -> AppResult<BatchOperationResult> {
        validate_ids(&input.message_ids, "message_ids")?;
        let (add, remove) = label_changes(input.add_label_ids, input.remove_label_ids)?;
        let chunk_size = self.chunk_size(input.batch_size)?;
        let action = BulkAction::ModifyLabels { add, remove };
        Ok(BatchExecutor::new(self.mailbox.as_ref())
            .run_ids(&input.message_ids, &action, chunk_size)
            .await)
    }

    async fn batch_delete_emails_impl(
        &self,
        input: BatchDeleteEmailsInput,
    ) -> AppResult<BatchOperationResult> {
        require_confirm(input.confirm, "batch_delete_emails")?;
        validate_ids(&input.message_ids, "message_ids")?;
        let chunk_size = self.chunk_size(input.batch_size)?;
        Ok(BatchExecutor::new(self.mailbox.as_ref())
            .run_ids(&input.message_ids, &BulkAction::Delete, chunk_size)
            .await)
    }

    async fn send_email_impl(&self, input: ComposeEmailInput) -> AppResult<ComposedMessage> {
        let (message, thread_id) = validate_compose(input)?;
        let raw = message.to_base64_url()?;
        let sent = self
            .mailbox
            .send_message(&raw, thread_id.as_deref())
            .await?;
        tracing::info!(message_id = %sent.id, recipients = message.recipient_count(), "message sent");
        Ok(ComposedMessage {
            message_id: sent.id,
            thread_id: sent.thread_id,
            draft_id: None,
            label_ids: sent.label_ids,
        })
    }

    async fn draft_email_impl(&self, input: ComposeEmailInput) -> AppResult<ComposedMessage> {
        let (message, thread_id) = validate_compose(input)?;
        let raw = message.to_base64_url()?;
        let draft = self
            .mailbox
            .create_draft(&raw, thread_id.as_deref())
            .await?;
        let stored = draft.message.unwrap_or_default();
        Ok(ComposedMessage {
            message_id: stored.id,
            thread_id: stored.thread_id,
            draft_id: Some(draft.id),
            label_ids: stored.label_ids,
        })
    }

    async fn list_email_labels_impl(&self) -> AppResult<Vec<Label>> {
        let mut labels = self.mailbox.list_labels().await?;
        labels.sort_by(|a, b| {
            is_system_label(&b.id)
                .cmp(&is_system_label(&a.id))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(labels)
    }

    async fn create_label_impl(&self, input: CreateLabelInput) -> AppResult<Label> {
        validate_label_name(&input.name)?;
        let defaults = LabelVisibility::default();
        let visibility = LabelVisibility {
            message_list_visibility: input
                .message_list_visibility
                .unwrap_or(defaults.message_list_visibility),
            label_list_visibility: input
                .label_list_visibility
                .unwrap_or(defaults.label_list_visibility),
        };
        validate_visibility(
            &visibility.message_list_visibility,
            MESSAGE_LIST_VISIBILITY,
            "message_list_visibility",
        )?;
        validate_visibility(
            &visibility.label_list_visibility,
            LABEL_LIST_VISIBILITY,
            "label_list_visibility",
        )?;

        let label = self.mailbox.create_label(&input.name, &visibility).await?;
        tracing::info!(label_name = %label.name, label_id = %label.id, "label created");
        Ok(label)
    }

    async fn update_label_impl(&self, input: UpdateLabelInput) -> AppResult<Label> {
        validate_id(&input.label_id, "label_id")?;
        reject_system_label(&input.label_id)?;
        if let Some(name) = &input.name {
            validate_label_name(name)?;
        }
        if let Some(v) = &input.message_list_visibility {
            validate_visibility(v, MESSAGE_LIST_VISIBILITY, "message_list_visibility")?;
        }
        if let Some(v) = &input.label_list_visibility {
            validate_visibility(v, LABEL_LIST_VISIBILITY, "label_list_visibility")?;
        }
        let patch = LabelPatch {
            name: input.name,
            message_list_visibility: input.message_list_visibility,
            label_list_visibility: input.label_list_visibility,
        };
        if patch == LabelPatch::default() {
            return Err(AppError::invalid(
                "at least one of name/message_list_visibility/label_list_visibility is required",
            ));
        }
        Ok(self.mailbox.update_label(&input.label_id, &patch).await?)
    }

    async fn delete_label_impl(&self, input: LabelIdInput) -> AppResult<serde_json::Value> {
        validate_id(&input.label_id, "label_id")?;
        reject_system_label(&input.label_id)?;
        self.mailbox.delete_label(&input.label_id).await?;
        tracing::info!(label_id = %input.label_id, "label deleted");
        Ok(serde_json::json!({ "label_id": input.label_id, "deleted": true }))
    }

    async fn get_or_create_label_impl(&self, input: LabelNameInput) -> AppResult<serde_json::Value> {
        validate_label_name(&input.name)?;
        let labels = self.mailbox.list_labels().await?;
        let (label, created) = match find_label_by_name(&labels, &input.name) {
            Some(existing) => (existing.clone(), false),
            None => {
                let label = self
                    .mailbox
                    .create_label(&input.name, &LabelVisibility::default())
                    .await?;
                tracing::info!(label_name = %label.name, label_id = %label.id, "label created");
                (label, true)
            }
        };
        Ok(serde_json::json!({ "label": label, "created": created }))
    }

    async fn delete_emails_by_query_impl(
        &self,
        input: DeleteEmailsByQueryInput,
    ) -> AppResult<BatchRun> {
        validate_query(&input.query)?;
        if !input.dry_run && !input.confirm {
            return Err(AppError::invalid(
                "confirm=true is required unless dry_run=true",
            ));
        }
        let action = if input.permanent {
            BulkAction::Delete
        } else {
            BulkAction::Trash
        };
        let options = QueryRunOptions {
            batch_size: self.page_size(input.batch_size)?,
            dry_run: input.dry_run,
            max_batches: None,
        };
        Ok(BatchExecutor::new(self.mailbox.as_ref())
            .run_query(&input.query, &action, options)
            .await?)
    }

    /// Resolve label names against one label listing, then run the action
    ///
    /// Missing labels are created only for add/replace with
    /// `create_missing_labels=true`, and never in a dry run.
    async fn bulk_label_emails_impl(
        &self,
        input: BulkLabelEmailsInput,
    ) -> AppResult<BulkLabelResult> {
        validate_query(&input.query)?;
        if input.label_names.is_empty() {
            return Err(AppError::invalid("label_names must not be empty"));
        }
        let mut names: Vec<&str> = Vec::with_capacity(input.label_names.len());
        for name in &input.label_names {
            validate_label_name(name)?;
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }
        let options = QueryRunOptions {
            batch_size: self.page_size(input.batch_size)?,
            dry_run: input.dry_run,
            max_batches: None,
        };

        let labels = self.mailbox.list_labels().await?;
        let may_create = input.create_missing_labels && input.action != LabelAction::Remove;
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| find_label_by_name(&labels, name).is_none())
            .collect();
        if !missing.is_empty() && !may_create {
            return Err(AppError::NotFound(format!(
                "label(s) not found: {}",
                missing.join(", ")
            )));
        }

        let mut label_ids = Vec::with_capacity(names.len());
        let mut created_labels = Vec::new();
        for name in names {
            if let Some(label) = find_label_by_name(&labels, name) {
                label_ids.push(label.id.clone());
                continue;
            }
            created_labels.push(name.to_owned());
            if input.dry_run {
                continue;
            }
            let label = self
                .mailbox
                .create_label(name, &LabelVisibility::default())
                .await?;
            tracing::info!(label_name = name, label_id = %label.id, "created label for bulk labeling");
            label_ids.push(label.id);
        }

        let action = match input.action {
            LabelAction::Add => BulkAction::AddLabels(label_ids.clone()),
            LabelAction::Remove => BulkAction::RemoveLabels(label_ids.clone()),
            LabelAction::Replace => BulkAction::ReplaceLabels(label_ids.clone()),
        };
        let run = BatchExecutor::new(self.mailbox.as_ref())
            .run_query(&input.query, &action, options)
            .await?;
        Ok(BulkLabelResult {
            label_ids,
            created_labels,
            run,
        })
    }

    async fn add_rule_impl(&self, input: RuleInput) -> AppResult<StoredRule> {
        validate_rule_input(&input)?;
        let rule = Rule::from(input);
        let index = self.rules.add(rule.clone()).await?;
        tracing::info!(index, label_name = %rule.label_name, "rule added");
        Ok(StoredRule::new(index, rule))
    }

    async fn list_rules_impl(&self) -> Vec<StoredRule> {
        self.rules
            .load()
            .await
            .into_iter()
            .enumerate()
            .map(|(index, rule)| StoredRule::new(index, rule))
            .collect()
    }

    async fn update_rule_impl(&self, input: UpdateRuleInput) -> AppResult<StoredRule> {
        for (value, field) in [
            (&input.label_name, "label_name"),
            (&input.sender_pattern, "sender_pattern"),
            (&input.subject_pattern, "subject_pattern"),
            (&input.query, "query"),
        ] {
            if let Some(value) = value {
                validate_no_controls(value, field)?;
            }
        }
        for phrase in input.subject_contains.iter().flatten() {
            validate_no_controls(phrase, "subject_contains")?;
        }
        let (index, patch) = input.into_patch();
        let rule = self.rules.update(index, patch).await?;
        tracing::info!(index, label_name = %rule.label_name, "rule updated");
        Ok(StoredRule::new(index, rule))
    }

    async fn remove_rule_impl(&self, input: RuleIndexInput) -> AppResult<StoredRule> {
        let rule = self.rules.remove(input.index).await?;
        tracing::info!(index = input.index, label_name = %rule.label_name, "rule removed");
        Ok(StoredRule::new(input.index, rule))
    }

    async fn run_rules_impl(&self, input: RunRulesInput) -> AppResult<RunReport> {
        let options = run_options(
            input.dry_run,
            input.max_per_rule,
            input.batch_size,
            input.max_batches,
        )?;
        Ok(RuleRunner::new(self.mailbox.as_ref(), &self.rules)
            .run(RuleSource::Stored, options)
            .await)
    }

    /// Inline rules run as given; criteria are only enforced when saving
    async fn auto_label_impl(&self, input: AutoLabelEmailsInput) -> AppResult<RunReport> {
        let options = run_options(
            input.dry_run,
            input.max_per_rule,
            input.batch_size,
            input.max_batches,
        )?;
        let source = match input.rules.filter(|rules| !rules.is_empty()) {
            None if input.save_rules => {
                return Err(AppError::invalid("save_rules=true requires inline rules"));
            }
            None => RuleSource::Stored,
            Some(inputs) => {
                for rule in &inputs {
                    validate_rule_input(rule)?;
                }
                let rules: Vec<Rule> = inputs.into_iter().map(Rule::from).collect();
                if input.save_rules {
                    for rule in &rules {
                        validate_rule(rule)?;
                    }
                    let mut stored = self.rules.load().await;
                    stored.extend(rules.iter().cloned());
                    self.rules.save(&stored).await?;
                    tracing::info!(count = rules.len(), "inline rules saved");
                }
                RuleSource::Inline(rules)
            }
        };
        Ok(RuleRunner::new(self.mailbox.as_ref(), &self.rules)
            .run(source, options)
            .await)
    }

    async fn export_rules_impl(&self, input: ExportRulesInput) -> AppResult<serde_json::Value> {
        let path = input.path.as_deref().map(validate_path).transpose()?;
        let (path, count) = self.rules.export(path.as_deref()).await?;
        Ok(serde_json::json!({ "path": path.display().to_string(), "count": count }))
    }

    async fn import_rules_impl(&self, input: ImportRulesInput) -> AppResult<ImportSummary> {
        let path = validate_path(&input.path)?;
        self.rules.import(&path, input.merge).await
    }

    /// Id-list chunk size: explicit values are validated, the configured
    /// default is clamped
    fn chunk_size(&self, batch_size: Option<usize>) -> AppResult<usize> {
        match batch_size {
            Some(size) => {
                validate_range(size, 1, MAX_IDS_PER_CALL, "batch_size")?;
                Ok(size)
            }
            None => Ok(self.config.default_batch_size.clamp(1, MAX_IDS_PER_CALL)),
        }
    }

    /// Query-run page size: explicit values are validated, the configured
    /// default is clamped
    fn page_size(&self, batch_size: Option<usize>) -> AppResult<usize> {
        match batch_size {
            Some(size) => {
                validate_range(size, MIN_PAGE_SIZE, MAX_PAGE_SIZE, "batch_size")?;
                Ok(size)
            }
            None => Ok(clamp_page_size(self.config.default_batch_size)),
        }
    }
}

fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Serialize a typed result, deriving the summary from it first
fn with_summary<T: Serialize>(
    data: T,
    summary: impl FnOnce(&T) -> String,
) -> AppResult<(String, serde_json::Value)> {
    let summary = summary(&data);
    let value = serde_json::to_value(&data)
        .map_err(|e| AppError::Internal(format!("serialization failure: {e}")))?;
    Ok((summary, value))
}

fn batch_summary(verb: &str, result: &BatchOperationResult) -> String {
    format!(
        "{} of {} message(s) {verb}, {} failed",
        result.successful, result.total_processed, result.failed
    )
}

fn run_summary(run: &BatchRun) -> String {
    match run {
        BatchRun::DryRun(preview) => format!(
            "Dry run: about {} message(s) match; {} would run in about {} batch(es)",
            preview.estimated_total, preview.action, preview.estimated_batches
        ),
        BatchRun::Executed { action, result, .. } => format!(
            "{action}: {} of {} message(s) succeeded, {} failed",
            result.successful, result.total_processed, result.failed
        ),
    }
}

fn report_summary(report: &RunReport) -> String {
    let prefix = if report.dry_run { "Dry run: " } else { "" };
    format!(
        "{prefix}{} rule(s) processed, {} message(s) matched, {} labeled, {} error(s)",
        report.rules_processed,
        report.total_matched,
        report.total_labeled,
        report.errors.len()
    )
}

fn summarize(message: &Message) -> MessageSummary {
    let headers = message
        .payload
        .as_ref()
        .map(|p| p.headers.as_slice())
        .unwrap_or_default();
    let header = |name: &str| content::header_value(headers, name).map(str::to_owned);
    MessageSummary {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        date: header("Date"),
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        snippet: message.snippet.clone(),
        label_ids: message.label_ids.clone(),
    }
}

fn run_options(
    dry_run: bool,
    max_per_rule: Option<usize>,
    batch_size: usize,
    max_batches: usize,
) -> AppResult<RunOptions> {
    validate_range(batch_size, 1, MAX_RUN_BATCH_SIZE, "batch_size")?;
    validate_range(max_batches, 1, MAX_RUN_BATCHES, "max_batches")?;
    if max_per_rule == Some(0) {
        return Err(AppError::invalid("max_per_rule must be at least 1"));
    }
    Ok(RunOptions {
        dry_run,
        max_per_rule,
        batch_size,
        max_batches,
    })
}

fn label_changes(
    add: Option<Vec<String>>,
    remove: Option<Vec<String>>,
) -> AppResult<(Vec<String>, Vec<String>)> {
    let add = add.unwrap_or_default();
    let remove = remove.unwrap_or_default();
    if add.is_empty() && remove.is_empty() {
        return Err(AppError::invalid(
            "at least one of add_label_ids/remove_label_ids is required",
        ));
    }
    for id in add.iter().chain(&remove) {
        validate_id(id, "label id")?;
    }
    Ok((add, remove))
}

fn require_confirm(confirm: bool, tool: &str) -> AppResult<()> {
    if !confirm {
        return Err(AppError::InvalidInput(format!(
            "{tool} is permanent; confirm=true is required"
        )));
    }
    Ok(())
}

fn reject_system_label(label_id: &str) -> AppResult<()> {
    if is_system_label(label_id) {
        return Err(AppError::InvalidRequest(format!(
            "system label {label_id} cannot be changed"
        )));
    }
    Ok(())
}

fn validate_rule_input(input: &RuleInput) -> AppResult<()> {
    validate_label_name(&input.label_name)?;
    for (value, field) in [
        (&input.sender_pattern, "sender_pattern"),
        (&input.subject_pattern, "subject_pattern"),
        (&input.query, "query"),
    ] {
        if let Some(value) = value {
            validate_no_controls(value, field)?;
        }
    }
    for phrase in input.subject_contains.iter().flatten() {
        validate_no_controls(phrase, "subject_contains")?;
    }
    Ok(())
}

fn validate_compose(input: ComposeEmailInput) -> AppResult<(OutgoingMessage, Option<String>)> {
    if input.to.is_empty() {
        return Err(AppError::invalid("to must contain at least one address"));
    }
    for (addrs, field) in [(&input.to, "to"), (&input.cc, "cc"), (&input.bcc, "bcc")] {
        addrs
            .iter()
            .try_for_each(|addr| validate_address(addr, field))?;
    }
    if input.subject.chars().count() > MAX_SUBJECT_CHARS {
        return Err(AppError::InvalidInput(format!(
            "subject must be at most {MAX_SUBJECT_CHARS} characters"
        )));
    }
    validate_no_controls(&input.subject, "subject")?;
    if let Some(thread_id) = &input.thread_id {
        validate_id(thread_id, "thread_id")?;
    }
    if let Some(in_reply_to) = &input.in_reply_to {
        validate_id(in_reply_to, "in_reply_to")?;
    }
    Ok(input.into_message())
}

fn validate_address(addr: &str, field: &str) -> AppResult<()> {
    let addr = addr.trim();
    if addr.is_empty() || !addr.contains('@') {
        return Err(AppError::InvalidInput(format!(
            "{field} contains an invalid address '{addr}'"
        )));
    }
    if addr.chars().count() > MAX_ADDRESS_CHARS {
        return Err(AppError::InvalidInput(format!(
            "{field} addresses must be at most {MAX_ADDRESS_CHARS} characters"
        )));
    }
    validate_no_controls(addr, field)
}

fn validate_query(query: &str) -> AppResult<()> {
    if query.trim().is_empty() {
        return Err(AppError::invalid("query must not be empty"));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(AppError::InvalidInput(format!(
            "query must be at most {MAX_QUERY_CHARS} characters"
        )));
    }
    validate_no_controls(query, "query")
}

fn validate_id(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_CHARS {
        return Err(AppError::InvalidInput(format!(
            "{field} must be at most {MAX_ID_CHARS} characters"
        )));
    }
    validate_no_controls(value, field)
}

fn validate_ids(ids: &[String], field: &str) -> AppResult<()> {
    if ids.is_empty() {
        return Err(AppError::InvalidInput(format!("{field} must not be empty")));
    }
    ids.iter().try_for_each(|id| validate_id(id, field))
}

fn validate_label_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::invalid("label name must not be empty"));
    }
    if name.chars().count() > MAX_LABEL_NAME_CHARS {
        return Err(AppError::InvalidInput(format!(
            "label name must be at most {MAX_LABEL_NAME_CHARS} characters"
        )));
    }
    validate_no_controls(name, "label name")
}

fn validate_visibility(value: &str, allowed: &[&str], field: &str) -> AppResult<()> {
    if !allowed.contains(&value) {
        return Err(AppError::InvalidInput(format!(
            "{field} must be one of: {}",
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn validate_path(path: &str) -> AppResult<PathBuf> {
    if path.trim().is_empty() {
        return Err(AppError::invalid("path must not be empty"));
    }
    validate_no_controls(path, "path")?;
    Ok(Path::new(path).to_path_buf())
}

fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn validate_range(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}
