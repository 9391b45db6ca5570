//! Bulk message actions with partial-failure tolerance
//!
//! Every chunk of ids goes through two tiers: one bulk call covering the
//! whole chunk ([`BulkAction::apply_bulk`]) and, only if that fails, one
//! call per id ([`BulkAction::apply_one`]), at most [`PER_ITEM_CONCURRENCY`]
//! in flight. Outcomes are counted per id, so
//! `successful + failed == total_processed` always holds.

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::mailbox::{Mailbox, MailboxResult, MessageFormat, is_system_label};

/// Hard per-call id limit of `batchModify` / `batchDelete`
pub const MAX_IDS_PER_CALL: usize = 1_000;
/// Page size bounds for query-driven runs
pub const MIN_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 500;
/// Maximum error entries kept in a result
pub const MAX_REPORTED_ERRORS: usize = 10;
/// Per-message calls in flight during a fallback or a replace fetch
pub const PER_ITEM_CONCURRENCY: usize = 8;

/// Action applied to every message of a batch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkAction {
    /// Permanent delete
    Delete,
    /// Move to trash
    Trash,
    AddLabels(Vec<String>),
    RemoveLabels(Vec<String>),
    /// Add and remove label ids in the same call
    ModifyLabels { add: Vec<String>, remove: Vec<String> },
    /// Remove every non-system label, then add these
    ReplaceLabels(Vec<String>),
}

impl BulkAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Trash => "trash",
            Self::AddLabels(_) => "add_labels",
            Self::RemoveLabels(_) => "remove_labels",
            Self::ModifyLabels { .. } => "modify_labels",
            Self::ReplaceLabels(_) => "replace_labels",
        }
    }

    /// First tier: a single call for the whole chunk
    ///
    /// Replace fetches each message's labels first (bounded concurrency); a
    /// failed fetch fails the tier.
    pub async fn apply_bulk(&self, mailbox: &dyn Mailbox, ids: &[String]) -> MailboxResult<()> {
        match self {
            Self::Delete => mailbox.batch_delete(ids).await,
            Self::Trash => {
                mailbox
                    .batch_modify(ids, &["TRASH".to_owned()], &["INBOX".to_owned()])
                    .await
            }
            Self::AddLabels(add) => mailbox.batch_modify(ids, add, &[]).await,
            Self::RemoveLabels(remove) => mailbox.batch_modify(ids, &[], remove).await,
            Self::ModifyLabels { add, remove } => mailbox.batch_modify(ids, add, remove).await,
            Self::ReplaceLabels(add) => {
                let fetched: Vec<_> = stream::iter(
                    ids.iter()
                        .map(|id| mailbox.get_message(id, MessageFormat::Minimal))
                        .collect::<Vec<_>>(),
                )
                .buffered(PER_ITEM_CONCURRENCY)
                .collect()
                .await;
                let mut current = Vec::new();
                for message in fetched {
                    for label in message?.label_ids {
                        if !current.contains(&label) {
                            current.push(label);
                        }
                    }
                }
                let remove = replacement_removals(&current, add);
                mailbox.batch_modify(ids, add, &remove).await
            }
        }
    }

    /// Second tier: the same action for a single message
    pub async fn apply_one(&self, mailbox: &dyn Mailbox, id: &str) -> MailboxResult<()> {
        match self {
            Self::Delete => mailbox.delete_message(id).await,
            Self::Trash => mailbox.trash_message(id).await,
            Self::AddLabels(add) => mailbox.modify_message(id, add, &[]).await,
            Self::RemoveLabels(remove) => mailbox.modify_message(id, &[], remove).await,
            Self::ModifyLabels { add, remove } => mailbox.modify_message(id, add, remove).await,
            Self::ReplaceLabels(add) => {
                let message = mailbox.get_message(id, MessageFormat::Minimal).await?;
                let remove = replacement_removals(&message.label_ids, add);
                mailbox.modify_message(id, add, &remove).await
            }
        }
    }
}

/// Labels a replace removes: everything except system labels and the labels
/// being added
pub fn replacement_removals(current: &[String], add: &[String]) -> Vec<String> {
    current
        .iter()
        .filter(|label| !is_system_label(label) && !add.contains(label))
        .cloned()
        .collect()
}

/// Outcome of one chunk after both tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Error from the bulk tier, if it failed
    pub bulk_error: Option<String>,
    /// `(id, error)` for ids that also failed individually
    pub item_errors: Vec<(String, String)>,
}

/// Apply `action` to one chunk, falling back to per-id calls if the bulk
/// call fails
pub async fn apply_chunk(mailbox: &dyn Mailbox, action: &BulkAction, ids: &[String]) -> ChunkOutcome {
    if ids.is_empty() {
        return ChunkOutcome::default();
    }
    let bulk_error = match action.apply_bulk(mailbox, ids).await {
        Ok(()) => {
            return ChunkOutcome {
                succeeded: ids.len(),
                ..ChunkOutcome::default()
            };
        }
        Err(e) => e.to_string(),
    };
    tracing::warn!(action = action.name(), count = ids.len(), error = %bulk_error, "bulk call failed, retrying per message");

    let results: Vec<_> = stream::iter(
        ids.iter()
            .map(|id| action.apply_one(mailbox, id))
            .collect::<Vec<_>>(),
    )
    .buffered(PER_ITEM_CONCURRENCY)
    .collect()
    .await;
    let mut outcome = ChunkOutcome {
        bulk_error: Some(bulk_error),
        ..ChunkOutcome::default()
    };
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(()) => outcome.succeeded += 1,
            Err(e) => {
                outcome.failed += 1;
                outcome.item_errors.push((id.clone(), e.to_string()));
            }
        }
    }
    outcome
}

/// Per-batch failure entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    /// 1-based batch index
    pub batch: usize,
    pub error: String,
    /// Items of this batch that still failed after the per-message retry
    pub count: usize,
}

/// Aggregate result of a bulk run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOperationResult {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub batches_processed: usize,
    pub errors: Vec<BatchError>,
}

impl BatchOperationResult {
    /// Fold a chunk outcome into the totals
    pub fn record(&mut self, batch: usize, outcome: ChunkOutcome) {
        self.batches_processed += 1;
        self.total_processed += outcome.succeeded + outcome.failed;
        self.successful += outcome.succeeded;
        self.failed += outcome.failed;
        if let Some(bulk_error) = outcome.bulk_error {
            let error = match outcome.item_errors.first() {
                Some((id, e)) => format!(
                    "{bulk_error}; {} message(s) also failed individually (first: {id}: {e})",
                    outcome.item_errors.len()
                ),
                None => format!("{bulk_error}; recovered by per-message retry"),
            };
            self.push_error(BatchError {
                batch,
                error,
                count: outcome.failed,
            });
        }
    }

    fn push_error(&mut self, error: BatchError) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(error);
        }
    }
}

/// What a dry run would do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchPreview {
    pub query: String,
    pub action: String,
    /// Server-side estimate; advisory only
    pub estimated_total: u64,
    pub batch_size: usize,
    pub estimated_batches: u64,
}

/// Result of a query-driven run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchRun {
    DryRun(BatchPreview),
    Executed {
        query: String,
        action: String,
        estimated_total: u64,
        #[serde(flatten)]
        result: BatchOperationResult,
    },
}

/// Options for [`BatchExecutor::run_query`]
#[derive(Debug, Clone, Copy)]
pub struct QueryRunOptions {
    /// Requested page size; clamped to `MIN_PAGE_SIZE..=MAX_PAGE_SIZE`
    pub batch_size: usize,
    pub dry_run: bool,
    /// Stop after this many pages even if more remain
    pub max_batches: Option<usize>,
}

/// Clamp a requested page size to the supported range
pub fn clamp_page_size(batch_size: usize) -> usize {
    batch_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// Runs bulk actions against a mailbox
pub struct BatchExecutor<'a> {
    mailbox: &'a dyn Mailbox,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(mailbox: &'a dyn Mailbox) -> Self {
        Self { mailbox }
    }

    /// Apply `action` to every message matching `query`
    ///
    /// A count-only listing provides the advisory estimate used for dry runs and
    /// reporting; it never bounds the loop. Pages are fetched with the token
    /// of the previous page until a page is empty or no token is returned.
    ///
    /// # Errors
    ///
    /// Only the estimate listing can fail the run. A failed page listing ends
    /// the run early and is reported as a batch error.
    pub async fn run_query(
        &self,
        query: &str,
        action: &BulkAction,
        options: QueryRunOptions,
    ) -> MailboxResult<BatchRun> {
        let page_size = clamp_page_size(options.batch_size);
        let estimate = self.mailbox.list_messages(query, 1, None).await?;
        let estimated_total = estimate.result_size_estimate;

        if options.dry_run {
            return Ok(BatchRun::DryRun(BatchPreview {
                query: query.to_owned(),
                action: action.name().to_owned(),
                estimated_total,
                batch_size: page_size,
                estimated_batches: estimated_total.div_ceil(page_size as u64),
            }));
        }

        tracing::info!(query, action = action.name(), estimated_total, page_size, "starting bulk run");
        let mut result = BatchOperationResult::default();
        let mut page_token: Option<String> = None;
        let mut batch = 0usize;
        loop {
            if options.max_batches.is_some_and(|max| batch >= max) {
                break;
            }
            batch += 1;
            let page = match self
                .mailbox
                .list_messages(query, page_size as u32, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(query, batch, error = %e, "listing page failed, stopping");
                    result.push_error(BatchError {
                        batch,
                        error: format!("listing messages failed: {e}"),
                        count: 0,
                    });
                    break;
                }
            };
            if page.ids.is_empty() {
                break;
            }

            let outcome = apply_chunk(self.mailbox, action, &page.ids).await;
            tracing::debug!(batch, succeeded = outcome.succeeded, failed = outcome.failed, "batch processed");
            result.record(batch, outcome);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::info!(
            query,
            action = action.name(),
            successful = result.successful,
            failed = result.failed,
            batches = result.batches_processed,
            "bulk run finished"
        );
        Ok(BatchRun::Executed {
            query: query.to_owned(),
            action: action.name().to_owned(),
            estimated_total,
            result,
        })
    }

    /// Apply `action` to explicit ids in chunks of `chunk_size`
    /// (clamped to `1..=MAX_IDS_PER_CALL`)
    pub async fn run_ids(
        &self,
        ids: &[String],
        action: &BulkAction,
        chunk_size: usize,
    ) -> BatchOperationResult {
        let chunk_size = chunk_size.clamp(1, MAX_IDS_PER_CALL);
        let mut result = BatchOperationResult::default();
        for (i, chunk) in ids.chunks(chunk_size).enumerate() {
            let outcome = apply_chunk(self.mailbox, action, chunk).await;
            result.record(i + 1, outcome);
        }
        result
    }

    /// Collect matching ids across at most `max_batches` pages
    ///
    /// Stops early once `limit` ids are collected; the result is truncated
    /// to `limit`.
    pub async fn collect_ids(
        &self,
        query: &str,
        page_size: usize,
        max_batches: usize,
        limit: Option<usize>,
    ) -> MailboxResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..max_batches {
            let page = self
                .mailbox
                .list_messages(query, page_size as u32, page_token.as_deref())
                .await?;
            if page.ids.is_empty() {
                break;
            }
            ids.extend(page.ids);
            if limit.is_some_and(|limit| ids.len() >= limit) {
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }
}
