//! Auto-labeling rule runner
//!
//! Runs rules one at a time: resolve the label, build the query, collect
//! matching ids, apply the label in chunks, and stamp `last_run` on stored
//! rules. A failing rule is recorded and the run moves on to the next one.

use chrono::Utc;
use serde::Serialize;

use crate::batch::{BatchExecutor, BulkAction, MAX_IDS_PER_CALL, MAX_PAGE_SIZE, apply_chunk};
use crate::errors::{AppError, AppResult};
use crate::mailbox::{Mailbox, find_label_by_name, resolve_or_create_label};
use crate::query::effective_query;
use crate::rules::{Rule, RuleStore};

/// Options for one run across all rules
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Cap on matched messages per rule
    pub max_per_rule: Option<usize>,
    /// Page size for the search; capped at 500
    pub batch_size: usize,
    /// Maximum search pages per rule
    pub max_batches: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_per_rule: None,
            batch_size: 100,
            max_batches: 10,
        }
    }
}

/// Where the rules of a run come from
#[derive(Debug, Clone)]
pub enum RuleSource {
    /// Rules in the rule store; `last_run` is persisted
    Stored,
    /// Ad hoc rules; nothing is persisted
    Inline(Vec<Rule>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Labeled,
    DryRun,
    NoEmailsFound,
    NoSearchCriteria,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleRunResult {
    pub index: usize,
    pub label_name: String,
    pub status: RuleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub matched: usize,
    pub labeled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleRunError {
    pub index: usize,
    pub label_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub rules_processed: usize,
    pub total_matched: usize,
    pub total_labeled: usize,
    pub results: Vec<RuleRunResult>,
    pub errors: Vec<RuleRunError>,
}

pub struct RuleRunner<'a> {
    mailbox: &'a dyn Mailbox,
    store: &'a RuleStore,
}

impl<'a> RuleRunner<'a> {
    pub fn new(mailbox: &'a dyn Mailbox, store: &'a RuleStore) -> Self {
        Self { mailbox, store }
    }

    /// Run every rule from `source`
    ///
    /// Never fails as a whole; per-rule failures land in `errors`.
    pub async fn run(&self, source: RuleSource, options: RunOptions) -> RunReport {
        let (rules, persist) = match source {
            RuleSource::Stored => (self.store.load().await, true),
            RuleSource::Inline(rules) => (rules, false),
        };

        let mut report = RunReport {
            dry_run: options.dry_run,
            ..RunReport::default()
        };
        for (index, rule) in rules.iter().enumerate() {
            if !rule.enabled {
                report.results.push(RuleRunResult {
                    index,
                    label_name: rule.label_name.clone(),
                    status: RuleStatus::Skipped,
                    query: None,
                    matched: 0,
                    labeled: 0,
                    failed: 0,
                });
                continue;
            }

            report.rules_processed += 1;
            match self.run_rule(index, rule, options, persist).await {
                Ok((result, error)) => {
                    report.total_matched += result.matched;
                    report.total_labeled += result.labeled;
                    report.results.push(result);
                    if let Some(error) = error {
                        report.errors.push(error);
                    }
                }
                Err(e) => {
                    tracing::warn!(index, label_name = %rule.label_name, error = %e, "rule failed");
                    report.errors.push(RuleRunError {
                        index,
                        label_name: rule.label_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            rules = report.rules_processed,
            matched = report.total_matched,
            labeled = report.total_labeled,
            errors = report.errors.len(),
            dry_run = options.dry_run,
            "rule run finished"
        );
        report
    }

    async fn run_rule(
        &self,
        index: usize,
        rule: &Rule,
        options: RunOptions,
        persist: bool,
    ) -> AppResult<(RuleRunResult, Option<RuleRunError>)> {
        let mut result = RuleRunResult {
            index,
            label_name: rule.label_name.clone(),
            status: RuleStatus::NoSearchCriteria,
            query: None,
            matched: 0,
            labeled: 0,
            failed: 0,
        };

        // A dry run must not create labels, so it only looks the label up.
        let label_id = if options.dry_run {
            let labels = self.mailbox.list_labels().await?;
            find_label_by_name(&labels, &rule.label_name).map(|l| l.id.clone())
        } else {
            Some(resolve_or_create_label(self.mailbox, &rule.label_name).await?.id)
        };

        let query = effective_query(rule);
        if query.is_empty() {
            tracing::warn!(index, label_name = %rule.label_name, "rule has no search criteria");
            return Ok((result, None));
        }
        result.query = Some(query.clone());

        let page_size = options.batch_size.clamp(1, MAX_PAGE_SIZE);
        let ids = BatchExecutor::new(self.mailbox)
            .collect_ids(&query, page_size, options.max_batches, options.max_per_rule)
            .await?;
        result.matched = ids.len();

        if ids.is_empty() {
            result.status = RuleStatus::NoEmailsFound;
            return Ok((result, None));
        }
        if options.dry_run {
            result.status = RuleStatus::DryRun;
            return Ok((result, None));
        }

        let label_id = label_id.ok_or_else(|| {
            AppError::Internal(format!("label '{}' could not be resolved", rule.label_name))
        })?;
        let action = BulkAction::AddLabels(vec![label_id]);
        let mut first_error = None;
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let outcome = apply_chunk(self.mailbox, &action, chunk).await;
            result.labeled += outcome.succeeded;
            result.failed += outcome.failed;
            if first_error.is_none() {
                first_error = outcome.item_errors.into_iter().next().map(|(_, e)| e);
            }
        }
        result.status = RuleStatus::Labeled;
        tracing::info!(index, label_name = %rule.label_name, labeled = result.labeled, failed = result.failed, "rule applied");

        if result.failed > 0 {
            let error = RuleRunError {
                index,
                label_name: rule.label_name.clone(),
                error: format!(
                    "{} of {} message(s) could not be labeled: {}",
                    result.failed,
                    result.matched,
                    first_error.unwrap_or_default()
                ),
            };
            return Ok((result, Some(error)));
        }

        if persist {
            let touched = self
                .store
                .touch_last_run(index, &rule.label_name, rule.created, Utc::now())
                .await?;
            if !touched {
                tracing::warn!(index, label_name = %rule.label_name, "rule vanished before last_run could be saved");
            }
        }
        Ok((result, None))
    }
}
