//! In-memory [`Mailbox`] used by unit tests
//!
//! Queries are registered up front with [`FakeMailbox::with_query`]; a search
//! returns the registered ids paged by offset tokens. Result sets are
//! snapshots: deleting or trashing a message does not shift later pages.
//! Failures can be injected per call kind or per message id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::mailbox::{
    Draft, Label, LabelPatch, LabelVisibility, Mailbox, MailboxError, MailboxResult, Message,
    MessageFormat, MessagePage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchModifyCall {
    pub ids: Vec<String>,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Default)]
struct State {
    messages: BTreeMap<String, Vec<String>>,
    queries: HashMap<String, Vec<String>>,
    labels: Vec<Label>,
    next_label: usize,
    created_labels: Vec<String>,
    batch_modify_calls: Vec<BatchModifyCall>,
    modify_calls: Vec<BatchModifyCall>,
    batch_delete_calls: Vec<Vec<String>>,
    deleted: Vec<String>,
    trashed: Vec<String>,
    list_calls: Vec<(String, u32, Option<String>)>,
    list_labels_calls: usize,
    sent: Vec<(String, Option<String>)>,
    drafts: Vec<(String, Option<String>)>,
    modify_in_flight: usize,
    max_modify_in_flight: usize,
    trailing_page_tokens: bool,
    fail_batch_modify: bool,
    fail_batch_delete: bool,
    fail_list_labels: bool,
    failing_queries: BTreeSet<String>,
    failing_ids: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeMailbox {
    state: Mutex<State>,
}

fn lock(mailbox: &FakeMailbox) -> std::sync::MutexGuard<'_, State> {
    mailbox.state.lock().expect("fake mailbox lock poisoned")
}

fn user_label(id: &str, name: &str) -> Label {
    Label {
        id: id.to_owned(),
        name: name.to_owned(),
        label_type: Some("user".to_owned()),
        message_list_visibility: None,
        label_list_visibility: None,
        messages_total: None,
        messages_unread: None,
    }
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with the given label ids
    pub fn with_message(self, id: &str, labels: &[&str]) -> Self {
        lock(&self).messages.insert(
            id.to_owned(),
            labels.iter().map(|l| (*l).to_owned()).collect(),
        );
        self
    }

    /// Register a search query matching `count` generated messages `<prefix>-<n>`
    pub fn with_generated(self, query: &str, prefix: &str, count: usize) -> Self {
        let ids: Vec<String> = (0..count).map(|n| format!("{prefix}-{n}")).collect();
        {
            let mut state = lock(&self);
            for id in &ids {
                state
                    .messages
                    .entry(id.clone())
                    .or_insert_with(|| vec!["INBOX".to_owned()]);
            }
            state.queries.insert(query.to_owned(), ids);
        }
        self
    }

    /// Register a search query matching existing message ids
    pub fn with_query(self, query: &str, ids: &[&str]) -> Self {
        lock(&self).queries.insert(
            query.to_owned(),
            ids.iter().map(|id| (*id).to_owned()).collect(),
        );
        self
    }

    /// Add a user label whose id equals its name
    pub fn with_label(self, name: &str) -> Self {
        lock(&self).labels.push(user_label(name, name));
        self
    }

    /// Keep returning a page token after the last match, so the final page
    /// is empty but still carries a token
    pub fn with_trailing_page_tokens(self) -> Self {
        lock(&self).trailing_page_tokens = true;
        self
    }

    pub fn fail_batch_modify(self) -> Self {
        lock(&self).fail_batch_modify = true;
        self
    }

    pub fn fail_batch_delete(self) -> Self {
        lock(&self).fail_batch_delete = true;
        self
    }

    pub fn fail_list_labels(self) -> Self {
        lock(&self).fail_list_labels = true;
        self
    }

    pub fn fail_query(self, query: &str) -> Self {
        lock(&self).failing_queries.insert(query.to_owned());
        self
    }

    /// Make every per-message call for `id` fail
    pub fn fail_id(self, id: &str) -> Self {
        lock(&self).failing_ids.insert(id.to_owned());
        self
    }

    pub fn labels_of(&self, id: &str) -> Vec<String> {
        lock(self).messages.get(id).cloned().unwrap_or_default()
    }

    pub fn created_labels(&self) -> Vec<String> {
        lock(self).created_labels.clone()
    }

    pub fn batch_modify_calls(&self) -> Vec<BatchModifyCall> {
        lock(self).batch_modify_calls.clone()
    }

    pub fn modify_calls(&self) -> Vec<BatchModifyCall> {
        lock(self).modify_calls.clone()
    }

    pub fn batch_delete_calls(&self) -> Vec<Vec<String>> {
        lock(self).batch_delete_calls.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(self).deleted.clone()
    }

    pub fn trashed(&self) -> Vec<String> {
        lock(self).trashed.clone()
    }

    pub fn list_calls(&self) -> Vec<(String, u32, Option<String>)> {
        lock(self).list_calls.clone()
    }

    pub fn list_labels_calls(&self) -> usize {
        lock(self).list_labels_calls
    }

    /// Highest number of `modify_message` calls observed in flight at once
    pub fn max_modify_in_flight(&self) -> usize {
        lock(self).max_modify_in_flight
    }

    /// `(raw, thread_id)` of every sent message
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        lock(self).sent.clone()
    }

    /// `(raw, thread_id)` of every created draft
    pub fn drafts(&self) -> Vec<(String, Option<String>)> {
        lock(self).drafts.clone()
    }

    /// Total number of calls that could mutate mailbox state
    pub fn mutation_count(&self) -> usize {
        let state = lock(self);
        state.batch_modify_calls.len()
            + state.modify_calls.len()
            + state.batch_delete_calls.len()
            + state.deleted.len()
            + state.trashed.len()
            + state.created_labels.len()
            + state.sent.len()
            + state.drafts.len()
    }
}

fn failure(id: &str) -> MailboxError {
    MailboxError::Api {
        status: 500,
        message: format!("injected failure for {id}"),
    }
}

fn apply_labels(labels: &mut Vec<String>, add: &[String], remove: &[String]) {
    labels.retain(|l| !remove.contains(l));
    for label in add {
        if !labels.contains(label) {
            labels.push(label.clone());
        }
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> MailboxResult<MessagePage> {
        let mut state = lock(self);
        state.list_calls.push((
            query.to_owned(),
            page_size,
            page_token.map(str::to_owned),
        ));
        if state.failing_queries.contains(query) {
            return Err(MailboxError::Api {
                status: 400,
                message: format!("invalid query {query}"),
            });
        }
        let matching = state.queries.get(query).cloned().unwrap_or_default();
        let offset = page_token
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + page_size as usize).min(matching.len());
        let ids = matching.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();
        let next_page_token =
            (end < matching.len() || state.trailing_page_tokens).then(|| end.to_string());
        Ok(MessagePage {
            ids,
            next_page_token,
            result_size_estimate: matching.len() as u64,
        })
    }

    async fn get_message(&self, id: &str, _format: MessageFormat) -> MailboxResult<Message> {
        let state = lock(self);
        if state.failing_ids.contains(id) {
            return Err(failure(id));
        }
        let labels = state.messages.get(id).ok_or_else(|| MailboxError::Api {
            status: 404,
            message: format!("message {id} not found"),
        })?;
        Ok(Message {
            id: id.to_owned(),
            label_ids: labels.clone(),
            ..Message::default()
        })
    }

    async fn modify_message(
        &self,
        id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()> {
        {
            let mut state = lock(self);
            state.modify_in_flight += 1;
            state.max_modify_in_flight = state.max_modify_in_flight.max(state.modify_in_flight);
        }
        tokio::task::yield_now().await;
        let mut state = lock(self);
        state.modify_in_flight -= 1;
        if state.failing_ids.contains(id) {
            return Err(failure(id));
        }
        state.modify_calls.push(BatchModifyCall {
            ids: vec![id.to_owned()],
            add: add_label_ids.to_vec(),
            remove: remove_label_ids.to_vec(),
        });
        if let Some(labels) = state.messages.get_mut(id) {
            apply_labels(labels, add_label_ids, remove_label_ids);
        }
        Ok(())
    }

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()> {
        let mut state = lock(self);
        if state.fail_batch_modify {
            return Err(MailboxError::Api {
                status: 500,
                message: "batchModify unavailable".to_owned(),
            });
        }
        state.batch_modify_calls.push(BatchModifyCall {
            ids: ids.to_vec(),
            add: add_label_ids.to_vec(),
            remove: remove_label_ids.to_vec(),
        });
        for id in ids {
            if let Some(labels) = state.messages.get_mut(id) {
                apply_labels(labels, add_label_ids, remove_label_ids);
            }
        }
        Ok(())
    }

    async fn batch_delete(&self, ids: &[String]) -> MailboxResult<()> {
        let mut state = lock(self);
        if state.fail_batch_delete {
            return Err(MailboxError::Api {
                status: 500,
                message: "batchDelete unavailable".to_owned(),
            });
        }
        state.batch_delete_calls.push(ids.to_vec());
        Ok(())
    }

    async fn trash_message(&self, id: &str) -> MailboxResult<()> {
        let mut state = lock(self);
        if state.failing_ids.contains(id) {
            return Err(failure(id));
        }
        state.trashed.push(id.to_owned());
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> MailboxResult<()> {
        let mut state = lock(self);
        if state.failing_ids.contains(id) {
            return Err(failure(id));
        }
        state.deleted.push(id.to_owned());
        Ok(())
    }

    async fn list_labels(&self) -> MailboxResult<Vec<Label>> {
        let mut state = lock(self);
        state.list_labels_calls += 1;
        if state.fail_list_labels {
            return Err(MailboxError::Http("connection reset".to_owned()));
        }
        Ok(state.labels.clone())
    }

    async fn create_label(
        &self,
        name: &str,
        visibility: &LabelVisibility,
    ) -> MailboxResult<Label> {
        let mut state = lock(self);
        state.next_label += 1;
        let mut label = user_label(&format!("Label_{}", state.next_label), name);
        label.message_list_visibility = Some(visibility.message_list_visibility.clone());
        label.label_list_visibility = Some(visibility.label_list_visibility.clone());
        state.labels.push(label.clone());
        state.created_labels.push(name.to_owned());
        Ok(label)
    }

    async fn update_label(&self, id: &str, patch: &LabelPatch) -> MailboxResult<Label> {
        let mut state = lock(self);
        let label = state
            .labels
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| MailboxError::Api {
                status: 404,
                message: format!("label {id} not found"),
            })?;
        if let Some(name) = &patch.name {
            label.name = name.clone();
        }
        if let Some(v) = &patch.message_list_visibility {
            label.message_list_visibility = Some(v.clone());
        }
        if let Some(v) = &patch.label_list_visibility {
            label.label_list_visibility = Some(v.clone());
        }
        Ok(label.clone())
    }

    async fn delete_label(&self, id: &str) -> MailboxResult<()> {
        let mut state = lock(self);
        let before = state.labels.len();
        state.labels.retain(|l| l.id != id);
        if state.labels.len() == before {
            return Err(MailboxError::Api {
                status: 404,
                message: format!("label {id} not found"),
            });
        }
        Ok(())
    }

    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Message> {
        let mut state = lock(self);
        state.sent.push((raw.to_owned(), thread_id.map(str::to_owned)));
        let id = format!("sent-{}", state.sent.len());
        Ok(Message {
            thread_id: Some(thread_id.map_or_else(|| id.clone(), str::to_owned)),
            id,
            label_ids: vec!["SENT".to_owned()],
            ..Message::default()
        })
    }

    async fn create_draft(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Draft> {
        let mut state = lock(self);
        state.drafts.push((raw.to_owned(), thread_id.map(str::to_owned)));
        let n = state.drafts.len();
        Ok(Draft {
            id: format!("r-{n}"),
            message: Some(Message {
                id: format!("draft-{n}"),
                thread_id: thread_id.map(str::to_owned),
                label_ids: vec!["DRAFT".to_owned()],
                ..Message::default()
            }),
        })
    }
}
