//! Gmail REST implementation of [`Mailbox`]
//!
//! Requests carry a bearer token that is refreshed when it expires within
//! five minutes or when the server answers 401. Refreshed tokens are written
//! back to the credentials file.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::mailbox::{
    Draft, Label, LabelPatch, LabelVisibility, Mailbox, MailboxError, MailboxResult, Message,
    MessageFormat, MessagePage,
};
use crate::oauth::{
    ClientKeys, CredentialsFile, DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, TOKEN_ENDPOINT,
    refresh_access_token,
};

pub struct GmailClient {
    http: Client,
    api_base: String,
    token_endpoint: String,
    keys: ClientKeys,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    credentials: CredentialsFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
    #[serde(default)]
    result_size_estimate: u64,
}

#[derive(Debug, Deserialize)]
struct ListLabelsResponse {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// HTTP client with the configured per-request timeout
pub fn build_http(timeout_ms: u64) -> MailboxResult<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| MailboxError::Http(e.to_string()))
}

fn map_reqwest(err: reqwest::Error) -> MailboxError {
    if err.is_timeout() {
        MailboxError::Timeout(err.to_string())
    } else {
        MailboxError::Http(err.to_string())
    }
}

fn map_oauth(err: OAuthError) -> MailboxError {
    match err {
        OAuthError::Http(e) if e.is_timeout() => MailboxError::Timeout(e.to_string()),
        other => MailboxError::Auth(other.to_string()),
    }
}

/// Turn a non-success response into `Api { status, message }`
///
/// Uses the Google error envelope message when present, else the raw body.
async fn api_error(response: Response) -> MailboxError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    MailboxError::Api { status, message }
}

fn segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// `{ raw, threadId? }` message resource for send and draft
fn raw_message(raw: &str, thread_id: Option<&str>) -> serde_json::Value {
    let mut message = json!({ "raw": raw });
    if let Some(thread_id) = thread_id {
        message["threadId"] = json!(thread_id);
    }
    message
}

impl GmailClient {
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        keys: ClientKeys,
        tokens: OAuthTokens,
        credentials: CredentialsFile,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            token_endpoint: TOKEN_ENDPOINT.to_owned(),
            keys,
            tokens: RwLock::new(tokens),
            refresh_lock: Mutex::new(()),
            credentials,
        }
    }

    #[cfg(test)]
    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    /// Build a client from the configured keys and saved credentials
    pub async fn from_config(config: &ServerConfig) -> MailboxResult<Self> {
        let keys = ClientKeys::load(&config.oauth_keys_path, config.client_override.as_ref())
            .await
            .map_err(map_oauth)?;
        let credentials = CredentialsFile::new(&config.credentials_path);
        let tokens = credentials.load().await.map_err(map_oauth)?;
        let http = build_http(config.request_timeout_ms)?;
        Ok(Self::new(http, &config.api_base, keys, tokens, credentials))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn send_json<T, B>(&self, build: B) -> MailboxResult<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await.map_err(map_reqwest)?;
        serde_json::from_str(&body).map_err(|e| MailboxError::Decode(e.to_string()))
    }

    async fn send_empty<B>(&self, build: B) -> MailboxResult<()>
    where
        B: Fn() -> RequestBuilder + Send + Sync,
    {
        self.perform_authenticated(build).await.map(|_| ())
    }

    async fn perform_authenticated<B>(&self, build: B) -> MailboxResult<Response>
    where
        B: Fn() -> RequestBuilder + Send + Sync,
    {
        let tokens = self.ensure_fresh_token(false).await?;
        let mut response = build()
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(map_reqwest)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("access token rejected, refreshing");
            let tokens = self.ensure_fresh_token(true).await?;
            response = build()
                .bearer_auth(&tokens.access_token)
                .send()
                .await
                .map_err(map_reqwest)?;
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(MailboxError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    async fn ensure_fresh_token(&self, force_refresh: bool) -> MailboxResult<OAuthTokens> {
        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        let current = { self.tokens.read().await.clone() };
        if !force_refresh && !current.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
            return Ok(current);
        }

        let refreshed =
            refresh_access_token(&self.http, &self.keys, &current, &self.token_endpoint)
                .await
                .map_err(map_oauth)?;
        {
            let mut tokens = self.tokens.write().await;
            *tokens = refreshed.clone();
        }
        self.credentials.save(&refreshed).await.map_err(map_oauth)?;
        tracing::info!(expires_at = %refreshed.expires_at, "access token refreshed");
        Ok(refreshed)
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> MailboxResult<MessagePage> {
        let url = self.url("messages");
        let response: ListMessagesResponse = self
            .send_json(|| {
                let mut builder = self.http.get(&url).query(&[("maxResults", page_size)]);
                if !query.is_empty() {
                    builder = builder.query(&[("q", query)]);
                }
                if let Some(token) = page_token {
                    builder = builder.query(&[("pageToken", token)]);
                }
                builder
            })
            .await?;
        Ok(MessagePage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
            result_size_estimate: response.result_size_estimate,
        })
    }

    async fn get_message(&self, id: &str, format: MessageFormat) -> MailboxResult<Message> {
        let url = self.url(&format!("messages/{}", segment(id)));
        self.send_json(|| self.http.get(&url).query(&[("format", format.as_str())]))
            .await
    }

    async fn modify_message(
        &self,
        id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()> {
        let url = self.url(&format!("messages/{}/modify", segment(id)));
        let body = json!({ "addLabelIds": add_label_ids, "removeLabelIds": remove_label_ids });
        self.send_empty(|| self.http.post(&url).json(&body)).await
    }

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> MailboxResult<()> {
        let url = self.url("messages/batchModify");
        let body = json!({
            "ids": ids,
            "addLabelIds": add_label_ids,
            "removeLabelIds": remove_label_ids,
        });
        self.send_empty(|| self.http.post(&url).json(&body)).await
    }

    async fn batch_delete(&self, ids: &[String]) -> MailboxResult<()> {
        let url = self.url("messages/batchDelete");
        let body = json!({ "ids": ids });
        self.send_empty(|| self.http.post(&url).json(&body)).await
    }

    async fn trash_message(&self, id: &str) -> MailboxResult<()> {
        let url = self.url(&format!("messages/{}/trash", segment(id)));
        self.send_empty(|| self.http.post(&url)).await
    }

    async fn delete_message(&self, id: &str) -> MailboxResult<()> {
        let url = self.url(&format!("messages/{}", segment(id)));
        self.send_empty(|| self.http.delete(&url)).await
    }

    async fn list_labels(&self) -> MailboxResult<Vec<Label>> {
        let url = self.url("labels");
        let response: ListLabelsResponse = self.send_json(|| self.http.get(&url)).await?;
        Ok(response.labels)
    }

    async fn create_label(
        &self,
        name: &str,
        visibility: &LabelVisibility,
    ) -> MailboxResult<Label> {
        let url = self.url("labels");
        let body = json!({
            "name": name,
            "messageListVisibility": visibility.message_list_visibility,
            "labelListVisibility": visibility.label_list_visibility,
        });
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    async fn update_label(&self, id: &str, patch: &LabelPatch) -> MailboxResult<Label> {
        let url = self.url(&format!("labels/{}", segment(id)));
        self.send_json(|| self.http.patch(&url).json(patch)).await
    }

    async fn delete_label(&self, id: &str) -> MailboxResult<()> {
        let url = self.url(&format!("labels/{}", segment(id)));
        self.send_empty(|| self.http.delete(&url)).await
    }

    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Message> {
        let url = self.url("messages/send");
        let body = raw_message(raw, thread_id);
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    async fn create_draft(&self, raw: &str, thread_id: Option<&str>) -> MailboxResult<Draft> {
        let url = self.url("drafts");
        let body = json!({ "message": raw_message(raw, thread_id) });
        self.send_json(|| self.http.post(&url).json(&body)).await
    }
}
