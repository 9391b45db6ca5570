//! OAuth client keys, token persistence, code exchange, and refresh
//!
//! Tokens live in `credentials.json` as `{access_token, refresh_token,
//! expiry_date}` with `expiry_date` in epoch milliseconds.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ClientOverride;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const CALLBACK_PATH: &str = "/oauth2callback";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token; run the auth command again")]
    MissingRefreshToken,
    #[error("oauth client keys unavailable: {0}")]
    MissingClientKeys(String),
    #[error("no saved credentials at {0}; run the auth command first")]
    MissingCredentials(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("credential file error: {0}")]
    Io(String),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

/// OAuth client identity used for code exchange and refresh
#[derive(Debug, Clone)]
pub struct ClientKeys {
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug, Deserialize)]
struct KeysFile {
    installed: Option<KeyEntry>,
    web: Option<KeyEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    client_id: String,
    client_secret: String,
}

impl ClientKeys {
    /// Resolve client keys, preferring the environment override
    ///
    /// Otherwise reads the downloaded keys file, accepting either the
    /// `installed` or the `web` envelope.
    pub async fn load(path: &Path, env_override: Option<&ClientOverride>) -> Result<Self, OAuthError> {
        if let Some(client) = env_override {
            return Ok(Self {
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
            });
        }

        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            OAuthError::MissingClientKeys(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: KeysFile = serde_json::from_str(&raw)?;
        let entry = file.installed.or(file.web).ok_or_else(|| {
            OAuthError::MissingClientKeys(format!(
                "{} has neither an 'installed' nor a 'web' section",
                path.display()
            ))
        })?;
        Ok(Self {
            client_id: entry.client_id,
            client_secret: SecretString::new(entry.client_secret.into()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    /// Empty when the grant carried no refresh token
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

/// On-disk token shape
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

impl From<StoredCredentials> for OAuthTokens {
    fn from(stored: StoredCredentials) -> Self {
        // Unknown expiry forces a refresh on first use.
        let expires_at = stored
            .expiry_date
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token.unwrap_or_default(),
            expires_at,
        }
    }
}

impl From<&OAuthTokens> for StoredCredentials {
    fn from(tokens: &OAuthTokens) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: (!tokens.refresh_token.is_empty())
                .then(|| tokens.refresh_token.clone()),
            expiry_date: Some(tokens.expires_at.timestamp_millis()),
            scope: Some(GMAIL_MODIFY_SCOPE.to_owned()),
            token_type: Some("Bearer".to_owned()),
        }
    }
}

/// Credentials file holding the current token pair
#[derive(Debug, Clone)]
pub struct CredentialsFile {
    path: PathBuf,
}

impl CredentialsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<OAuthTokens, OAuthError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OAuthError::MissingCredentials(self.path.display().to_string()));
            }
            Err(e) => return Err(OAuthError::Io(e.to_string())),
        };
        let stored: StoredCredentials = serde_json::from_str(&raw)?;
        Ok(stored.into())
    }

    /// Replace the file contents via temp file and rename
    pub async fn save(&self, tokens: &OAuthTokens) -> Result<(), OAuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OAuthError::Io(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(&StoredCredentials::from(tokens))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| OAuthError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| OAuthError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Random anti-forgery value for the authorization request
pub fn new_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Consent URL requesting offline access to the modify scope
pub fn authorization_url(client_id: &str, redirect_uri: &str, state: &str) -> String {
    let params = [
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", GMAIL_MODIFY_SCOPE),
        ("access_type", "offline"),
        ("prompt", "consent"),
        ("state", state),
    ];
    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect();
    format!("{AUTH_ENDPOINT}?{}", query.join("&"))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn post_token_form(
    http: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, OAuthError> {
    let response = http.post(endpoint).form(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }
    let body = response.text().await?;
    let payload: TokenResponse = serde_json::from_str(&body)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }
    Ok(payload)
}

/// Trade an authorization code for tokens
pub async fn exchange_code(
    http: &reqwest::Client,
    keys: &ClientKeys,
    code: &str,
    redirect_uri: &str,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    let payload = post_token_form(
        http,
        endpoint,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", keys.client_id.as_str()),
            ("client_secret", keys.client_secret.expose_secret()),
            ("redirect_uri", redirect_uri),
        ],
    )
    .await?;
    let refresh_token = payload.refresh_token.ok_or(OAuthError::MissingRefreshToken)?;
    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

/// Obtain a new access token, keeping the old refresh token unless rotated
pub async fn refresh_access_token(
    http: &reqwest::Client,
    keys: &ClientKeys,
    tokens: &OAuthTokens,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    if tokens.refresh_token.is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }
    let payload = post_token_form(
        http,
        endpoint,
        &[
            ("grant_type", "refresh_token"),
            ("client_id", keys.client_id.as_str()),
            ("client_secret", keys.client_secret.expose_secret()),
            ("refresh_token", tokens.refresh_token.as_str()),
        ],
    )
    .await?;
    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token: payload
            .refresh_token
            .unwrap_or_else(|| tokens.refresh_token.clone()),
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{
        ClientKeys, CredentialsFile, OAuthError, OAuthTokens, authorization_url, exchange_code,
        refresh_access_token,
    };
    use crate::config::ClientOverride;

    fn keys() -> ClientKeys {
        ClientKeys {
            client_id: "client".to_owned(),
            client_secret: SecretString::new("secret".into()),
        }
    }

    fn tokens(refresh: &str) -> OAuthTokens {
        OAuthTokens {
            access_token: "old".to_owned(),
            refresh_token: refresh.to_owned(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn needs_refresh_respects_buffer() {
        let t = OAuthTokens {
            expires_at: Utc::now() + Duration::minutes(4),
            ..tokens("r")
        };
        assert!(t.needs_refresh(Utc::now(), Duration::minutes(5)));
        assert!(!t.needs_refresh(Utc::now(), Duration::minutes(1)));
    }

    #[test]
    fn authorization_url_encodes_parameters() {
        let url = authorization_url("client id", "http://127.0.0.1:3000/oauth2callback", "st");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=client%20id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A3000%2Foauth2callback"));
        assert!(url.contains("scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fgmail.modify"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("state=st"));
    }

    #[tokio::test]
    async fn loads_installed_and_web_key_files() {
        let dir = TempDir::new().expect("tempdir");
        let installed = dir.path().join("installed.json");
        std::fs::write(
            &installed,
            r#"{"installed":{"client_id":"a","client_secret":"b","redirect_uris":["http://localhost"]}}"#,
        )
        .expect("write");
        let web = dir.path().join("web.json");
        std::fs::write(&web, r#"{"web":{"client_id":"c","client_secret":"d"}}"#).expect("write");

        let k = ClientKeys::load(&installed, None).await.expect("installed");
        assert_eq!(k.client_id, "a");
        assert_eq!(k.client_secret.expose_secret(), "b");
        let k = ClientKeys::load(&web, None).await.expect("web");
        assert_eq!(k.client_id, "c");

        let bogus = dir.path().join("bogus.json");
        std::fs::write(&bogus, r#"{"other":{}}"#).expect("write");
        let err = ClientKeys::load(&bogus, None).await.expect_err("no section");
        assert!(matches!(err, OAuthError::MissingClientKeys(_)));
    }

    #[tokio::test]
    async fn env_override_wins_over_missing_file() {
        let over = ClientOverride {
            client_id: "env-id".to_owned(),
            client_secret: SecretString::new("env-secret".into()),
        };
        let k = ClientKeys::load(std::path::Path::new("/nonexistent/keys.json"), Some(&over))
            .await
            .expect("override");
        assert_eq!(k.client_id, "env-id");
    }

    #[tokio::test]
    async fn credentials_round_trip_through_epoch_millis() {
        let dir = TempDir::new().expect("tempdir");
        let file = CredentialsFile::new(dir.path().join("nested").join("credentials.json"));
        assert!(matches!(
            file.load().await,
            Err(OAuthError::MissingCredentials(_))
        ));

        let t = OAuthTokens {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            expires_at: chrono::DateTime::from_timestamp_millis(1_700_000_000_123)
                .expect("timestamp"),
        };
        file.save(&t).await.expect("save");
        let raw = std::fs::read_to_string(file.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["expiry_date"], 1_700_000_000_123_i64);
        assert_eq!(file.load().await.expect("load"), t);
    }

    #[tokio::test]
    async fn credentials_without_expiry_need_refresh() {
        let dir = TempDir::new().expect("tempdir");
        let p = dir.path().join("credentials.json");
        std::fs::write(&p, r#"{"access_token":"at"}"#).expect("write");
        let t = CredentialsFile::new(&p).load().await.expect("load");
        assert!(t.refresh_token.is_empty());
        assert!(t.needs_refresh(Utc::now(), Duration::zero()));
    }

    #[tokio::test]
    async fn exchange_code_posts_form_and_requires_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let t = exchange_code(
            &reqwest::Client::new(),
            &keys(),
            "abc",
            "http://127.0.0.1:3000/oauth2callback",
            &format!("{}/token", server.uri()),
        )
        .await
        .expect("exchange");
        assert_eq!(t.access_token, "at");
        assert_eq!(t.refresh_token, "rt");
        assert!(t.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "expires_in": 1200,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refreshed = refresh_access_token(
            &reqwest::Client::new(),
            &keys(),
            &tokens("keep_me"),
            &format!("{}/token", server.uri()),
        )
        .await
        .expect("refresh");
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token, "keep_me");
    }

    #[tokio::test]
    async fn refresh_surfaces_endpoint_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;

        let err = refresh_access_token(
            &reqwest::Client::new(),
            &keys(),
            &tokens("r"),
            &format!("{}/token", server.uri()),
        )
        .await
        .expect_err("bad status");
        match err {
            OAuthError::TokenEndpoint { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_requires_refresh_token() {
        let err = refresh_access_token(
            &reqwest::Client::new(),
            &keys(),
            &tokens(""),
            "http://localhost/token",
        )
        .await
        .expect_err("missing refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
    }
}
