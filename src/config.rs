//! Configuration module for Gmail access and server settings
//!
//! All configuration is loaded from environment variables prefixed with
//! `GMAIL_MCP_`. File locations default to entries under the config directory
//! (`$HOME/.gmail-mcp`).

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Gmail REST endpoint for the authenticated user
pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const CONFIG_DIR_NAME: &str = ".gmail-mcp";

/// OAuth client credentials supplied through the environment
///
/// Overrides the keys file when both variables are set.
#[derive(Debug, Clone)]
pub struct ClientOverride {
    pub client_id: String,
    /// Client secret stored in a type that prevents accidental logging
    pub client_secret: SecretString,
}

/// Server-wide configuration
///
/// Cloned into MCP tool handlers via `Arc` for shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding keys, credentials, and rules
    pub config_dir: PathBuf,
    /// OAuth client keys file (`installed` or `web` envelope)
    pub oauth_keys_path: PathBuf,
    /// Saved access/refresh tokens
    pub credentials_path: PathBuf,
    /// Auto-labeling rule file
    pub rules_path: PathBuf,
    /// Default target of `export_auto_labeling_rules`
    pub rules_export_path: PathBuf,
    pub client_override: Option<ClientOverride>,
    /// Gmail REST base URL ending in `/users/me`
    pub api_base: String,
    /// Per-request HTTP timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Local port of the OAuth redirect listener
    pub callback_port: u16,
    /// Page size used by bulk tools when the caller gives none
    pub default_batch_size: usize,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed, or if no
    /// config directory can be derived (neither `GMAIL_MCP_CONFIG_DIR` nor
    /// `HOME` is set).
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GMAIL_MCP_CONFIG_DIR=/home/me/.gmail-mcp
    /// GMAIL_MCP_REQUEST_TIMEOUT_MS=30000
    /// GMAIL_MCP_CALLBACK_PORT=3000
    /// GMAIL_MCP_DEFAULT_BATCH_SIZE=50
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::load_with(&|key| env::var(key))
    }

    /// Defaults rooted at `dir`, for tests that need a full config
    #[cfg(test)]
    pub(crate) fn for_dir(dir: &std::path::Path) -> Self {
        let dir = dir.to_string_lossy().into_owned();
        Self::load_with(&|key| match key {
            "GMAIL_MCP_CONFIG_DIR" => Ok(dir.clone()),
            _ => Err(VarError::NotPresent),
        })
        .expect("test config")
    }

    fn load_with(lookup: &Lookup<'_>) -> AppResult<Self> {
        let config_dir = match optional_var(lookup, "GMAIL_MCP_CONFIG_DIR")? {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = optional_var(lookup, "HOME")?.ok_or_else(|| {
                    AppError::InvalidInput(
                        "set GMAIL_MCP_CONFIG_DIR or HOME to locate the config directory"
                            .to_owned(),
                    )
                })?;
                PathBuf::from(home).join(CONFIG_DIR_NAME)
            }
        };
        let path_or = |key: &str, file: &str| -> AppResult<PathBuf> {
            Ok(optional_var(lookup, key)?
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir.join(file)))
        };

        let client_override = match (
            optional_var(lookup, "GMAIL_MCP_CLIENT_ID")?,
            optional_var(lookup, "GMAIL_MCP_CLIENT_SECRET")?,
        ) {
            (Some(client_id), Some(secret)) => Some(ClientOverride {
                client_id,
                client_secret: SecretString::new(secret.into()),
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::InvalidInput(
                    "GMAIL_MCP_CLIENT_ID and GMAIL_MCP_CLIENT_SECRET must be set together"
                        .to_owned(),
                ));
            }
        };

        let default_batch_size = parse_usize_env(lookup, "GMAIL_MCP_DEFAULT_BATCH_SIZE", 50)?;
        if default_batch_size == 0 {
            return Err(AppError::InvalidInput(
                "GMAIL_MCP_DEFAULT_BATCH_SIZE must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            oauth_keys_path: path_or("GMAIL_MCP_OAUTH_PATH", "gcp-oauth.keys.json")?,
            credentials_path: path_or("GMAIL_MCP_CREDENTIALS_PATH", "credentials.json")?,
            rules_path: path_or("GMAIL_MCP_RULES_PATH", "auto-label-rules.json")?,
            rules_export_path: config_dir.join("auto-label-rules-export.json"),
            client_override,
            api_base: optional_var(lookup, "GMAIL_MCP_API_BASE")?
                .map(|base| base.trim_end_matches('/').to_owned())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_owned()),
            request_timeout_ms: parse_u64_env(lookup, "GMAIL_MCP_REQUEST_TIMEOUT_MS", 30_000)?,
            callback_port: parse_u16_env(lookup, "GMAIL_MCP_CALLBACK_PORT", 3000)?,
            default_batch_size,
            config_dir,
        })
    }
}

type Lookup<'a> = dyn Fn(&str) -> Result<String, VarError> + 'a;

/// Read an optional variable; unset and blank both mean absent
fn optional_var(lookup: &Lookup<'_>, key: &str) -> AppResult<Option<String>> {
    match lookup(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u16` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env(lookup: &Lookup<'_>, key: &str, default: u16) -> AppResult<u16> {
    match optional_var(lookup, key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(lookup: &Lookup<'_>, key: &str, default: u64) -> AppResult<u64> {
    match optional_var(lookup, key)? {
        Some(v) => v.parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(lookup: &Lookup<'_>, key: &str, default: usize) -> AppResult<usize> {
    match optional_var(lookup, key)? {
        Some(v) => v.parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
