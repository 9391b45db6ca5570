//! gmail-mcp-rs: Gmail MCP server with rule-based auto-labeling over stdio
//!
//! This server exposes Gmail search, reading, sending, labeling, and bulk
//! operations via the Model Context Protocol (MCP) over stdio, plus a
//! persistent set of auto-labeling rules that can be run on demand.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI, and stdio serving
//! - [`config`]: Environment-driven configuration (paths, timeouts, defaults)
//! - [`errors`]: Application error model with MCP error mapping
//! - [`mailbox`]: Remote mailbox trait and Gmail resource types
//! - [`gmail`]: Gmail REST client with token refresh
//! - [`oauth`]: Client keys, credential persistence, code exchange
//! - [`callback`]: Local OAuth redirect listener
//! - [`server`]: MCP tool handlers with validation and orchestration
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`content`]: Message body/header extraction and sanitization
//! - [`compose`]: Outgoing message construction for send and draft
//! - [`rules`]: Persistent rule store
//! - [`query`]: Search query synthesis from rule criteria
//! - [`batch`]: Bulk actions with per-message fallback
//! - [`runner`]: Auto-labeling rule runner

mod batch;
mod callback;
mod compose;
mod config;
mod content;
mod errors;
mod gmail;
mod mailbox;
mod models;
mod oauth;
mod query;
mod rules;
mod runner;
mod server;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing_subscriber::EnvFilter;

use crate::callback::CallbackListener;
use crate::gmail::GmailClient;
use crate::oauth::{ClientKeys, CredentialsFile, TOKEN_ENDPOINT};

/// How long `auth` waits for the browser redirect
const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "gmail-mcp-rs", version, about = "Gmail MCP server with auto-labeling rules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,
    /// Run the browser OAuth flow and save credentials
    Auth,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and either serves
/// the MCP server over stdio or runs the OAuth flow. Logs go to stderr;
/// stdout carries the MCP protocol.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// GMAIL_MCP_CONFIG_DIR=$HOME/.gmail-mcp cargo run -- auth
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;
    tracing::debug!(config_dir = %config.config_dir.display(), "configuration loaded");
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Auth => authenticate(&config).await,
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = GmailClient::from_config(&config).await?;
    let service = server::GmailMcpServer::new(config, Arc::new(client))
        .serve(stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}

/// Authorize in the browser, then persist tokens to the credentials file
async fn authenticate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let keys = ClientKeys::load(&config.oauth_keys_path, config.client_override.as_ref()).await?;
    let state = oauth::new_state();
    let mut listener = CallbackListener::start(config.callback_port, state.clone()).await?;
    let redirect_uri = listener.redirect_uri();

    eprintln!(
        "Open this URL in your browser to authorize access:\n\n{}\n",
        oauth::authorization_url(&keys.client_id, &redirect_uri, &state)
    );
    let code = listener.wait_for_code(AUTH_TIMEOUT).await;
    listener.stop().await;
    let code = code?;

    let http = gmail::build_http(config.request_timeout_ms)?;
    let tokens = oauth::exchange_code(&http, &keys, &code, &redirect_uri, TOKEN_ENDPOINT).await?;
    let credentials = CredentialsFile::new(&config.credentials_path);
    credentials.save(&tokens).await?;
    tracing::info!(path = %credentials.path().display(), "credentials saved");
    eprintln!(
        "Authentication complete; credentials saved to {}",
        credentials.path().display()
    );
    Ok(())
}
