//! Message content extraction from Gmail payloads
//!
//! Walks the `payload` part tree returned by `format=full`, decodes
//! base64url bodies, and collects attachment metadata. HTML is sanitized
//! with `ammonia`.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::errors::{AppError, AppResult};
use crate::mailbox::{Header, Message, MessagePart};
use crate::models::AttachmentInfo;

/// Parsed message representation
///
/// Bodies are truncated to the caller's limit.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// All top-level headers in wire order
    pub headers_all: Vec<(String, String)>,
    pub body_text: Option<String>,
    pub body_html_sanitized: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Extract headers, bodies, and attachments from a fetched message
///
/// # Errors
///
/// - `Internal` if a body is not valid base64url
pub fn parse_message(
    message: &Message,
    body_max_chars: usize,
    include_html: bool,
) -> AppResult<ParsedMessage> {
    let Some(payload) = &message.payload else {
        return Ok(ParsedMessage::default());
    };

    let headers = to_tuples(&payload.headers);
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(payload, &mut body_text, &mut body_html, &mut attachments)?;

    let header_map = to_header_map(&headers);
    Ok(ParsedMessage {
        date: header_map.get("date").cloned(),
        from: header_map.get("from").cloned(),
        to: header_map.get("to").cloned(),
        cc: header_map.get("cc").cloned(),
        subject: header_map.get("subject").cloned(),
        headers_all: headers,
        body_text: body_text.map(|t| truncate_chars(t, body_max_chars)),
        body_html_sanitized: if include_html {
            body_html.map(|h| truncate_chars(h, body_max_chars))
        } else {
            None
        },
        attachments,
    })
}

/// First text/plain and text/html leaves win; named leaves are attachments
fn walk_parts(
    part: &MessagePart,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) -> AppResult<()> {
    if !part.parts.is_empty() {
        for sub in &part.parts {
            walk_parts(sub, body_text, body_html, attachments)?;
        }
        return Ok(());
    }

    let ctype = part
        .mime_type
        .as_deref()
        .unwrap_or("text/plain")
        .to_ascii_lowercase();
    let filename = part.filename.clone().filter(|f| !f.is_empty());
    let body = part.body.as_ref();

    if filename.is_some() || body.is_some_and(|b| b.attachment_id.is_some()) {
        attachments.push(AttachmentInfo {
            filename,
            content_type: ctype,
            size_bytes: body.map_or(0, |b| usize::try_from(b.size).unwrap_or(0)),
            part_id: part.part_id.clone().unwrap_or_default(),
            attachment_id: body.and_then(|b| b.attachment_id.clone()),
        });
        return Ok(());
    }

    let Some(data) = body.and_then(|b| b.data.as_deref()) else {
        return Ok(());
    };
    if ctype == "text/plain" && body_text.is_none() {
        *body_text = Some(decode_text(data)?);
    } else if ctype == "text/html" && body_html.is_none() {
        *body_html = Some(ammonia::clean(&decode_text(data)?));
    }
    Ok(())
}

/// Decode a base64url body (padding optional) into UTF-8, lossily
pub fn decode_text(data: &str) -> AppResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| AppError::Internal(format!("failed decoding message body: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Return headers, either curated or all
///
/// If `include_all=true`, returns all headers. Otherwise, returns only
/// a safe subset (Date, From, To, Cc, Subject, Message-ID).
pub fn curated_headers(headers: &[(String, String)], include_all: bool) -> Vec<(String, String)> {
    if include_all {
        return headers.to_vec();
    }

    let allowed = ["date", "from", "to", "cc", "subject", "message-id"];
    headers
        .iter()
        .filter(|(k, _)| allowed.contains(&k.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

/// Case-insensitive lookup of the first header with `name`
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn to_tuples(headers: &[Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect()
}

/// First value for each header key, keyed lowercase
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        map.entry(k.to_ascii_lowercase()).or_insert_with(|| v.clone());
    }
    map
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    input.chars().take(max_chars).collect()
}
