//! Outgoing message construction for send and draft
//!
//! Builds an RFC 5322 message with `mail-builder` and encodes it as unpadded
//! base64url, the form the Gmail `raw` field expects. `From` is left out;
//! Gmail fills in the authenticated sender.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mail_builder::MessageBuilder;
use mail_builder::headers::address::Address;
use mail_builder::headers::message_id::MessageId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("at least one recipient is required")]
    MissingRecipients,
    #[error("failed to build message: {0}")]
    Io(#[from] std::io::Error),
}

/// A plain-text message with an optional HTML alternative
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    /// `Message-ID` of the message being answered; also sets `References`
    pub in_reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Render the message as RFC 5322 text
    pub fn to_rfc822(&self) -> Result<String, ComposeError> {
        if self.recipient_count() == 0 {
            return Err(ComposeError::MissingRecipients);
        }

        let mut builder = MessageBuilder::new();
        if !self.to.is_empty() {
            builder = builder.to(address_list(&self.to));
        }
        if !self.cc.is_empty() {
            builder = builder.cc(address_list(&self.cc));
        }
        if !self.bcc.is_empty() {
            builder = builder.bcc(address_list(&self.bcc));
        }
        builder = builder
            .subject(self.subject.as_str())
            .text_body(self.body_text.as_str());
        if let Some(html) = &self.body_html {
            builder = builder.html_body(html.as_str());
        }
        if let Some(id) = self.in_reply_to.as_deref().and_then(normalize_message_id) {
            builder = builder
                .in_reply_to(MessageId::new(id.clone()))
                .references(MessageId::new(id));
        }

        Ok(builder.write_to_string()?)
    }

    /// Render and encode for the Gmail `raw` field
    pub fn to_base64_url(&self) -> Result<String, ComposeError> {
        let raw = self.to_rfc822()?;
        Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }
}

fn address_list(addrs: &[String]) -> Address<'_> {
    Address::new_list(
        addrs
            .iter()
            .map(|addr| Address::new_address(None::<&str>, addr.as_str()))
            .collect(),
    )
}

/// Strip whitespace and angle brackets; `None` if nothing is left
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_matches('<').trim_matches('>');
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::{ComposeError, OutgoingMessage, normalize_message_id};

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            to: vec!["alice@example.com".to_owned()],
            cc: vec!["carol@example.com".to_owned()],
            bcc: vec!["bob@example.com".to_owned()],
            subject: "Quarterly numbers".to_owned(),
            body_text: "See attached summary.".to_owned(),
            ..OutgoingMessage::default()
        }
    }

    #[test]
    fn renders_recipients_subject_and_body() {
        let raw = message().to_rfc822().expect("render");
        assert!(raw.contains("alice@example.com"));
        assert!(raw.contains("carol@example.com"));
        assert!(raw.contains("bob@example.com"));
        assert!(raw.contains("Subject: Quarterly numbers"));
        assert!(raw.contains("See attached summary."));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(!raw.contains("In-Reply-To"));
    }

    #[test]
    fn html_alternative_and_reply_headers() {
        let mut msg = message();
        msg.body_html = Some("<p>See attached summary.</p>".to_owned());
        msg.in_reply_to = Some(" <orig@mail.example.com> ".to_owned());
        let raw = msg.to_rfc822().expect("render");
        assert!(raw.contains("Content-Type: multipart/alternative"));
        assert!(raw.contains("Content-Type: text/html"));
        assert!(raw.contains("In-Reply-To: <orig@mail.example.com>"));
        assert!(raw.contains("References: <orig@mail.example.com>"));
    }

    #[test]
    fn encodes_as_unpadded_base64url() {
        let msg = message();
        let encoded = msg.to_base64_url().expect("encode");
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        let decoded = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).expect("decode");
        let text = String::from_utf8(decoded).expect("utf8");
        assert!(text.contains("Subject: Quarterly numbers"));
    }

    #[test]
    fn rejects_message_without_recipients() {
        let msg = OutgoingMessage {
            subject: "nobody".to_owned(),
            ..OutgoingMessage::default()
        };
        assert!(matches!(msg.to_rfc822(), Err(ComposeError::MissingRecipients)));
    }

    #[test]
    fn message_ids_are_normalized() {
        assert_eq!(normalize_message_id("<a@b>").as_deref(), Some("a@b"));
        assert_eq!(normalize_message_id("  a@b "), Some("a@b".to_owned()));
        assert_eq!(normalize_message_id("<>"), None);
    }
}
