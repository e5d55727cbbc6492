//! Single-part RFC 5322 message assembly for SMTP delivery.

use std::fmt::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::request::Envelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// `<ulid@helo-name>`, reported as the provider message id.
    pub message_id: String,
    /// Headers and body. Line endings are normalised when the message is sent.
    pub content: String,
}

/// Builds the message for `envelope`. When both bodies are present the HTML
/// body is sent.
#[must_use]
pub fn assemble(envelope: &Envelope, helo_name: &str) -> AssembledMessage {
    assemble_at(envelope, helo_name, Utc::now(), Ulid::new())
}

fn assemble_at(
    envelope: &Envelope,
    helo_name: &str,
    date: DateTime<Utc>,
    id: Ulid,
) -> AssembledMessage {
    let message_id = format!("<{id}@{helo_name}>");
    let (content_type, body) = match (&envelope.html, &envelope.text) {
        (Some(html), _) if !html.is_empty() => ("text/html", html.as_str()),
        (_, Some(text)) => ("text/plain", text.as_str()),
        _ => ("text/plain", ""),
    };

    let mut content = String::with_capacity(body.len() + 512);
    // Writing to a String cannot fail.
    if let Some(from) = envelope.from_header.as_deref().or(envelope.sender.as_deref()) {
        let _ = write!(content, "From: {}\r\n", header_value(from));
    }
    let _ = write!(content, "To: {}\r\n", header_value(&envelope.to_header));
    let _ = write!(content, "Subject: {}\r\n", encode_subject(&envelope.subject));
    let _ = write!(content, "Date: {}\r\n", date.to_rfc2822());
    let _ = write!(content, "Message-ID: {message_id}\r\n");
    let _ = write!(content, "MIME-Version: 1.0\r\n");
    let _ = write!(content, "Content-Type: {content_type}; charset=utf-8\r\n");
    let _ = write!(content, "Content-Transfer-Encoding: 8bit\r\n");
    content.push_str("\r\n");
    content.push_str(body);

    AssembledMessage {
        message_id,
        content,
    }
}

/// Header values never carry line breaks.
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Non-ASCII subjects become an RFC 2047 encoded word.
fn encode_subject(subject: &str) -> String {
    let subject = header_value(subject);
    if subject.is_ascii() {
        subject
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}
