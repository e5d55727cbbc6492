//! Strict mailbox syntax checks for envelope addresses.
//!
//! Envelope addresses are bare mailboxes (`local-part@domain`) as used in the
//! `MAIL FROM` / `RCPT TO` exchange. The grammar follows RFC 5321 Section 4.1.2:
//!
//! ```text
//! Mailbox        = Local-part "@" Domain
//! Local-part     = Dot-string / Quoted-string
//! Dot-string     = Atom *("." Atom)
//! Atom           = 1*atext
//! Quoted-string  = DQUOTE *QcontentSMTP DQUOTE
//! Domain         = sub-domain 1*("." sub-domain)
//! sub-domain     = Let-dig [Ldh-str]
//! ```
//!
//! Deliverable addresses additionally need a fully qualified domain: at least
//! two labels and an alphabetic top-level label of two or more characters (or
//! an IDNA `xn--` label). Address literals (`user@[192.0.2.1]`) are rejected.
//!
//! # Size Constraints
//!
//! - Maximum mailbox length: 254 octets
//! - Maximum local-part: 64 octets
//! - Maximum domain: 253 octets
//! - Maximum domain label: 63 octets

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AddressError>;

const MAX_MAILBOX_LEN: usize = 254;
const MAX_LOCAL_PART_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Errors that can occur while checking a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Address exceeds {MAX_MAILBOX_LEN} octets")]
    TooLong,

    #[error("Local-part exceeds {MAX_LOCAL_PART_LEN} octets")]
    LocalPartTooLong,

    #[error("Domain exceeds {MAX_DOMAIN_LEN} octets")]
    DomainTooLong,

    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,

    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,

    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

/// A syntactically valid mailbox (`local_part@domain`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: String,
}

impl Mailbox {
    /// Returns the mailbox with both halves lowercased, which is the form
    /// used on the envelope.
    #[must_use]
    pub fn to_lowercase(&self) -> Self {
        Self {
            local_part: self.local_part.to_lowercase(),
            domain: self.domain.to_lowercase(),
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl std::str::FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        parse_mailbox(s)
    }
}

/// Parse a bare mailbox (`local-part@domain`), surrounding whitespace ignored.
///
/// # Errors
///
/// Returns `AddressError` if the input is not a deliverable mailbox.
pub fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let input = input.trim();

    if input.is_empty() {
        return Err(AddressError::Empty);
    }

    if input.len() > MAX_MAILBOX_LEN {
        return Err(AddressError::TooLong);
    }

    let at_pos = find_unquoted_at(input)?;
    let local_part = &input[..at_pos];
    let domain = &input[at_pos + 1..];

    if local_part.len() > MAX_LOCAL_PART_LEN {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(AddressError::DomainTooLong);
    }

    parse_local_part(local_part)?;
    parse_domain(domain)?;

    Ok(Mailbox {
        local_part: local_part.to_string(),
        domain: domain.to_string(),
    })
}

/// Returns `true` if `input` is a deliverable mailbox.
#[must_use]
pub fn is_valid(input: &str) -> bool {
    parse_mailbox(input).is_ok()
}

/// Find the last '@' that is not inside a quoted string.
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut prev_was_backslash = false;
    let mut found = None;

    for (i, ch) in input.char_indices() {
        if ch == '"' && !prev_was_backslash {
            in_quotes = !in_quotes;
        } else if ch == '@' && !in_quotes {
            found = Some(i);
        }

        prev_was_backslash = ch == '\\' && !prev_was_backslash;
    }

    found.ok_or(AddressError::MissingAtSign)
}

fn parse_local_part(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart(
            "Empty local-part".to_string(),
        ));
    }

    if input.starts_with('"') {
        parse_quoted_string(input)
    } else {
        parse_dot_string(input)
    }
}

/// Dot-string: Atom *("." Atom)
fn parse_dot_string(input: &str) -> Result<()> {
    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot contain consecutive dots".to_string(),
        ));
    }

    if let Some(ch) = input.chars().find(|&ch| ch != '.' && !is_atext(ch)) {
        return Err(AddressError::InvalidLocalPart(format!(
            "Invalid character '{ch}' in atom"
        )));
    }

    Ok(())
}

/// Quoted-string: DQUOTE *QcontentSMTP DQUOTE
fn parse_quoted_string(input: &str) -> Result<()> {
    if input.len() < 2 || !input.ends_with('"') {
        return Err(AddressError::UnclosedQuotedString);
    }

    let content = &input[1..input.len() - 1];

    let mut chars = content.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) if next.is_ascii_graphic() || next == ' ' => {}
                Some(next) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "Invalid quoted-pair: \\{next}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "Backslash at end of quoted string".to_string(),
                    ));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "Invalid character '{ch}' in quoted string"
            )));
        }
    }

    Ok(())
}

/// Domain: sub-domain 1*("." sub-domain), with a plausible top-level label.
fn parse_domain(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("Empty domain".to_string()));
    }

    if input.starts_with('[') {
        return Err(AddressError::InvalidDomain(
            "Address literals are not accepted".to_string(),
        ));
    }

    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidDomain(
            "Domain cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidDomain(
            "Domain cannot contain consecutive dots".to_string(),
        ));
    }

    let labels: Vec<&str> = input.split('.').collect();
    if labels.len() < 2 {
        return Err(AddressError::InvalidDomain(format!(
            "Domain '{input}' is not fully qualified"
        )));
    }

    for label in &labels {
        parse_subdomain(label)?;
    }

    let tld = labels[labels.len() - 1];
    let plausible_tld = (tld.len() >= 2 && tld.chars().all(|ch| ch.is_ascii_alphabetic()))
        || tld.to_ascii_lowercase().starts_with("xn--");
    if !plausible_tld {
        return Err(AddressError::InvalidDomain(format!(
            "Invalid top-level domain '{tld}'"
        )));
    }

    Ok(())
}

/// sub-domain: Let-dig [Ldh-str]
fn parse_subdomain(input: &str) -> Result<()> {
    if input.len() > MAX_LABEL_LEN {
        return Err(AddressError::InvalidDomain(format!(
            "Label exceeds {MAX_LABEL_LEN} octets"
        )));
    }

    if let Some(ch) = input
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '-')
    {
        return Err(AddressError::InvalidDomain(format!(
            "Invalid character '{ch}' in subdomain"
        )));
    }

    if input.starts_with('-') || input.ends_with('-') {
        return Err(AddressError::InvalidDomain(format!(
            "Subdomain '{input}' must start and end with a letter or digit"
        )));
    }

    Ok(())
}

/// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" /
///         "*" / "+" / "-" / "/" / "=" / "?" / "^" / "_" / "\`" /
///         "{" / "|" / "}" / "~"
#[inline]
const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// qtextSMTP = %d32-33 / %d35-91 / %d93-126
#[inline]
const fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch as u32, 32..=33 | 35..=91 | 93..=126)
}
