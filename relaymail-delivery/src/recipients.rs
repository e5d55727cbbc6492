//! Recipient parsing and normalisation.
//!
//! A recipient field arrives either as one delimited string
//! (`"Ana <ana@x.com>; bob@x.com"`) or as a list whose entries are strings or
//! `{name, email}` objects. Each entry keeps its human-readable form for the
//! `To:` header and yields a bare lowercase address for the envelope.

use relaymail_common::address;
use serde::Deserialize;

use crate::error::ValidationError;

/// Default upper bound on recipients per request.
pub const DEFAULT_MAX_RECIPIENTS: usize = 10;

/// One entry of a recipient list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RecipientSpec {
    /// `"Name <addr>"` or `"addr"`
    Raw(String),
    Structured {
        #[serde(default)]
        name: Option<String>,
        email: String,
    },
}

impl RecipientSpec {
    /// The entry as it would appear in a header, or `None` if it is blank.
    fn display_form(&self) -> Option<String> {
        let entry = match self {
            Self::Raw(raw) => raw.trim().to_string(),
            Self::Structured { name, email } => {
                let email = email.trim();
                match name.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() && !email.is_empty() => {
                        format!("{name} <{email}>")
                    }
                    _ => email.to_string(),
                }
            }
        };
        (!entry.is_empty()).then_some(entry)
    }
}

/// The recipient field of a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RecipientInput {
    /// Split on `;` or `,`.
    Delimited(String),
    List(Vec<RecipientSpec>),
}

impl From<&str> for RecipientInput {
    fn from(value: &str) -> Self {
        Self::Delimited(value.to_string())
    }
}

impl From<Vec<RecipientSpec>> for RecipientInput {
    fn from(value: Vec<RecipientSpec>) -> Self {
        Self::List(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecipient {
    /// Header form, with any display name preserved.
    pub display_form: String,
    /// Bare, lowercased, syntactically valid mailbox.
    pub envelope_address: String,
}

/// Result of [`normalize`]: the usable recipients in input order, plus the raw
/// entries that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub recipients: Vec<NormalizedRecipient>,
    pub invalid: Vec<String>,
}

impl Normalized {
    /// The `To:` header value.
    #[must_use]
    pub fn header(&self) -> String {
        self.recipients
            .iter()
            .map(|r| r.display_form.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[must_use]
    pub fn envelope(&self) -> Vec<String> {
        self.recipients
            .iter()
            .map(|r| r.envelope_address.clone())
            .collect()
    }
}

fn entries(input: &RecipientInput) -> Vec<String> {
    match input {
        RecipientInput::Delimited(raw) => raw
            .split([';', ','])
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ToString::to_string)
            .collect(),
        RecipientInput::List(list) => list.iter().filter_map(RecipientSpec::display_form).collect(),
    }
}

/// The address inside the first `<...>` pair, or the whole entry.
fn extract_address(entry: &str) -> &str {
    entry
        .find('<')
        .and_then(|open| {
            let rest = &entry[open + 1..];
            rest.find('>').map(|close| &rest[..close])
        })
        .filter(|inner| !inner.is_empty())
        .map_or(entry, str::trim)
}

/// Parses `input` into envelope-ready recipients.
///
/// The entry count is checked against `max_count` before any syntax check.
/// Duplicates are kept; order is preserved.
///
/// # Errors
///
/// - [`ValidationError::MissingRecipients`] if the field has no entries
/// - [`ValidationError::TooManyRecipients`] if there are more than `max_count`
/// - [`ValidationError::NoValidRecipients`] if every entry is malformed
pub fn normalize(input: &RecipientInput, max_count: usize) -> Result<Normalized, ValidationError> {
    let entries = entries(input);

    if entries.is_empty() {
        return Err(ValidationError::MissingRecipients);
    }
    if entries.len() > max_count {
        return Err(ValidationError::TooManyRecipients {
            max: max_count,
            count: entries.len(),
        });
    }

    let mut recipients = Vec::with_capacity(entries.len());
    let mut invalid = Vec::new();

    for entry in entries {
        match address::parse_mailbox(extract_address(&entry)) {
            Ok(mailbox) => recipients.push(NormalizedRecipient {
                envelope_address: mailbox.to_lowercase().to_string(),
                display_form: entry,
            }),
            Err(_) => invalid.push(entry),
        }
    }

    if recipients.is_empty() {
        return Err(ValidationError::NoValidRecipients { rejected: invalid });
    }

    Ok(Normalized {
        recipients,
        invalid,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_mixed_delimited_input() {
        let normalized =
            normalize(&"Ana <ana@x.com>, bad, Bob <bob@x.com>".into(), 10).unwrap();

        assert_eq!(
            normalized.recipients,
            vec![
                NormalizedRecipient {
                    display_form: "Ana <ana@x.com>".to_string(),
                    envelope_address: "ana@x.com".to_string(),
                },
                NormalizedRecipient {
                    display_form: "Bob <bob@x.com>".to_string(),
                    envelope_address: "bob@x.com".to_string(),
                },
            ]
        );
        assert_eq!(normalized.invalid, vec!["bad"]);
        assert_eq!(normalized.header(), "Ana <ana@x.com>, Bob <bob@x.com>");
    }

    #[test]
    fn test_semicolons_and_case() {
        let normalized = normalize(&" ANA@Example.COM ;bob@example.com;".into(), 10).unwrap();
        assert_eq!(
            normalized.envelope(),
            vec!["ana@example.com", "bob@example.com"]
        );
        assert_eq!(normalized.recipients[0].display_form, "ANA@Example.COM");
    }

    #[test]
    fn test_structured_list() {
        let input = RecipientInput::List(vec![
            RecipientSpec::Structured {
                name: Some("Ana".to_string()),
                email: "ana@x.com".to_string(),
            },
            RecipientSpec::Structured {
                name: None,
                email: " carl@x.com ".to_string(),
            },
            RecipientSpec::Raw("Bob <bob@x.com>".to_string()),
        ]);
        let normalized = normalize(&input, 10).unwrap();
        assert_eq!(
            normalized.header(),
            "Ana <ana@x.com>, carl@x.com, Bob <bob@x.com>"
        );
        assert_eq!(
            normalized.envelope(),
            vec!["ana@x.com", "carl@x.com", "bob@x.com"]
        );
    }

    #[test]
    fn test_too_many_checked_before_syntax() {
        let input = (0..11).map(|_| "not-an-address").collect::<Vec<_>>().join(",");
        assert_eq!(
            normalize(&input.as_str().into(), 10),
            Err(ValidationError::TooManyRecipients { max: 10, count: 11 })
        );
    }

    #[test]
    fn test_all_invalid_lists_entries_in_order() {
        let error = normalize(&"zeta, alpha@, <>, m@x".into(), 10).unwrap_err();
        assert_eq!(
            error,
            ValidationError::NoValidRecipients {
                rejected: vec![
                    "zeta".to_string(),
                    "alpha@".to_string(),
                    "<>".to_string(),
                    "m@x".to_string(),
                ],
            }
        );
    }

    #[test]
    fn test_duplicates_are_kept() {
        let normalized = normalize(&"a@x.com, A@x.com".into(), 10).unwrap();
        assert_eq!(normalized.envelope(), vec!["a@x.com", "a@x.com"]);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            normalize(&" ; , ".into(), 10),
            Err(ValidationError::MissingRecipients)
        );
        assert_eq!(
            normalize(&RecipientInput::List(vec![]), 10),
            Err(ValidationError::MissingRecipients)
        );
    }

    #[test]
    fn test_deserialize_shapes() {
        let single: RecipientInput = serde_json::from_str(r#""a@x.com; b@x.com""#).unwrap();
        assert_eq!(single, RecipientInput::Delimited("a@x.com; b@x.com".to_string()));

        let list: RecipientInput =
            serde_json::from_str(r#"["a@x.com", {"name": "B", "email": "b@x.com"}]"#).unwrap();
        assert_eq!(
            list,
            RecipientInput::List(vec![
                RecipientSpec::Raw("a@x.com".to_string()),
                RecipientSpec::Structured {
                    name: Some("B".to_string()),
                    email: "b@x.com".to_string(),
                },
            ])
        );
    }
}
