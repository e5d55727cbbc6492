//! Typed error handling for delivery operations.
//!
//! Errors fall into three layers:
//! - [`ValidationError`]: the request itself is unusable (status 400, never retried)
//! - [`TransportError`]: one hop of the fallback chain failed (moves to the next hop)
//! - [`DeliveryError`]: what the caller of the engine finally sees

use relaymail_smtp::ClientError;
use thiserror::Error;

/// The request was rejected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("recipient field is required")]
    MissingRecipients,

    /// Checked on the raw entry count, before syntax validation.
    #[error("too many recipients (maximum {max}, got {count})")]
    TooManyRecipients { max: usize, count: usize },

    #[error("no valid recipients{}", rejected_suffix(.rejected))]
    NoValidRecipients { rejected: Vec<String> },

    #[error("subject is required")]
    MissingSubject,

    #[error("html or text body is required")]
    MissingBody,
}

fn rejected_suffix(rejected: &[String]) -> String {
    if rejected.is_empty() {
        String::new()
    } else {
        format!("; invalid entries: {}", rejected.join(", "))
    }
}

/// Failure of a single transport attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Smtp(#[from] ClientError),

    #[error("HTTP API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP API returned {status}: {body}")]
    ApiRejected { status: u16, body: String },

    #[error("Transport misconfigured: {0}")]
    Configuration(String),
}

impl TransportError {
    /// A `550` reply to `MAIL FROM`, which redirects the engine to the
    /// STARTTLS alternate rather than the next hop in order.
    #[must_use]
    pub fn is_relay_policy_rejection(&self) -> bool {
        matches!(self, Self::Smtp(e) if e.is_relay_policy_rejection())
    }
}

/// Top-level error returned by [`DeliveryEngine::send`](crate::DeliveryEngine::send).
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Every transport in the chain failed. Details are logged, not carried.
    #[error("internal send failure")]
    Exhausted { attempts: usize },
}

impl DeliveryError {
    /// HTTP-style status: 400 for bad input, 500 for delivery failure.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Exhausted { .. } => 500,
        }
    }

    /// The message that may be shown to end users.
    #[must_use]
    pub fn public_message(&self) -> String {
        self.to_string()
    }

    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
