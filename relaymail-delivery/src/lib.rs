//! Email delivery over an ordered fallback chain, and STARTTLS diagnostics.
//!
//! [`DeliveryEngine`] validates a request, assembles the message and tries
//! each transport of the chain in turn: the primary SMTP relay, a
//! STARTTLS-required alternate port, then an HTTP delivery API.
//! [`DiagnosticRunner`] drives the SMTP client by hand and returns a
//! transcript.

pub mod config;
pub mod diagnostic;
pub mod engine;
pub mod error;
pub mod message;
pub mod recipients;
pub mod request;
pub mod transport;

pub use config::{
    ConfigSource, EnvSource, Layered, MapSource, TransportConfig, TransportDescriptor,
    TransportKind, TransportRole,
};
pub use diagnostic::{DiagnosticReport, DiagnosticRequest, DiagnosticRunner};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, TransportError, ValidationError};
pub use recipients::{NormalizedRecipient, RecipientInput, RecipientSpec, normalize};
pub use request::{DeliveryOutcome, DeliveryResult, EmailRequest, Envelope, SendReceipt};
pub use transport::{HttpApiTransport, SmtpTransport, Transport};
