//! Configuration types shared by the delivery and diagnostic paths.
//!
//! - [`timeouts`]: connect, TLS handshake and per-read ceilings
//! - [`tls`]: TLS negotiation mode and certificate validation policy

pub mod timeouts;
pub mod tls;

pub use timeouts::ClientTimeouts;
pub use tls::{TlsCertificatePolicy, TlsPolicy};
