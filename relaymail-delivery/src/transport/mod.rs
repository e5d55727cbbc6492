//! Delivery transports. Each implements [`Transport`] and is tried as an
//! independent connection by the engine.

mod http_api;
mod smtp;

use async_trait::async_trait;

pub use http_api::HttpApiTransport;
pub use smtp::SmtpTransport;

use crate::{
    config::TransportDescriptor,
    error::TransportError,
    request::{Envelope, SendReceipt},
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// The chain entry this transport was built from.
    fn descriptor(&self) -> &TransportDescriptor;

    /// One complete send attempt over a fresh connection.
    async fn attempt_send(&self, envelope: &Envelope) -> Result<SendReceipt, TransportError>;
}
