//! Test support for relaymail: a scripted SMTP server that records what it
//! receives and can upgrade connections with STARTTLS.

pub mod mock_server;

pub use mock_server::{MockSmtpServer, MockSmtpServerBuilder, SmtpCommand};
