pub mod client;

pub use client::{
    ClientError, Credentials, Direction, ErrorKind, Response, SessionConfig, SessionState,
    SmtpSession, Transcript, TranscriptEntry,
};
