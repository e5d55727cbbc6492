//! Timeout configuration for client-side SMTP sessions.
//!
//! Every suspension point of a session is bounded: the TCP connect, the TLS
//! handshake, each write of a command or message, each read of a server
//! reply, and the orderly shutdown.

use std::time::Duration;

/// Client-side SMTP timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Timeout for establishing the TCP connection.
    ///
    /// Default: 15 seconds
    pub connect_secs: u64,

    /// Timeout for the TLS handshake (implicit TLS or after STARTTLS).
    ///
    /// Default: 15 seconds
    pub tls_secs: u64,

    /// Timeout for reading a single server reply.
    ///
    /// Default: 10 seconds
    pub read_secs: u64,

    /// Timeout for writing a command line or the whole message body, and for
    /// the orderly shutdown of the socket.
    ///
    /// Default: 30 seconds
    pub write_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            tls_secs: 15,
            read_secs: 10,
            write_secs: 30,
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn tls(&self) -> Duration {
        Duration::from_secs(self.tls_secs)
    }

    #[must_use]
    pub const fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    #[must_use]
    pub const fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    /// The same limit for every phase, handy for tests against local servers.
    #[must_use]
    pub const fn uniform(secs: u64) -> Self {
        Self {
            connect_secs: secs,
            tls_secs: secs,
            read_secs: secs,
            write_secs: secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_timeouts_defaults() {
        let timeouts = ClientTimeouts::default();
        assert_eq!(timeouts.connect(), Duration::from_secs(15));
        assert_eq!(timeouts.tls(), Duration::from_secs(15));
        assert_eq!(timeouts.read(), Duration::from_secs(10));
        assert_eq!(timeouts.write(), Duration::from_secs(30));
    }

    #[test]
    fn test_uniform() {
        let timeouts = ClientTimeouts::uniform(1);
        assert_eq!(timeouts.write(), Duration::from_secs(1));
        assert_eq!(timeouts.connect(), timeouts.read());
    }
}
