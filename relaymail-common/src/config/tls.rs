//! TLS negotiation mode and certificate validation policy.

/// How TLS is negotiated on an SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Upgrade via STARTTLS when the server advertises it, otherwise stay in
    /// plaintext.
    #[default]
    Opportunistic,

    /// Upgrade via STARTTLS; a session that cannot upgrade fails.
    Required,

    /// Wrap the socket in TLS before the server banner (SMTPS, port 465).
    Implicit,
}

impl TlsPolicy {
    #[must_use]
    pub const fn is_implicit(self) -> bool {
        matches!(self, Self::Implicit)
    }

    #[must_use]
    pub const fn requires_starttls(self) -> bool {
        matches!(self, Self::Required)
    }
}

/// Certificate validation policy.
///
/// Production delivery reads this from the `SMTP_REJECT_UNAUTHORIZED` flag and
/// accepts any certificate unless that flag is set. Diagnostics always use
/// [`TlsCertificatePolicy::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsCertificatePolicy {
    /// **SECURITY WARNING**: `true` disables certificate validation.
    ///
    /// Default: `false` (validate certificates)
    pub accept_invalid_certs: bool,
}

impl TlsCertificatePolicy {
    /// Validate the server certificate chain and host name.
    #[must_use]
    pub const fn verify() -> Self {
        Self {
            accept_invalid_certs: false,
        }
    }

    /// Accept any certificate the server presents.
    #[must_use]
    pub const fn accept_any() -> Self {
        Self {
            accept_invalid_certs: true,
        }
    }

    /// Policy derived from the reject-unauthorized flag.
    #[must_use]
    pub const fn from_reject_unauthorized(reject_unauthorized: bool) -> Self {
        Self {
            accept_invalid_certs: !reject_unauthorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_verifies() {
        assert!(!TlsCertificatePolicy::default().accept_invalid_certs);
        assert_eq!(TlsPolicy::default(), TlsPolicy::Opportunistic);
    }

    #[test]
    fn test_reject_unauthorized_mapping() {
        assert_eq!(
            TlsCertificatePolicy::from_reject_unauthorized(true),
            TlsCertificatePolicy::verify()
        );
        assert_eq!(
            TlsCertificatePolicy::from_reject_unauthorized(false),
            TlsCertificatePolicy::accept_any()
        );
    }
}
