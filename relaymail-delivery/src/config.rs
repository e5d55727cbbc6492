//! Transport configuration resolved from environment-style key/value sources.
//!
//! The chain is built once, at startup, in a fixed order: the primary relay,
//! a STARTTLS-required alternate port on the same host, and the HTTP API when
//! an API key is configured.

use std::{collections::HashMap, fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use relaymail_common::{
    config::{ClientTimeouts, TlsCertificatePolicy, TlsPolicy},
    logging::mask_user,
};
use relaymail_smtp::Credentials;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::recipients::DEFAULT_MAX_RECIPIENTS;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 587;
pub const DEFAULT_FALLBACK_PORT: u16 = 587;
pub const IMPLICIT_TLS_PORT: u16 = 465;
pub const DEFAULT_HELO_NAME: &str = "localhost";
pub const DEFAULT_API_URL: &str = "https://api.resend.com/emails";
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org?format=json";

/// A read-only view over configuration keys.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// An in-memory key/value set, used for overrides and tests.
#[derive(Debug, Clone, Default)]
pub struct MapSource(HashMap<String, String>);

impl MapSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapSource {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Sources consulted in order; the first that has a key wins.
#[derive(Default)]
pub struct Layered {
    layers: Vec<Box<dyn ConfigSource>>,
}

impl Layered {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, source: impl ConfigSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl ConfigSource for Layered {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

/// The value of `key`, treating blank values as absent.
fn non_empty(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source.get(key).filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr + fmt::Display + Copy>(source: &dyn ConfigSource, key: &str, default: T) -> T {
    non_empty(source, key).map_or(default, |raw| {
        raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "Invalid number in configuration, using default");
            default
        })
    })
}

/// Resolves a credential that may be supplied base64-encoded.
///
/// A present, non-blank `encoded_key` is decoded and used. If it is absent,
/// blank, not valid base64, or not UTF-8, `plain_key` is used instead.
pub fn resolve_credential(
    source: &dyn ConfigSource,
    encoded_key: &str,
    plain_key: &str,
) -> Option<String> {
    if let Some(encoded) = non_empty(source, encoded_key) {
        match STANDARD
            .decode(encoded.trim())
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
        {
            Ok(decoded) => return Some(decoded),
            Err(e) => {
                tracing::warn!(key = encoded_key, error = %e, "Failed to decode credential, using plain value");
            }
        }
    }

    non_empty(source, plain_key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportKind {
    #[serde(rename = "smtp")]
    Smtp,
    #[serde(rename = "http-api")]
    HttpApi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Smtp => "smtp",
            Self::HttpApi => "http-api",
        })
    }
}

/// Position of a descriptor in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Primary,
    /// Same host, STARTTLS required; the target of a relay-policy rejection.
    StartTlsAlternate,
    HttpApi,
}

/// One hop of the fallback chain. Immutable once built.
#[derive(Clone)]
pub struct TransportDescriptor {
    pub kind: TransportKind,
    pub role: TransportRole,
    /// SMTP host name, or the endpoint URL for the HTTP API.
    pub host: String,
    pub port: u16,
    pub tls: TlsPolicy,
    pub credentials: Option<Credentials>,
    pub api_key: Option<SecretString>,
}

impl TransportDescriptor {
    #[must_use]
    pub fn smtp(
        role: TransportRole,
        host: impl Into<String>,
        port: u16,
        tls: TlsPolicy,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            kind: TransportKind::Smtp,
            role,
            host: host.into(),
            port,
            tls,
            credentials,
            api_key: None,
        }
    }

    #[must_use]
    pub fn http_api(url: impl Into<String>, api_key: SecretString) -> Self {
        let url = url.into();
        let port = if url.starts_with("http://") { 80 } else { 443 };
        Self {
            kind: TransportKind::HttpApi,
            role: TransportRole::HttpApi,
            host: url,
            port,
            tls: TlsPolicy::Implicit,
            credentials: None,
            api_key: Some(api_key),
        }
    }

    #[must_use]
    pub const fn uses_implicit_tls(&self) -> bool {
        self.tls.is_implicit()
    }

    #[must_use]
    pub const fn requires_starttls(&self) -> bool {
        self.tls.requires_starttls()
    }

    /// Identity used in logs and outcomes.
    #[must_use]
    pub fn id(&self) -> String {
        match self.kind {
            TransportKind::Smtp => format!("smtp://{}:{}", self.host, self.port),
            TransportKind::HttpApi => self.host.clone(),
        }
    }
}

impl fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDescriptor")
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("credentials", &self.credentials)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Facts about a password that are safe to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PasswordHints {
    pub present: bool,
    pub has_whitespace: bool,
    pub ends_with_dot: bool,
}

impl PasswordHints {
    #[must_use]
    pub fn of(password: Option<&SecretString>) -> Self {
        let value = password.map_or("", |p| p.expose_secret().as_str());
        Self {
            present: !value.is_empty(),
            has_whitespace: value.chars().any(char::is_whitespace),
            ends_with_dot: value.ends_with('.'),
        }
    }
}

/// Everything the delivery engine and diagnostic runner need, built once.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub chain: Vec<TransportDescriptor>,
    /// Envelope sender: `MAIL_FROM`, otherwise the auth user.
    pub sender: Option<String>,
    pub credentials: Option<Credentials>,
    pub helo_name: String,
    pub timeouts: ClientTimeouts,
    /// Production certificate policy; diagnostics never consult it.
    pub certificates: TlsCertificatePolicy,
    pub max_recipients: usize,
    pub public_ip_url: Option<String>,
}

impl TransportConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let host = non_empty(source, "SMTP_SITE_HOST")
            .or_else(|| non_empty(source, "SMTP_HOST"))
            .map_or_else(|| DEFAULT_HOST.to_string(), |h| h.trim().to_string());

        let port_key = if non_empty(source, "SMTP_SITE_PORT").is_some() {
            "SMTP_SITE_PORT"
        } else {
            "SMTP_PORT"
        };
        let port = parse_or(source, port_key, DEFAULT_PORT);

        let implicit = non_empty(source, "SMTP_SECURE")
            .map_or(port == IMPLICIT_TLS_PORT, |secure| secure.trim() == "true");
        let fallback_port = parse_or(source, "FALLBACK_SMTP_PORT", DEFAULT_FALLBACK_PORT);

        let user = resolve_credential(source, "SMTP_USER_B64", "SMTP_USER");
        let pass = resolve_credential(source, "SMTP_PASS_B64", "SMTP_PASS");
        let credentials = match (user, pass) {
            (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
            (None, None) => None,
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("Only one of SMTP user and password is set, authentication disabled");
                None
            }
        };

        let primary_tls = if implicit {
            TlsPolicy::Implicit
        } else {
            TlsPolicy::Opportunistic
        };

        let mut chain = vec![
            TransportDescriptor::smtp(
                TransportRole::Primary,
                host.clone(),
                port,
                primary_tls,
                credentials.clone(),
            ),
            TransportDescriptor::smtp(
                TransportRole::StartTlsAlternate,
                host,
                fallback_port,
                TlsPolicy::Required,
                credentials.clone(),
            ),
        ];

        if let Some(api_key) = non_empty(source, "MAIL_API_KEY") {
            let url = non_empty(source, "MAIL_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
            chain.push(TransportDescriptor::http_api(
                url,
                SecretString::new(api_key.trim().to_string()),
            ));
        }

        let sender = non_empty(source, "MAIL_FROM")
            .map(|from| from.trim().to_string())
            .or_else(|| credentials.as_ref().map(|c| c.user().to_string()));

        let reject_unauthorized = source
            .get("SMTP_REJECT_UNAUTHORIZED")
            .is_some_and(|value| value.trim() == "true");

        let defaults = ClientTimeouts::default();
        let timeouts = ClientTimeouts {
            connect_secs: parse_or(source, "SMTP_CONNECT_TIMEOUT_SECS", defaults.connect_secs),
            tls_secs: parse_or(source, "SMTP_TLS_TIMEOUT_SECS", defaults.tls_secs),
            read_secs: parse_or(source, "SMTP_READ_TIMEOUT_SECS", defaults.read_secs),
            write_secs: parse_or(source, "SMTP_WRITE_TIMEOUT_SECS", defaults.write_secs),
        };

        let public_ip_url = match source.get("PUBLIC_IP_URL") {
            None => Some(DEFAULT_PUBLIC_IP_URL.to_string()),
            Some(url) if url.trim().is_empty() || url.trim() == "off" => None,
            Some(url) => Some(url.trim().to_string()),
        };

        Self {
            chain,
            sender,
            credentials,
            helo_name: non_empty(source, "SMTP_HELO_NAME")
                .map_or_else(|| DEFAULT_HELO_NAME.to_string(), |h| h.trim().to_string()),
            timeouts,
            certificates: TlsCertificatePolicy::from_reject_unauthorized(reject_unauthorized),
            max_recipients: parse_or(source, "MAIL_MAX_RECIPIENTS", DEFAULT_MAX_RECIPIENTS),
            public_ip_url,
        }
    }

    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_source(&EnvSource)
    }

    #[must_use]
    pub fn primary(&self) -> Option<&TransportDescriptor> {
        self.chain.first()
    }

    /// Logs the resolved chain without secrets.
    pub fn log_summary(&self) {
        let user = self.credentials.as_ref().map(|c| mask_user(c.user()));
        let hints = PasswordHints::of(self.credentials.as_ref().map(Credentials::password));

        tracing::info!(
            auth_user = user.as_deref().unwrap_or("<none>"),
            password_present = hints.present,
            password_has_whitespace = hints.has_whitespace,
            password_ends_with_dot = hints.ends_with_dot,
            verify_certificates = !self.certificates.accept_invalid_certs,
            "SMTP authentication"
        );

        for (position, descriptor) in self.chain.iter().enumerate() {
            tracing::info!(
                position,
                kind = %descriptor.kind,
                role = ?descriptor.role,
                transport = %descriptor.id(),
                tls = ?descriptor.tls,
                "Delivery chain"
            );
        }
    }
}
