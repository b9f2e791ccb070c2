//! Configuration for the SMTP client.
//!
//! Connection settings, TLS options, and credentials, with a builder and
//! serde support for loading from configuration files. Durations use the
//! humantime format ("30s", "2m").

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP submission port (STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Port that conventionally carries TLS from the first byte.
pub const SMTPS_PORT: u16 = 465;

/// Default timeout for establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for individual reads and writes.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// How and when the connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Never negotiate TLS.
    Plain,
    /// TLS from the first byte (SMTPS, port 465).
    SslOnConnect,
    /// STARTTLS when the server advertises it (default).
    #[default]
    StartTlsIfAvailable,
    /// STARTTLS, failing if the server does not advertise it.
    StartTlsRequired,
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2 (default).
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS options handed to the stream upgrader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Minimum TLS version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Verify the server certificate chain and hostname. Disabling this
    /// accepts any certificate; testing only.
    #[serde(default = "default_true")]
    pub verify_certificate: bool,
    /// Additional PEM CA bundle trusted alongside the webpki roots.
    pub ca_bundle_path: Option<PathBuf>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            min_version: TlsVersion::default(),
            verify_certificate: true,
            ca_bundle_path: None,
            sni_override: None,
        }
    }
}

/// SMTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS options.
    #[serde(default)]
    pub tls: TlsOptions,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (never serialized).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-operation read/write timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Domain sent in EHLO/HELO. When unset, an IP literal formed from the
    /// local endpoint is used instead.
    pub local_domain: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}
fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::Configuration("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(SmtpError::Configuration("port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Builds credentials from the configured username and password.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::Plain {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Builder for [`SmtpConfig`].
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: TlsOptions,
    username: Option<String>,
    password: Option<SecretString>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    local_domain: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Replaces the TLS options wholesale.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-operation read/write timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the domain sent in EHLO/HELO.
    pub fn local_domain(mut self, domain: impl Into<String>) -> Self {
        self.local_domain = Some(domain.into());
        self
    }

    /// Builds the configuration. Port 465 switches the default TLS mode to
    /// TLS-on-connect, matching SMTPS convention.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let mut tls = self.tls;
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if port == SMTPS_PORT && tls.mode == TlsMode::StartTlsIfAvailable {
            tls.mode = TlsMode::SslOnConnect;
        }

        let config = SmtpConfig {
            host: self.host.unwrap_or_default(),
            port,
            tls,
            username: self.username,
            password: self.password,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            local_domain: self.local_domain,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = SmtpConfig::builder().host("smtp.example.com").build().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.tls.mode, TlsMode::StartTlsIfAvailable);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.address(), "smtp.example.com:587");
        assert!(!config.has_auth());
    }

    #[test]
    fn test_port_465_implies_ssl_on_connect() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(465)
            .build()
            .unwrap();
        assert_eq!(config.tls.mode, TlsMode::SslOnConnect);

        // An explicit mode is left alone.
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(465)
            .tls_mode(TlsMode::Plain)
            .build()
            .unwrap();
        assert_eq!(config.tls.mode, TlsMode::Plain);
    }

    #[test]
    fn test_validation() {
        assert!(SmtpConfig::builder().build().is_err());
        assert!(SmtpConfig::builder().host("h").port(0).build().is_err());
    }

    #[test]
    fn test_credentials_from_config() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .credentials("user", "pass")
            .build()
            .unwrap();
        assert!(config.has_auth());
        let creds = config.credentials().unwrap();
        assert_eq!(creds.username(), Some("user"));
    }

    #[test]
    fn test_deserialize_with_humantime_durations() {
        let json = r#"{
            "host": "smtp.example.com",
            "connect_timeout": "10s",
            "command_timeout": "2m",
            "tls": { "mode": "start_tls_required" }
        }"#;
        let config: SmtpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(120));
        assert_eq!(config.tls.mode, TlsMode::StartTlsRequired);
        assert!(config.tls.verify_certificate);
    }
}
