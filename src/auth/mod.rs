//! SASL authentication for SMTP.
//!
//! Mechanisms implement the [`SaslMechanism`] trait: a name, whether an
//! initial response can be sent on the AUTH line, and a challenge step
//! driven by the authentication loop. Built-in mechanisms:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely deployed)
//! - CRAM-MD5 (RFC 2195)
//! - XOAUTH2 (Google/Microsoft)
//! - OAUTHBEARER (RFC 7628)

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// A client-side SASL mechanism driven by the authentication loop.
///
/// An instance is consumed by a single authentication attempt. The loop
/// calls [`challenge`](SaslMechanism::challenge) with `None` to compute the
/// initial response (when supported) and with the server's 334 payload for
/// every subsequent step.
pub trait SaslMechanism: Send {
    /// The mechanism name as advertised in the AUTH capability.
    fn name(&self) -> &str;

    /// Whether the mechanism can send its first token on the AUTH line
    /// (RFC 4954 initial response).
    fn supports_initial_response(&self) -> bool;

    /// Computes the next client token, base64-encoded, from the decoded
    /// server challenge text (or `None` for the initial response).
    fn challenge(&mut self, input: Option<&str>) -> SmtpResult<String>;

    /// Whether the mechanism considers its exchange complete.
    fn is_authenticated(&self) -> bool;

    /// Whether the mechanism negotiated a security layer that changes the
    /// wire format, requiring the capability set to be refreshed.
    fn negotiated_security_layer(&self) -> bool {
        false
    }
}

/// Credential types for authentication.
#[derive(Clone)]
pub enum Credentials {
    /// Plain username and password.
    Plain {
        /// Username.
        username: String,
        /// Password (protected).
        password: SecretString,
    },
    /// OAuth2 token (XOAUTH2 format).
    XOAuth2 {
        /// Username/email.
        username: String,
        /// Access token (protected).
        access_token: SecretString,
    },
    /// OAuth 2.0 Bearer Token (RFC 7628).
    OAuthBearer {
        /// Access token (protected).
        access_token: SecretString,
    },
}

impl Credentials {
    /// Creates plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Creates XOAUTH2 credentials.
    pub fn xoauth2(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::XOAuth2 {
            username: username.into(),
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Creates OAUTHBEARER credentials.
    pub fn oauth_bearer(access_token: impl Into<String>) -> Self {
        Self::OAuthBearer {
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Returns the username if applicable.
    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Plain { username, .. } => Some(username),
            Credentials::XOAuth2 { username, .. } => Some(username),
            Credentials::OAuthBearer { .. } => None,
        }
    }

    /// Mechanism names these credentials can drive, strongest first.
    ///
    /// OAUTH-family mechanisms never appear for password credentials:
    /// supplying a bearer token is what opts in to them.
    pub fn mechanism_preference(&self) -> &'static [&'static str] {
        match self {
            Credentials::Plain { .. } => &["CRAM-MD5", "PLAIN", "LOGIN"],
            Credentials::XOAuth2 { .. } => &["XOAUTH2"],
            Credentials::OAuthBearer { .. } => &["OAUTHBEARER"],
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Credentials::XOAuth2 { username, .. } => f
                .debug_struct("XOAuth2")
                .field("username", username)
                .field("access_token", &"[REDACTED]")
                .finish(),
            Credentials::OAuthBearer { .. } => f
                .debug_struct("OAuthBearer")
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Provider for credentials with optional token refresh.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Returns the current credentials.
    async fn get_credentials(&self) -> SmtpResult<Credentials>;

    /// Refreshes credentials if needed (e.g., OAuth token refresh).
    async fn refresh(&self) -> SmtpResult<()>;

    /// Returns true if credentials need refresh.
    fn needs_refresh(&self) -> bool {
        false
    }
}

/// Static credential provider (no refresh).
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    /// Creates a new static provider.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Creates a provider with plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Credentials::plain(username, password))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self) -> SmtpResult<Credentials> {
        Ok(self.credentials.clone())
    }

    async fn refresh(&self) -> SmtpResult<()> {
        Ok(())
    }
}

/// Constructs the named mechanism for the given credentials, or `None`
/// when the pairing makes no sense (e.g., CRAM-MD5 with a bearer token).
pub fn create_mechanism(name: &str, credentials: &Credentials) -> Option<Box<dyn SaslMechanism>> {
    match (name.to_uppercase().as_str(), credentials) {
        ("PLAIN", Credentials::Plain { username, password }) => {
            Some(Box::new(Plain::new(username.clone(), password.clone())))
        }
        ("LOGIN", Credentials::Plain { username, password }) => {
            Some(Box::new(Login::new(username.clone(), password.clone())))
        }
        ("CRAM-MD5", Credentials::Plain { username, password }) => {
            Some(Box::new(CramMd5::new(username.clone(), password.clone())))
        }
        ("XOAUTH2", Credentials::XOAuth2 { username, access_token }) => {
            Some(Box::new(XOAuth2::new(username.clone(), access_token.clone())))
        }
        ("OAUTHBEARER", Credentials::OAuthBearer { access_token }) => {
            Some(Box::new(OAuthBearer::new(access_token.clone())))
        }
        _ => None,
    }
}

/// PLAIN (RFC 4616): a single `\0authcid\0password` token.
pub struct Plain {
    username: String,
    password: SecretString,
    done: bool,
}

impl Plain {
    /// Creates the mechanism.
    pub fn new(username: String, password: SecretString) -> Self {
        Self { username, password, done: false }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn supports_initial_response(&self) -> bool {
        true
    }

    fn challenge(&mut self, _input: Option<&str>) -> SmtpResult<String> {
        if self.done {
            return Err(SmtpError::Mechanism("PLAIN is a single-step mechanism".to_string()));
        }
        self.done = true;
        let token = format!("\0{}\0{}", self.username, self.password.expose_secret());
        Ok(BASE64.encode(token))
    }

    fn is_authenticated(&self) -> bool {
        self.done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStep {
    Username,
    Password,
    Done,
}

/// LOGIN: obsolete two-step username/password exchange.
pub struct Login {
    username: String,
    password: SecretString,
    step: LoginStep,
}

impl Login {
    /// Creates the mechanism.
    pub fn new(username: String, password: SecretString) -> Self {
        Self { username, password, step: LoginStep::Username }
    }
}

impl SaslMechanism for Login {
    fn name(&self) -> &str {
        "LOGIN"
    }

    fn supports_initial_response(&self) -> bool {
        false
    }

    fn challenge(&mut self, _input: Option<&str>) -> SmtpResult<String> {
        // The server prompts are decorative ("Username:", "Password:");
        // only the step order matters.
        match self.step {
            LoginStep::Username => {
                self.step = LoginStep::Password;
                Ok(BASE64.encode(&self.username))
            }
            LoginStep::Password => {
                self.step = LoginStep::Done;
                Ok(BASE64.encode(self.password.expose_secret()))
            }
            LoginStep::Done => {
                Err(SmtpError::Mechanism("LOGIN exchange already complete".to_string()))
            }
        }
    }

    fn is_authenticated(&self) -> bool {
        self.step == LoginStep::Done
    }
}

/// CRAM-MD5 (RFC 2195): HMAC-MD5 over a server-supplied challenge.
pub struct CramMd5 {
    username: String,
    password: SecretString,
    done: bool,
}

impl CramMd5 {
    /// Creates the mechanism.
    pub fn new(username: String, password: SecretString) -> Self {
        Self { username, password, done: false }
    }
}

impl SaslMechanism for CramMd5 {
    fn name(&self) -> &str {
        "CRAM-MD5"
    }

    fn supports_initial_response(&self) -> bool {
        false
    }

    fn challenge(&mut self, input: Option<&str>) -> SmtpResult<String> {
        let challenge = input.ok_or_else(|| {
            SmtpError::Mechanism("CRAM-MD5 requires a server challenge".to_string())
        })?;
        if self.done {
            return Err(SmtpError::Mechanism("CRAM-MD5 exchange already complete".to_string()));
        }

        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::Mechanism(format!("invalid CRAM-MD5 challenge: {e}")))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(self.password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::Mechanism(format!("HMAC error: {e}")))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        let hex_digest: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.done = true;
        Ok(BASE64.encode(format!("{} {}", self.username, hex_digest)))
    }

    fn is_authenticated(&self) -> bool {
        self.done
    }
}

/// XOAUTH2: single bearer-token message used by Gmail and Outlook.
pub struct XOAuth2 {
    username: String,
    access_token: SecretString,
    sent: bool,
}

impl XOAuth2 {
    /// Creates the mechanism.
    pub fn new(username: String, access_token: SecretString) -> Self {
        Self { username, access_token, sent: false }
    }
}

impl SaslMechanism for XOAuth2 {
    fn name(&self) -> &str {
        "XOAUTH2"
    }

    fn supports_initial_response(&self) -> bool {
        true
    }

    fn challenge(&mut self, _input: Option<&str>) -> SmtpResult<String> {
        if self.sent {
            // On failure the server sends a JSON blob in a 334 and expects
            // an empty line before it issues the final status.
            return Ok(String::new());
        }
        self.sent = true;
        let token = format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.username,
            self.access_token.expose_secret()
        );
        Ok(BASE64.encode(token))
    }

    fn is_authenticated(&self) -> bool {
        self.sent
    }
}

/// OAUTHBEARER (RFC 7628).
pub struct OAuthBearer {
    access_token: SecretString,
    host: Option<String>,
    port: Option<u16>,
    sent: bool,
}

impl OAuthBearer {
    /// Creates the mechanism.
    pub fn new(access_token: SecretString) -> Self {
        Self { access_token, host: None, port: None, sent: false }
    }

    /// Attaches the host/port fields to the GS2 message.
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

impl SaslMechanism for OAuthBearer {
    fn name(&self) -> &str {
        "OAUTHBEARER"
    }

    fn supports_initial_response(&self) -> bool {
        true
    }

    fn challenge(&mut self, _input: Option<&str>) -> SmtpResult<String> {
        if self.sent {
            // Error recovery mirrors XOAUTH2: a lone ^A completes the
            // failed exchange.
            return Ok(BASE64.encode("\x01"));
        }
        self.sent = true;
        let mut message = String::from("n,,");
        if let Some(host) = &self.host {
            message.push_str(&format!("\x01host={host}"));
        }
        if let Some(port) = self.port {
            message.push_str(&format!("\x01port={port}"));
        }
        message.push_str(&format!(
            "\x01auth=Bearer {}\x01\x01",
            self.access_token.expose_secret()
        ));
        Ok(BASE64.encode(message))
    }

    fn is_authenticated(&self) -> bool {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response() {
        let mut mech = Plain::new("user".to_string(), SecretString::new("pass".to_string()));
        assert!(mech.supports_initial_response());
        assert!(!mech.is_authenticated());
        let response = mech.challenge(None).unwrap();
        assert_eq!(BASE64.decode(response).unwrap(), b"\0user\0pass");
        assert!(mech.is_authenticated());
        assert!(mech.challenge(None).is_err());
    }

    #[test]
    fn test_login_two_step_exchange() {
        let mut mech = Login::new("user".to_string(), SecretString::new("pass".to_string()));
        assert!(!mech.supports_initial_response());
        let first = mech.challenge(Some("VXNlcm5hbWU6")).unwrap();
        assert_eq!(BASE64.decode(first).unwrap(), b"user");
        assert!(!mech.is_authenticated());
        let second = mech.challenge(Some("UGFzc3dvcmQ6")).unwrap();
        assert_eq!(BASE64.decode(second).unwrap(), b"pass");
        assert!(mech.is_authenticated());
    }

    #[test]
    fn test_cram_md5_rfc_vector() {
        // The worked example from RFC 2195 §2.
        let mut mech = CramMd5::new(
            "tim".to_string(),
            SecretString::new("tanstaaftanstaaf".to_string()),
        );
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = mech.challenge(Some(&challenge)).unwrap();
        assert_eq!(
            BASE64.decode(response).unwrap(),
            b"tim b913a602c7eda7a495b4e6e7334d3890"
        );
    }

    #[test]
    fn test_cram_md5_requires_challenge() {
        let mut mech = CramMd5::new("u".to_string(), SecretString::new("p".to_string()));
        assert!(mech.challenge(None).is_err());
    }

    #[test]
    fn test_xoauth2_initial_response() {
        let mut mech = XOAuth2::new(
            "user@example.com".to_string(),
            SecretString::new("ya29.token".to_string()),
        );
        let response = mech.challenge(None).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert!(decoded.contains("user=user@example.com"));
        assert!(decoded.contains("auth=Bearer ya29.token"));
        // The error-recovery step is an empty line.
        assert_eq!(mech.challenge(Some("eyJzdGF0dXMiOiI0MDEifQ==")).unwrap(), "");
    }

    #[test]
    fn test_oauth_bearer_message_shape() {
        let mut mech = OAuthBearer::new(SecretString::new("tok".to_string()))
            .with_endpoint("smtp.example.com", 587);
        let response = mech.challenge(None).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert!(decoded.starts_with("n,,"));
        assert!(decoded.contains("\x01host=smtp.example.com"));
        assert!(decoded.contains("\x01port=587"));
        assert!(decoded.ends_with("\x01auth=Bearer tok\x01\x01"));
    }

    #[test]
    fn test_mechanism_preference_excludes_oauth_for_passwords() {
        let creds = Credentials::plain("u", "p");
        let preference = creds.mechanism_preference();
        assert_eq!(preference, &["CRAM-MD5", "PLAIN", "LOGIN"]);

        let creds = Credentials::xoauth2("u", "t");
        assert_eq!(creds.mechanism_preference(), &["XOAUTH2"]);
    }

    #[test]
    fn test_create_mechanism_pairing() {
        let creds = Credentials::plain("u", "p");
        assert!(create_mechanism("CRAM-MD5", &creds).is_some());
        assert!(create_mechanism("cram-md5", &creds).is_some());
        assert!(create_mechanism("XOAUTH2", &creds).is_none());
        assert!(create_mechanism("GSSAPI", &creds).is_none());

        let creds = Credentials::oauth_bearer("tok");
        assert!(create_mechanism("OAUTHBEARER", &creds).is_some());
        assert!(create_mechanism("PLAIN", &creds).is_none());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::plain("user", "secret_password");
        let debug_str = format!("{creds:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
