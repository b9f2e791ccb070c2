//! Error types for the SMTP client.
//!
//! Errors are a single tagged enum; call sites match on the variant to decide
//! whether the session is still usable. Command-level rejections carry the
//! server's status code and text, and an enhanced status code (RFC 2034) when
//! the server supplied one.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::SmtpResponse;
use crate::types::Address;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Classifies a command-level rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// The server rejected the MAIL FROM sender.
    SenderNotAccepted,
    /// The server rejected an RCPT TO recipient.
    RecipientNotAccepted,
    /// The server rejected the message content (DATA/BDAT).
    MessageNotAccepted,
    /// The server replied with a status the client did not expect.
    UnexpectedStatus,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::SenderNotAccepted => write!(f, "sender not accepted"),
            CommandKind::RecipientNotAccepted => write!(f, "recipient not accepted"),
            CommandKind::MessageNotAccepted => write!(f, "message not accepted"),
            CommandKind::UnexpectedStatus => write!(f, "unexpected status"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Splits an enhanced status code off the front of a response text, if
    /// one is present.
    pub fn strip(text: &str) -> (Option<Self>, &str) {
        let mut split = text.splitn(2, ' ');
        match split.next().and_then(Self::parse) {
            Some(code) => (Some(code), split.next().unwrap_or("").trim_start()),
            None => (None, text),
        }
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }

    /// Returns true if this is a temporary failure.
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP client error.
#[derive(Debug, Error)]
pub enum SmtpError {
    /// The server rejected a command with a status code the transaction
    /// could classify. Non-fatal: the session remains connected after the
    /// transaction is reset.
    #[error("{kind}: {code} {text}")]
    CommandFailed {
        /// Status code from the server reply.
        code: u16,
        /// Reply text.
        text: String,
        /// Classification of the rejection.
        kind: CommandKind,
        /// The mailbox the rejection applies to, for MAIL FROM / RCPT TO.
        mailbox: Option<Address>,
        /// Enhanced status code, when the server supplied one.
        enhanced: Option<EnhancedStatusCode>,
    },

    /// The server sent bytes that do not form a valid SMTP response.
    /// Fatal: the session disconnects.
    #[error("protocol parse error: {details}")]
    ProtocolParse {
        /// What the parser objected to.
        details: String,
        /// The last response successfully read, for context.
        last_response: Option<SmtpResponse>,
    },

    /// The connection closed in the middle of a response. Fatal.
    #[error("the server disconnected unexpectedly")]
    UnexpectedDisconnect {
        /// The last response successfully read, for context.
        last_response: Option<SmtpResponse>,
    },

    /// The server replied 530: authentication is required for this
    /// operation. The session stays connected.
    #[error("authentication required: {text}")]
    NotAuthenticated {
        /// Reply text.
        text: String,
    },

    /// Every attempted SASL mechanism failed. The session stays connected
    /// but unauthenticated.
    #[error("authentication failed: {status} {text}")]
    AuthenticationFailed {
        /// Status code of the final server rejection.
        status: u16,
        /// Reply text of the final server rejection.
        text: String,
        /// Mechanism-side error that triggered the exchange cancellation,
        /// when there was one.
        #[source]
        inner: Option<Box<SmtpError>>,
    },

    /// The server advertised AUTH but no advertised mechanism could be
    /// constructed for the supplied credentials.
    #[error("no compatible authentication mechanism")]
    NoCompatibleMechanism,

    /// The operation needs an extension the server did not advertise.
    /// Raised before any I/O; non-fatal.
    #[error("the server does not support {feature}")]
    FeatureNotSupported {
        /// Name of the missing extension.
        feature: &'static str,
    },

    /// A SASL mechanism rejected its input or could not compute a
    /// challenge response.
    #[error("SASL mechanism error: {0}")]
    Mechanism(String),

    /// The operation was cancelled. Fatal: the session disconnects.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The session is not connected.
    #[error("the session is not connected")]
    NotConnected,

    /// Byte-level I/O failure, including expired read/write timeouts.
    /// Fatal: the session disconnects.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A mailbox address or command argument failed validation.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl SmtpError {
    /// Returns true if this error leaves the session unusable.
    ///
    /// Fatal errors require a fresh connect; non-fatal errors leave the
    /// session connected (the transaction engine resets it with RSET).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmtpError::ProtocolParse { .. }
                | SmtpError::UnexpectedDisconnect { .. }
                | SmtpError::Cancelled
                | SmtpError::Io(_)
        )
    }

    /// Builds a `CommandFailed` from a server reply, pulling out the
    /// enhanced status code when present.
    pub fn command(kind: CommandKind, response: &SmtpResponse, mailbox: Option<Address>) -> Self {
        let (enhanced, text) = EnhancedStatusCode::strip(&response.text);
        SmtpError::CommandFailed {
            code: response.code,
            text: text.to_string(),
            kind,
            mailbox,
            enhanced,
        }
    }

    /// Returns the server status code, for command-level errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            SmtpError::CommandFailed { code, .. } => Some(*code),
            SmtpError::AuthenticationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
