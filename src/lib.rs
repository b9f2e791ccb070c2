//! # courier-smtp
//!
//! An async SMTP submission client:
//! - RFC 5321 sessions with EHLO capability negotiation and HELO fallback
//! - SASL authentication (PLAIN, LOGIN, CRAM-MD5, XOAUTH2, OAUTHBEARER)
//! - Transport security (STARTTLS, implicit TLS) via rustls
//! - PIPELINING, SIZE, DSN, 8BITMIME, SMTPUTF8, and BDAT/CHUNKING
//! - A default RFC 5322 MIME formatter behind a pluggable trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_smtp::{Credentials, Email, SmtpConfig, SmtpSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .build()?;
//!
//!     let mut session = SmtpSession::connect(config).await?;
//!     session.authenticate(&Credentials::plain("user@example.com", "password")).await?;
//!
//!     let email = Email::builder()
//!         .from("sender@example.com")
//!         .to("recipient@example.com")
//!         .subject("Hello from Rust!")
//!         .text("This is a test email.")
//!         .build()?;
//!
//!     let reply = session.send_email(&email).await?;
//!     println!("accepted: {reply}");
//!     session.disconnect(true).await;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// MIME formatting
pub mod mime;

// Observability
pub mod observability;

// Session
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{CredentialProvider, Credentials, SaslMechanism};
pub use client::{NullEvents, SessionEvents, SessionState, SmtpSession};
pub use config::{SmtpConfig, SmtpConfigBuilder, TlsMode, TlsOptions, TlsVersion};
pub use errors::{CommandKind, EnhancedStatusCode, SmtpError, SmtpResult};
pub use mime::{EncodingConstraint, EncodingRequirement, FormattedEmail, MessageSource, RawMessage};
pub use observability::{ProtocolLogger, SecretDetector, SmtpMetrics};
pub use protocol::{ExtensionSet, SmtpCommand, SmtpResponse};
pub use transport::{MaybeTlsStream, SmtpStream, TlsUpgrader};
pub use types::{
    Address, Attachment, ConnectionInfo, DsnNotify, Email, EmailBuilder, Envelope, ProgressSink,
    SendOptions,
};

#[cfg(feature = "rustls-tls")]
pub use transport::RustlsUpgrader;
