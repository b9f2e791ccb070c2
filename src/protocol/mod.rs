//! SMTP protocol surface.
//!
//! Command formatting (RFC 5321 plus the ESMTP extensions this client
//! speaks), the parsed response type, well-known status codes, and the
//! capability registry built from an EHLO reply.

use std::collections::HashSet;
use std::fmt;

use crate::types::DsnNotify;

/// BODY parameter for MAIL FROM (RFC 6152 / RFC 3030).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// BODY=8BITMIME.
    EightBitMime,
    /// BODY=BINARYMIME.
    BinaryMime,
}

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism name.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM with optional ESMTP parameters.
    MailFrom {
        /// Sender address, already rendered as an SMTP literal.
        address: String,
        /// SMTPUTF8 parameter.
        smtputf8: bool,
        /// BODY parameter.
        body: Option<BodyKind>,
        /// ENVID parameter (DSN envelope identifier).
        envelope_id: Option<String>,
        /// SIZE parameter.
        size: Option<u64>,
    },
    /// RCPT TO with optional DSN NOTIFY parameter.
    RcptTo {
        /// Recipient address, already rendered as an SMTP literal.
        address: String,
        /// NOTIFY parameter.
        notify: Option<DsnNotify>,
    },
    /// DATA command.
    Data,
    /// BDAT chunk header (RFC 3030).
    Bdat {
        /// Chunk length in bytes.
        size: u64,
        /// Whether this is the final chunk.
        last: bool,
    },
    /// Reset transaction.
    Rset,
    /// No operation (keepalive).
    Noop,
    /// Quit connection.
    Quit,
    /// Verify address.
    Vrfy(String),
    /// Expand alias.
    Expn(String),
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth { mechanism, initial_response } => match initial_response {
                Some(response) if response.is_empty() => format!("AUTH {} =", mechanism),
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom { address, smtputf8, body, envelope_id, size } => {
                let mut cmd = format!("MAIL FROM:<{}>", address);
                if *smtputf8 {
                    cmd.push_str(" SMTPUTF8");
                }
                match body {
                    Some(BodyKind::EightBitMime) => cmd.push_str(" BODY=8BITMIME"),
                    Some(BodyKind::BinaryMime) => cmd.push_str(" BODY=BINARYMIME"),
                    None => {}
                }
                if let Some(id) = envelope_id {
                    cmd.push_str(&format!(" ENVID={}", id));
                }
                if let Some(n) = size {
                    cmd.push_str(&format!(" SIZE={}", n));
                }
                cmd
            }
            SmtpCommand::RcptTo { address, notify } => {
                let mut cmd = format!("RCPT TO:<{}>", address);
                if let Some(notify) = notify {
                    cmd.push_str(&format!(" NOTIFY={}", notify.param()));
                }
                cmd
            }
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Bdat { size, last } => {
                if *last {
                    format!("BDAT {} LAST", size)
                } else {
                    format!("BDAT {}", size)
                }
            }
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
            SmtpCommand::Vrfy(address) => format!("VRFY {}", address),
            SmtpCommand::Expn(alias) => format!("EXPN {}", alias),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_smtp_string())
    }
}

/// SMTP response from the server.
///
/// `code` is the numeric status from the first line; `text` joins the
/// payloads of continuation lines with a single `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Response text, continuation lines separated by `\n`.
    pub text: String,
}

impl SmtpResponse {
    /// Creates a new response.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    /// Iterates over the response lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n')
    }

    /// Returns the first response line.
    pub fn first_line(&self) -> &str {
        self.lines().next().unwrap_or("")
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Returns true if this is a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Returns true if this is a temporary failure (4xx).
    pub fn is_temporary_failure(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_line())
    }
}

/// ESMTP extensions advertised by the server, rebuilt from scratch on every
/// EHLO exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    /// SIZE advertised.
    pub size: bool,
    /// DSN advertised.
    pub dsn: bool,
    /// ENHANCEDSTATUSCODES advertised.
    pub enhanced_status_codes: bool,
    /// AUTH (or legacy X-EXPS) advertised.
    pub auth: bool,
    /// 8BITMIME advertised.
    pub eight_bit_mime: bool,
    /// PIPELINING advertised.
    pub pipelining: bool,
    /// BINARYMIME advertised.
    pub binary_mime: bool,
    /// CHUNKING advertised.
    pub chunking: bool,
    /// STARTTLS advertised.
    pub starttls: bool,
    /// SMTPUTF8 advertised.
    pub smtputf8: bool,
    /// Maximum message size from `SIZE n`; 0 if absent or unlimited.
    pub max_size: u32,
    /// SASL mechanism names, upper-cased.
    pub auth_mechanisms: HashSet<String>,
    /// Raw capability lines as received (greeting excluded).
    pub raw: Vec<String>,
}

impl ExtensionSet {
    /// Parses the capability lines of an EHLO response. The first line is
    /// the server greeting and carries no capability.
    pub fn from_ehlo(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();
        for line in response.lines().skip(1) {
            caps.parse_line(line);
        }
        caps
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.raw.push(line.to_string());

        // Many servers ship mixed case; capabilities are case-insensitive.
        let upper = line.to_uppercase();

        if let Some(mechanisms) = strip_auth_prefix(&upper, "AUTH")
            .or_else(|| strip_auth_prefix(&upper, "X-EXPS"))
        {
            self.auth = true;
            for name in mechanisms.split_whitespace() {
                self.auth_mechanisms.insert(name.to_string());
            }
            return;
        }

        let mut tokens = upper.split_whitespace();
        match tokens.next() {
            Some("SIZE") => {
                self.size = true;
                self.max_size = tokens.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            }
            Some("DSN") => self.dsn = true,
            Some("ENHANCEDSTATUSCODES") => self.enhanced_status_codes = true,
            Some("8BITMIME") => self.eight_bit_mime = true,
            Some("PIPELINING") => self.pipelining = true,
            Some("BINARYMIME") => self.binary_mime = true,
            Some("CHUNKING") => self.chunking = true,
            Some("STARTTLS") => self.starttls = true,
            Some("SMTPUTF8") => self.smtputf8 = true,
            _ => {}
        }
    }

    /// Returns true if the named SASL mechanism was advertised.
    pub fn supports_mechanism(&self, name: &str) -> bool {
        self.auth_mechanisms.contains(&name.to_uppercase())
    }
}

/// Splits the mechanism list off an `AUTH` / `X-EXPS` capability line. The
/// keyword must be followed by a space or `=`.
fn strip_auth_prefix<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    match rest.as_bytes().first() {
        Some(b' ') | Some(b'=') => Some(&rest[1..]),
        _ => None,
    }
}

/// Well-known SMTP status codes.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// User not local; will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Continue (AUTH challenge).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Mailbox unavailable (temporary).
    pub const MAILBOX_UNAVAILABLE_TEMP: u16 = 450;
    /// Local error.
    pub const LOCAL_ERROR: u16 = 451;
    /// Insufficient storage.
    pub const INSUFFICIENT_STORAGE: u16 = 452;
    /// Bad command sequence.
    pub const BAD_SEQUENCE: u16 = 503;
    /// Authentication required.
    pub const AUTH_REQUIRED: u16 = 530;
    /// Authentication mechanism too weak.
    pub const AUTH_TOO_WEAK: u16 = 534;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
    /// Invalid mailbox name.
    pub const INVALID_MAILBOX: u16 = 553;
}
