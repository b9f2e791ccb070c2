//! Core types for the SMTP client.
//!
//! Mailbox addresses split into local part and domain, the message
//! envelope, per-send options (DSN, internationalization), progress
//! reporting, and the email message consumed by the default formatter.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{SmtpError, SmtpResult};

/// Mailbox address, kept as its local part and domain, with an optional
/// display name for headers.
///
/// Validation follows what the client itself puts on the wire: the address
/// is rendered inside `MAIL FROM:<...>` / `RCPT TO:<...>` on a
/// CRLF-delimited command line, so anything that would break the line or
/// the bracket framing is rejected up front. Non-ASCII parts are allowed
/// and go out raw when SMTPUTF8 is in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    display_name: Option<String>,
    local_part: String,
    domain: String,
}

impl Address {
    /// Creates an address from a `local@domain` mailbox string.
    pub fn new(mailbox: impl AsRef<str>) -> SmtpResult<Self> {
        let mailbox = mailbox.as_ref();
        // The split is on the last @: quoted local parts may contain one.
        let Some((local_part, domain)) = mailbox.rsplit_once('@') else {
            return Err(SmtpError::InvalidAddress(format!("missing @ in {mailbox:?}")));
        };
        Self::from_parts(local_part, domain)
    }

    /// Creates an address from its local part and domain.
    pub fn from_parts(local_part: impl Into<String>, domain: impl Into<String>) -> SmtpResult<Self> {
        let local_part = local_part.into();
        let domain = domain.into();
        validate_segment(&local_part, "local part")?;
        validate_segment(&domain, "domain")?;
        Ok(Self { display_name: None, local_part, domain })
    }

    /// Attaches a display name (used in headers, never on the envelope).
    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Parses `Some Name <user@domain>`, `<user@domain>`, or a bare
    /// `user@domain`.
    pub fn parse(input: &str) -> SmtpResult<Self> {
        let input = input.trim();
        match (input.find('<'), input.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let address = Self::new(input[open + 1..close].trim())?;
                let name = input[..open].trim().trim_matches('"').trim();
                Ok(if name.is_empty() { address } else { address.named(name) })
            }
            (Some(_), _) => Err(SmtpError::InvalidAddress(format!(
                "unbalanced angle brackets in {input:?}"
            ))),
            _ => Self::new(input),
        }
    }

    /// The part before the @.
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The part after the @.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The display name, if one is attached.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// The bare `local@domain` form, as rendered on the envelope.
    pub fn email(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }

    /// Returns true if the address can be sent without SMTPUTF8.
    pub fn is_ascii(&self) -> bool {
        self.local_part.is_ascii() && self.domain.is_ascii()
    }

    /// Key used to deduplicate recipients: case-insensitive on the address
    /// literal, without Unicode canonicalization.
    pub fn dedup_key(&self) -> String {
        self.email().to_lowercase()
    }

    /// Formats the address for message headers, quoting the display name
    /// when it steps outside atom text.
    pub fn to_header(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                if name.chars().all(is_atom_char_or_space) {
                    format!("{} <{}>", name, self.email())
                } else {
                    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", escaped, self.email())
                }
            }
            _ => self.email(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl FromStr for Address {
    type Err = SmtpError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Address::parse(input)
    }
}

/// RFC 5322 atom characters, plus the space separating words of a name.
fn is_atom_char_or_space(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || "!#$%&'*+-/=?^_`{|}~".contains(c)
}

/// A mailbox segment travels inside the angle brackets of an envelope
/// command; reject anything that would break the line or the framing.
fn validate_segment(segment: &str, what: &str) -> SmtpResult<()> {
    if segment.is_empty() {
        return Err(SmtpError::InvalidAddress(format!("{what} cannot be empty")));
    }
    if segment
        .chars()
        .any(|c| c.is_control() || c == ' ' || c == '<' || c == '>')
    {
        return Err(SmtpError::InvalidAddress(format!(
            "{what} contains characters that cannot appear in an envelope address"
        )));
    }
    Ok(())
}

/// Message envelope: the sender and recipients used on the wire, distinct
/// from whatever the message headers claim.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// MAIL FROM sender.
    pub from: Address,
    /// RCPT TO recipients.
    pub to: Vec<Address>,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(from: Address, to: Vec<Address>) -> Self {
        Self { from, to }
    }
}

/// DSN NOTIFY parameter for a recipient (RFC 3461). `Never` excludes the
/// event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnNotify {
    /// NOTIFY=NEVER: suppress all delivery status notifications.
    Never,
    /// Notify on the selected delivery events.
    On {
        /// Notify on successful delivery.
        success: bool,
        /// Notify on delivery failure.
        failure: bool,
        /// Notify on delivery delay.
        delay: bool,
    },
}

impl DsnNotify {
    /// Event-based notification. Selecting no event renders as NEVER.
    pub fn on(success: bool, failure: bool, delay: bool) -> Self {
        DsnNotify::On { success, failure, delay }
    }

    /// Renders the NOTIFY parameter value.
    pub fn param(&self) -> String {
        match self {
            DsnNotify::Never => "NEVER".to_string(),
            DsnNotify::On { success, failure, delay } => {
                let mut events = Vec::new();
                if *success {
                    events.push("SUCCESS");
                }
                if *failure {
                    events.push("FAILURE");
                }
                if *delay {
                    events.push("DELAY");
                }
                if events.is_empty() {
                    "NEVER".to_string()
                } else {
                    events.join(",")
                }
            }
        }
    }
}

/// Per-send options: DSN parameters and internationalized address handling.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Request SMTPUTF8 so mailbox addresses are sent raw. Silently
    /// disabled when the server does not advertise SMTPUTF8.
    pub international: bool,
    /// DSN envelope identifier (`ENVID`) attached to MAIL FROM.
    pub envelope_id: Option<String>,
    /// Per-recipient NOTIFY parameters, keyed by the lowercased address.
    pub notify: HashMap<String, DsnNotify>,
}

impl SendOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests internationalized (SMTPUTF8) addressing.
    pub fn international(mut self) -> Self {
        self.international = true;
        self
    }

    /// Sets the DSN envelope identifier.
    pub fn envelope_id(mut self, id: impl Into<String>) -> Self {
        self.envelope_id = Some(id.into());
        self
    }

    /// Sets the NOTIFY parameter for one recipient.
    pub fn notify(mut self, recipient: &Address, notify: DsnNotify) -> Self {
        self.notify.insert(recipient.dedup_key(), notify);
        self
    }

    /// Looks up the NOTIFY parameter for a recipient.
    pub fn notify_for(&self, recipient: &Address) -> Option<DsnNotify> {
        self.notify.get(&recipient.dedup_key()).copied()
    }
}

/// Receives transfer progress while a message body is streamed.
pub trait ProgressSink: Send {
    /// Reports bytes transferred so far, with the total when known.
    fn report(&mut self, transferred: u64, total: Option<u64>);
}

impl<F: FnMut(u64, Option<u64>) + Send> ProgressSink for F {
    fn report(&mut self, transferred: u64, total: Option<u64>) {
        self(transferred, total)
    }
}

/// Connection facts reported by a probe.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Whether the connection is TLS-protected.
    pub secure: bool,
    /// Server greeting text.
    pub banner: String,
    /// Raw capability lines from the last EHLO.
    pub capabilities: Vec<String>,
}

/// File attachment for the default formatter.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub file_name: String,
    /// MIME media type.
    pub media_type: String,
    /// Raw content bytes.
    pub content: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment, guessing the media type from the file name
    /// extension.
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let media_type = mime_guess::from_path(&file_name)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        Self { file_name, media_type, content }
    }

    /// Overrides the guessed media type.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }
}

/// Email message for the default MIME formatter.
///
/// The wire envelope is to + cc + bcc; bcc recipients never appear in the
/// rendered headers.
#[derive(Debug, Clone)]
pub struct Email {
    /// Sender.
    pub from: Address,
    /// To recipients.
    pub to: Vec<Address>,
    /// Cc recipients.
    pub cc: Vec<Address>,
    /// Bcc recipients (envelope only).
    pub bcc: Vec<Address>,
    /// Reply-To address.
    pub reply_to: Option<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Plain text body.
    pub body_plain: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Extra headers appended after the standard set.
    pub extra_headers: Vec<(String, String)>,
    /// Message-ID; generated when absent.
    pub message_id: Option<String>,
}

impl Email {
    /// Creates a builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// All envelope recipients: to + cc + bcc.
    pub fn all_recipients(&self) -> Vec<Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .cloned()
            .collect()
    }

    /// Builds the wire envelope for this message.
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.from.clone(), self.all_recipients())
    }
}

/// Builder for [`Email`].
///
/// Mailbox arguments are parsed as they are added; the first invalid one
/// is remembered and surfaced by [`build`](Self::build), so the chain
/// itself stays fluent.
#[derive(Debug, Default)]
pub struct EmailBuilder {
    from: Option<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    reply_to: Option<Address>,
    subject: Option<String>,
    body_plain: Option<String>,
    body_html: Option<String>,
    attachments: Vec<Attachment>,
    extra_headers: Vec<(String, String)>,
    message_id: Option<String>,
    invalid: Option<SmtpError>,
}

impl EmailBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&mut self, input: &str) -> Option<Address> {
        match Address::parse(input) {
            Ok(address) => Some(address),
            Err(e) => {
                if self.invalid.is_none() {
                    self.invalid = Some(e);
                }
                None
            }
        }
    }

    /// Sets the sender.
    pub fn from(mut self, mailbox: &str) -> Self {
        self.from = self.mailbox(mailbox);
        self
    }

    /// Adds a To recipient.
    pub fn to(mut self, mailbox: &str) -> Self {
        if let Some(address) = self.mailbox(mailbox) {
            self.to.push(address);
        }
        self
    }

    /// Adds a Cc recipient.
    pub fn cc(mut self, mailbox: &str) -> Self {
        if let Some(address) = self.mailbox(mailbox) {
            self.cc.push(address);
        }
        self
    }

    /// Adds a Bcc recipient.
    pub fn bcc(mut self, mailbox: &str) -> Self {
        if let Some(address) = self.mailbox(mailbox) {
            self.bcc.push(address);
        }
        self
    }

    /// Sets the Reply-To address.
    pub fn reply_to(mut self, mailbox: &str) -> Self {
        self.reply_to = self.mailbox(mailbox);
        self
    }

    /// Sets the subject line.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body_plain = Some(body.into());
        self
    }

    /// Sets the HTML body.
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.body_html = Some(body.into());
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Sets an explicit Message-ID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Builds the email, surfacing the first invalid mailbox if any was
    /// added along the way.
    pub fn build(self) -> SmtpResult<Email> {
        if let Some(invalid) = self.invalid {
            return Err(invalid);
        }
        let from = self
            .from
            .ok_or_else(|| SmtpError::Configuration("sender is required".to_string()))?;
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(SmtpError::Configuration(
                "at least one recipient is required".to_string(),
            ));
        }
        Ok(Email {
            from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            subject: self.subject,
            body_plain: self.body_plain,
            body_html: self.body_html,
            attachments: self.attachments,
            extra_headers: self.extra_headers,
            message_id: self.message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_parts() {
        let addr = Address::from_parts("john", "example.com").unwrap();
        assert_eq!(addr.local_part(), "john");
        assert_eq!(addr.domain(), "example.com");
        assert_eq!(addr.email(), "john@example.com");
        assert_eq!(addr.display_name(), None);
    }

    #[test]
    fn test_address_parse_forms() {
        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.display_name(), Some("John Doe"));
        assert_eq!(addr.email(), "john@example.com");

        let addr = Address::parse("jane@example.com").unwrap();
        assert_eq!(addr.display_name(), None);
        assert_eq!(addr.email(), "jane@example.com");

        let addr = Address::parse(" <bare@example.com> ").unwrap();
        assert_eq!(addr.display_name(), None);
        assert_eq!(addr.email(), "bare@example.com");

        let addr: Address = "K. <kayo@example.com>".parse().unwrap();
        assert_eq!(addr.display_name(), Some("K."));
    }

    #[test]
    fn test_address_parse_unbalanced_brackets() {
        assert!(Address::parse("Broken <broken@example.com").is_err());
    }

    #[test]
    fn test_address_split_is_on_the_last_at() {
        let addr = Address::new("odd@local@example.com").unwrap();
        assert_eq!(addr.local_part(), "odd@local");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn test_address_rejects_what_the_wire_cannot_carry() {
        assert!(Address::new("").is_err());
        assert!(Address::new("no-at-sign").is_err());
        assert!(Address::new("user@").is_err());
        assert!(Address::new("@example.com").is_err());
        assert!(Address::new("line\r\nbreak@example.com").is_err());
        assert!(Address::new("user@exa mple.com").is_err());
        assert!(Address::new("user<@example.com").is_err());
        assert!(Address::new("user@ex>ample.com").is_err());
    }

    #[test]
    fn test_address_dedup_key_is_case_insensitive() {
        let a = Address::new("User@Example.COM").unwrap();
        let b = Address::new("user@example.com").unwrap();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_address_ascii_detection() {
        assert!(Address::new("user@example.com").unwrap().is_ascii());
        assert!(!Address::new("björn@example.com").unwrap().is_ascii());
        assert!(!Address::new("user@exämple.com").unwrap().is_ascii());
    }

    #[test]
    fn test_address_header_rendering() {
        let plain = Address::new("a@b.example").unwrap();
        assert_eq!(plain.to_header(), "a@b.example");

        let named = Address::new("a@b.example").unwrap().named("Ann Example");
        assert_eq!(named.to_header(), "Ann Example <a@b.example>");

        let punctuated = Address::new("a@b.example").unwrap().named("Ann, PhD");
        assert_eq!(punctuated.to_header(), "\"Ann, PhD\" <a@b.example>");

        let quoted = Address::new("a@b.example").unwrap().named("Ann \"Fixer\"");
        assert_eq!(quoted.to_header(), "\"Ann \\\"Fixer\\\"\" <a@b.example>");

        let blank = Address::new("a@b.example").unwrap().named("   ");
        assert_eq!(blank.to_header(), "a@b.example");
    }

    #[test]
    fn test_dsn_notify_rendering() {
        assert_eq!(DsnNotify::Never.param(), "NEVER");
        assert_eq!(DsnNotify::on(true, false, false).param(), "SUCCESS");
        assert_eq!(DsnNotify::on(true, true, true).param(), "SUCCESS,FAILURE,DELAY");
        assert_eq!(DsnNotify::on(false, false, false).param(), "NEVER");
    }

    #[test]
    fn test_send_options_notify_lookup() {
        let rcpt = Address::new("User@Example.com").unwrap();
        let options = SendOptions::new().notify(&rcpt, DsnNotify::on(false, true, false));
        let same = Address::new("user@example.com").unwrap();
        assert_eq!(options.notify_for(&same), Some(DsnNotify::on(false, true, false)));
    }

    #[test]
    fn test_attachment_media_type_guessing() {
        let attachment = Attachment::new("notes.txt", b"hi".to_vec());
        assert_eq!(attachment.media_type, "text/plain");

        let attachment = Attachment::new("blob.unknownext", Vec::new());
        assert_eq!(attachment.media_type, "application/octet-stream");

        let attachment = Attachment::new("data.bin", Vec::new()).with_media_type("application/x-custom");
        assert_eq!(attachment.media_type, "application/x-custom");
    }

    #[test]
    fn test_email_builder() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("a@example.com")
            .cc("b@example.com")
            .bcc("c@example.com")
            .subject("Hello")
            .text("Body")
            .build()
            .unwrap();
        assert_eq!(email.all_recipients().len(), 3);
        let envelope = email.envelope();
        assert_eq!(envelope.from.email(), "sender@example.com");
        assert_eq!(envelope.to.len(), 3);
    }

    #[test]
    fn test_email_builder_defers_invalid_mailboxes_to_build() {
        let result = Email::builder()
            .from("not-a-mailbox")
            .to("a@example.com")
            .subject("bad sender")
            .build();
        assert!(matches!(result, Err(SmtpError::InvalidAddress(_))));
    }

    #[test]
    fn test_email_builder_requires_sender_and_recipient() {
        assert!(Email::builder().to("a@example.com").build().is_err());
        assert!(Email::builder()
            .from("sender@example.com")
            .subject("empty")
            .build()
            .is_err());
    }
}
