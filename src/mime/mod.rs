//! Message formatting for submission.
//!
//! The transaction engine only knows the [`MessageSource`] trait: prepare
//! the message for a body-encoding constraint, report what the content
//! needs, measure it, and write it out. [`FormattedEmail`] is the default
//! RFC 5322 formatter over [`Email`]; [`RawMessage`] submits
//! already-formatted bytes untouched.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpResult};
use crate::types::{Attachment, Email};

/// Body-encoding constraint derived from the server's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingConstraint {
    /// The server is 7-bit only; all content must be encoded down.
    SevenBit,
    /// The server accepts 8BITMIME bodies.
    EightBit,
    /// The server accepts BINARYMIME; no constraint applies.
    Unrestricted,
}

/// What the prepared message actually requires of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingRequirement {
    /// Pure 7-bit content.
    None,
    /// 8-bit content: MAIL FROM carries BODY=8BITMIME.
    EightBit,
    /// Binary content: requires BDAT and BODY=BINARYMIME.
    Binary,
}

/// A message the transaction engine can submit.
pub trait MessageSource {
    /// Prepares the message for the given constraint, selecting transfer
    /// encodings. Called once before any other method in a send.
    fn prepare(&mut self, constraint: EncodingConstraint) -> SmtpResult<()>;

    /// Reports the encoding the prepared content needs.
    fn visit_encoding(&self) -> EncodingRequirement;

    /// Exact byte length of the content [`write_to`](Self::write_to)
    /// produces, without materializing it.
    fn measure(&self) -> SmtpResult<u64>;

    /// Appends the formatted message to `out`.
    fn write_to(&self, out: &mut Vec<u8>) -> SmtpResult<()>;
}

/// Already-formatted RFC 5322 bytes, submitted as-is.
pub struct RawMessage<'a> {
    bytes: &'a [u8],
}

impl<'a> RawMessage<'a> {
    /// Wraps a formatted message.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl MessageSource for RawMessage<'_> {
    fn prepare(&mut self, _constraint: EncodingConstraint) -> SmtpResult<()> {
        Ok(())
    }

    fn visit_encoding(&self) -> EncodingRequirement {
        if self.bytes.contains(&0) {
            EncodingRequirement::Binary
        } else if self.bytes.iter().any(|&b| b >= 0x80) {
            EncodingRequirement::EightBit
        } else {
            EncodingRequirement::None
        }
    }

    fn measure(&self) -> SmtpResult<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn write_to(&self, out: &mut Vec<u8>) -> SmtpResult<()> {
        out.extend_from_slice(self.bytes);
        Ok(())
    }
}

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII (no encoding).
    SevenBit,
    /// 8-bit data.
    EightBit,
    /// Quoted-printable encoding.
    QuotedPrintable,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

/// Byte sink used so measuring and writing share one rendering pass.
trait Sink {
    fn put(&mut self, bytes: &[u8]);
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

struct ByteCounter(u64);

impl Sink for ByteCounter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len() as u64;
    }
}

/// Default RFC 5322 formatter.
///
/// Boundaries, the date stamp, and the message id are fixed at
/// construction so that [`measure`](MessageSource::measure) and
/// [`write_to`](MessageSource::write_to) always agree, which the BDAT path
/// depends on.
pub struct FormattedEmail {
    email: Email,
    date: DateTime<Utc>,
    message_id: String,
    alt_boundary: String,
    mixed_boundary: String,
    text_encoding: TransferEncoding,
    html_encoding: TransferEncoding,
}

impl FormattedEmail {
    /// Creates a formatter for `email`. `domain` scopes the generated
    /// Message-ID.
    pub fn new(email: Email, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        let date = Utc::now();
        let message_id = email
            .message_id
            .clone()
            .unwrap_or_else(|| format!("{}.{}@{}", Uuid::new_v4(), date.timestamp(), domain));
        let mut formatted = Self {
            email,
            date,
            message_id,
            alt_boundary: format!("----=_Part_{}", Uuid::new_v4().simple()),
            mixed_boundary: format!("----=_Part_{}", Uuid::new_v4().simple()),
            text_encoding: TransferEncoding::SevenBit,
            html_encoding: TransferEncoding::SevenBit,
        };
        formatted.select_encodings(EncodingConstraint::SevenBit);
        formatted
    }

    /// The Message-ID this formatter will emit.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    fn select_encodings(&mut self, constraint: EncodingConstraint) {
        self.text_encoding = Self::body_encoding(self.email.body_plain.as_deref(), constraint);
        self.html_encoding = Self::body_encoding(self.email.body_html.as_deref(), constraint);
    }

    fn body_encoding(body: Option<&str>, constraint: EncodingConstraint) -> TransferEncoding {
        let Some(body) = body else {
            return TransferEncoding::SevenBit;
        };
        if body.is_ascii() {
            TransferEncoding::SevenBit
        } else {
            match constraint {
                EncodingConstraint::SevenBit => TransferEncoding::QuotedPrintable,
                EncodingConstraint::EightBit | EncodingConstraint::Unrestricted => {
                    TransferEncoding::EightBit
                }
            }
        }
    }

    fn render(&self, out: &mut dyn Sink) -> SmtpResult<()> {
        let email = &self.email;

        write_header(out, "Date", &self.date.format("%a, %d %b %Y %H:%M:%S +0000").to_string())?;
        write_header(out, "From", &email.from.to_header())?;
        if !email.to.is_empty() {
            let list: Vec<String> = email.to.iter().map(|a| a.to_header()).collect();
            write_header(out, "To", &list.join(", "))?;
        }
        if !email.cc.is_empty() {
            let list: Vec<String> = email.cc.iter().map(|a| a.to_header()).collect();
            write_header(out, "Cc", &list.join(", "))?;
        }
        // Bcc recipients stay on the envelope and never reach the headers.
        if let Some(reply_to) = &email.reply_to {
            write_header(out, "Reply-To", &reply_to.to_header())?;
        }
        if let Some(subject) = &email.subject {
            write_header(out, "Subject", &encode_header_value(subject))?;
        }
        write_header(out, "Message-ID", &format!("<{}>", self.message_id))?;
        for (name, value) in &email.extra_headers {
            write_header(out, name, &encode_header_value(value))?;
        }
        write_header(out, "MIME-Version", "1.0")?;

        if email.attachments.is_empty() {
            self.render_body(out)?;
        } else {
            write_header(
                out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{}\"", self.mixed_boundary),
            )?;
            out.put(b"\r\n");
            out.put(format!("--{}\r\n", self.mixed_boundary).as_bytes());
            self.render_body(out)?;
            for attachment in &email.attachments {
                out.put(format!("--{}\r\n", self.mixed_boundary).as_bytes());
                render_attachment(out, attachment)?;
            }
            out.put(format!("--{}--\r\n", self.mixed_boundary).as_bytes());
        }

        Ok(())
    }

    fn render_body(&self, out: &mut dyn Sink) -> SmtpResult<()> {
        let email = &self.email;
        match (&email.body_plain, &email.body_html) {
            (Some(_), Some(_)) => {
                write_header(
                    out,
                    "Content-Type",
                    &format!("multipart/alternative; boundary=\"{}\"", self.alt_boundary),
                )?;
                out.put(b"\r\n");
                out.put(format!("--{}\r\n", self.alt_boundary).as_bytes());
                self.render_text_part(
                    out,
                    "text/plain",
                    email.body_plain.as_deref().unwrap_or(""),
                    self.text_encoding,
                )?;
                out.put(format!("--{}\r\n", self.alt_boundary).as_bytes());
                self.render_text_part(
                    out,
                    "text/html",
                    email.body_html.as_deref().unwrap_or(""),
                    self.html_encoding,
                )?;
                out.put(format!("--{}--\r\n", self.alt_boundary).as_bytes());
            }
            (None, Some(html)) => {
                self.render_text_part(out, "text/html", html, self.html_encoding)?;
            }
            (text, None) => {
                self.render_text_part(
                    out,
                    "text/plain",
                    text.as_deref().unwrap_or(""),
                    self.text_encoding,
                )?;
            }
        }
        Ok(())
    }

    fn render_text_part(
        &self,
        out: &mut dyn Sink,
        content_type: &str,
        body: &str,
        encoding: TransferEncoding,
    ) -> SmtpResult<()> {
        write_header(out, "Content-Type", &format!("{content_type}; charset=utf-8"))?;
        write_header(out, "Content-Transfer-Encoding", encoding.header_value())?;
        out.put(b"\r\n");
        match encoding {
            TransferEncoding::QuotedPrintable => {
                out.put(&quoted_printable::encode(body.as_bytes()));
            }
            _ => out.put(&normalize_crlf(body)),
        }
        out.put(b"\r\n");
        Ok(())
    }
}

impl MessageSource for FormattedEmail {
    fn prepare(&mut self, constraint: EncodingConstraint) -> SmtpResult<()> {
        self.select_encodings(constraint);
        Ok(())
    }

    fn visit_encoding(&self) -> EncodingRequirement {
        if self.text_encoding == TransferEncoding::EightBit
            || self.html_encoding == TransferEncoding::EightBit
        {
            EncodingRequirement::EightBit
        } else {
            EncodingRequirement::None
        }
    }

    fn measure(&self) -> SmtpResult<u64> {
        let mut counter = ByteCounter(0);
        self.render(&mut counter)?;
        Ok(counter.0)
    }

    fn write_to(&self, out: &mut Vec<u8>) -> SmtpResult<()> {
        self.render(out)
    }
}

fn render_attachment(out: &mut dyn Sink, attachment: &Attachment) -> SmtpResult<()> {
    write_header(
        out,
        "Content-Type",
        &format!("{}; name=\"{}\"", attachment.media_type, attachment.file_name),
    )?;
    write_header(out, "Content-Transfer-Encoding", TransferEncoding::Base64.header_value())?;
    write_header(
        out,
        "Content-Disposition",
        &format!("attachment; filename=\"{}\"", attachment.file_name),
    )?;
    out.put(b"\r\n");
    let encoded = BASE64.encode(&attachment.content);
    for chunk in encoded.as_bytes().chunks(76) {
        out.put(chunk);
        out.put(b"\r\n");
    }
    Ok(())
}

fn write_header(out: &mut dyn Sink, name: &str, value: &str) -> SmtpResult<()> {
    if name.chars().any(|c| c.is_control() || c == ':') {
        return Err(SmtpError::Configuration(format!("invalid header name: {name:?}")));
    }
    if value.contains(['\r', '\n']) {
        return Err(SmtpError::Configuration(format!("header {name} contains line breaks")));
    }
    out.put(fold_header(&format!("{name}: {value}")).as_bytes());
    out.put(b"\r\n");
    Ok(())
}

/// Folds a header line at 78 characters.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current_line = String::new();
    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= 76 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }
    result.push_str(&current_line);
    result
}

/// Encodes a header value using RFC 2047 when it is not plain ASCII.
fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }
    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

/// Rewrites bare LF line endings as CRLF.
fn normalize_crlf(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut prev = 0u8;
    for &byte in text.as_bytes() {
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        prev = byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Email;

    fn sample_email() -> Email {
        Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .subject("Test Subject")
            .text("Hello World!")
            .build()
            .unwrap()
    }

    #[test]
    fn test_simple_email_rendering() {
        let formatted = FormattedEmail::new(sample_email(), "example.com");
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        let content = String::from_utf8_lossy(&out);

        assert!(content.contains("From: sender@example.com"));
        assert!(content.contains("To: recipient@example.com"));
        assert!(content.contains("Subject: Test Subject"));
        assert!(content.contains("MIME-Version: 1.0"));
        assert!(content.contains("Message-ID: <"));
        assert!(content.contains("@example.com>"));
    }

    #[test]
    fn test_measure_matches_write() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .subject("Sized")
            .text("Some text body")
            .html("<p>Some html body</p>")
            .attachment(Attachment::new("a.bin", vec![1, 2, 3, 4]))
            .build()
            .unwrap();
        let formatted = FormattedEmail::new(email, "example.com");
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        assert_eq!(formatted.measure().unwrap(), out.len() as u64);
    }

    #[test]
    fn test_ascii_body_needs_no_extension() {
        let formatted = FormattedEmail::new(sample_email(), "example.com");
        assert_eq!(formatted.visit_encoding(), EncodingRequirement::None);
    }

    #[test]
    fn test_non_ascii_body_encoding_follows_constraint() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("Grüße aus Köln")
            .build()
            .unwrap();
        let mut formatted = FormattedEmail::new(email, "example.com");

        // Default preparation is 7-bit safe.
        assert_eq!(formatted.visit_encoding(), EncodingRequirement::None);
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        assert!(String::from_utf8_lossy(&out).contains("quoted-printable"));

        formatted.prepare(EncodingConstraint::EightBit).unwrap();
        assert_eq!(formatted.visit_encoding(), EncodingRequirement::EightBit);
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        let content = String::from_utf8_lossy(&out);
        assert!(content.contains("Content-Transfer-Encoding: 8bit"));
        assert!(content.contains("Grüße aus Köln"));
    }

    #[test]
    fn test_text_and_html_use_multipart_alternative() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("plain")
            .html("<b>rich</b>")
            .build()
            .unwrap();
        let formatted = FormattedEmail::new(email, "example.com");
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        let content = String::from_utf8_lossy(&out);
        assert!(content.contains("multipart/alternative"));
        assert!(content.contains("text/plain"));
        assert!(content.contains("text/html"));
    }

    #[test]
    fn test_attachments_use_multipart_mixed_and_base64() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("see attachment")
            .attachment(Attachment::new("hello.txt", b"Hello, World!".to_vec()))
            .build()
            .unwrap();
        let formatted = FormattedEmail::new(email, "example.com");
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        let content = String::from_utf8_lossy(&out);
        assert!(content.contains("multipart/mixed"));
        assert!(content.contains("Content-Disposition: attachment; filename=\"hello.txt\""));
        assert!(content.contains(&BASE64.encode(b"Hello, World!")));
    }

    #[test]
    fn test_bcc_never_appears_in_headers() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .bcc("hidden@example.com")
            .text("body")
            .build()
            .unwrap();
        let formatted = FormattedEmail::new(email, "example.com");
        let mut out = Vec::new();
        formatted.write_to(&mut out).unwrap();
        assert!(!String::from_utf8_lossy(&out).contains("hidden@example.com"));
    }

    #[test]
    fn test_header_value_injection_rejected() {
        let email = Email::builder()
            .from("sender@example.com")
            .to("recipient@example.com")
            .header("X-Custom", "evil\r\nInjected: yes")
            .text("body")
            .build()
            .unwrap();
        let formatted = FormattedEmail::new(email, "example.com");
        let mut out = Vec::new();
        assert!(formatted.write_to(&mut out).is_err());
    }

    #[test]
    fn test_non_ascii_subject_is_rfc2047_encoded() {
        assert_eq!(encode_header_value("Hello"), "Hello");
        let encoded = encode_header_value("Héllo");
        assert!(encoded.starts_with("=?UTF-8?B?"));
    }

    #[test]
    fn test_raw_message_classification() {
        assert_eq!(RawMessage::new(b"plain ascii").visit_encoding(), EncodingRequirement::None);
        assert_eq!(
            RawMessage::new("höher".as_bytes()).visit_encoding(),
            EncodingRequirement::EightBit
        );
        assert_eq!(
            RawMessage::new(b"nul\0byte").visit_encoding(),
            EncodingRequirement::Binary
        );
    }

    #[test]
    fn test_normalize_crlf() {
        assert_eq!(normalize_crlf("a\nb"), b"a\r\nb");
        assert_eq!(normalize_crlf("a\r\nb"), b"a\r\nb");
        assert_eq!(normalize_crlf("a"), b"a");
    }

    #[test]
    fn test_fold_long_header() {
        let value = "word ".repeat(30);
        let folded = fold_header(&format!("X-Long: {value}"));
        for line in folded.split("\r\n") {
            assert!(line.len() <= 78);
        }
    }
}
