//! Transport layer: the framing stream and TLS upgrades.
//!
//! [`SmtpStream`] translates SMTP's line-based protocol into response
//! objects and buffered outbound commands. It owns a fixed input buffer
//! with read-ahead and a block-sized output buffer that queues commands
//! until an explicit flush, which is what makes PIPELINING batch writes
//! into a single segment.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TlsOptions;
use crate::errors::{SmtpError, SmtpResult};
use crate::observability::ProtocolLogger;
use crate::protocol::SmtpResponse;

pub mod stuffing;

/// Block size for both the output buffer and bounded reads.
pub const BLOCK_SIZE: usize = 4096;

/// Input buffer capacity: one block plus a small pad so a response line
/// straddling a block boundary still fits after compaction.
const INPUT_CAPACITY: usize = BLOCK_SIZE + 128;

/// A stream that is either plain or TLS-wrapped.
pub enum MaybeTlsStream<S> {
    /// Plain byte stream.
    Plain(S),
    /// TLS-wrapped stream.
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<S>>),
}

impl<S> MaybeTlsStream<S> {
    /// Returns true for the TLS variant.
    pub fn is_tls(&self) -> bool {
        match self {
            MaybeTlsStream::Plain(_) => false,
            #[cfg(feature = "rustls-tls")]
            MaybeTlsStream::Tls(_) => true,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            MaybeTlsStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            MaybeTlsStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            MaybeTlsStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            MaybeTlsStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Upgrades a byte stream to TLS for a given server name.
///
/// Certificate policy lives behind this trait; the protocol core never
/// inspects certificates itself.
#[async_trait]
pub trait TlsUpgrader<S>: Send + Sync {
    /// Wraps `stream` in TLS, verifying against `host` (or the configured
    /// SNI override).
    async fn upgrade(
        &self,
        stream: S,
        host: &str,
        options: &TlsOptions,
    ) -> SmtpResult<MaybeTlsStream<S>>;
}

/// rustls-backed upgrader using the webpki root store plus any configured
/// CA bundle.
#[cfg(feature = "rustls-tls")]
#[derive(Debug, Default)]
pub struct RustlsUpgrader;

#[cfg(feature = "rustls-tls")]
#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> TlsUpgrader<S> for RustlsUpgrader {
    async fn upgrade(
        &self,
        stream: S,
        host: &str,
        options: &TlsOptions,
    ) -> SmtpResult<MaybeTlsStream<S>> {
        let config = tls::build_client_config(options)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let sni = options.sni_override.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|_| SmtpError::Tls(format!("invalid server name: {sni}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SmtpError::Tls(format!("TLS handshake failed: {e}")))?;

        Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
    }
}

#[cfg(feature = "rustls-tls")]
mod tls {
    use super::*;
    use crate::config::TlsVersion;

    pub(super) fn build_client_config(options: &TlsOptions) -> SmtpResult<rustls::ClientConfig> {
        let versions: &[&rustls::SupportedProtocolVersion] = match options.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };
        let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);

        if !options.verify_certificate {
            let verifier = Arc::new(danger::NoVerification::new());
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth());
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &options.ca_bundle_path {
            let pem = std::fs::read(path)
                .map_err(|e| SmtpError::Tls(format!("cannot read CA bundle: {e}")))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| SmtpError::Tls(format!("invalid CA bundle: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| SmtpError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }

        Ok(builder.with_root_certificates(roots).with_no_client_auth())
    }

    mod danger {
        use rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use rustls::{DigitallySignedStruct, SignatureScheme};

        /// Accepts any server certificate. Only reachable when certificate
        /// verification was explicitly disabled in the TLS options.
        #[derive(Debug)]
        pub(crate) struct NoVerification(CryptoProvider);

        impl NoVerification {
            pub(crate) fn new() -> Self {
                Self(rustls::crypto::ring::default_provider())
            }
        }

        impl ServerCertVerifier for NoVerification {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
            }

            fn verify_tls13_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                self.0.signature_verification_algorithms.supported_schemes()
            }
        }
    }
}

/// Line-buffered duplex layer over a byte stream.
///
/// Owns the stream and both buffers for the lifetime of a connection.
/// Reads respect the configured timeout and the cancellation token; a
/// cancelled or failed operation leaves the connection forfeit and the
/// caller discards the stream.
pub struct SmtpStream<S> {
    stream: S,
    /// Input buffer; one slot past the live region holds a `\n` sentinel
    /// so the line scan never runs off the end.
    input: Box<[u8]>,
    start: usize,
    end: usize,
    output: Box<[u8]>,
    out_len: usize,
    last_response: Option<SmtpResponse>,
    timeout: Duration,
    cancel: CancellationToken,
    logger: Arc<dyn ProtocolLogger>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpStream<S> {
    /// Creates a framing stream over `stream`.
    pub fn new(
        stream: S,
        io_timeout: Duration,
        cancel: CancellationToken,
        logger: Arc<dyn ProtocolLogger>,
    ) -> Self {
        let mut input = vec![0u8; INPUT_CAPACITY + 1].into_boxed_slice();
        input[0] = b'\n';
        Self {
            stream,
            input,
            start: 0,
            end: 0,
            output: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            out_len: 0,
            last_response: None,
            timeout: io_timeout,
            cancel,
            logger,
        }
    }

    /// Consumes the framing stream, returning the underlying stream.
    /// Buffered state is discarded; used for in-place TLS upgrades.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// The last response successfully read on this connection.
    pub fn last_response(&self) -> Option<&SmtpResponse> {
        self.last_response.as_ref()
    }

    /// Reads one complete (possibly multi-line) SMTP response.
    pub async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let mut code: Option<u16> = None;
        let mut text = String::new();
        let mut first = true;

        loop {
            let line = self.read_line().await?;
            let parsed = match parse_response_line(&line) {
                Ok(parsed) => parsed,
                Err(details) => {
                    return Err(SmtpError::ProtocolParse {
                        details,
                        last_response: self.last_response.clone(),
                    });
                }
            };

            match code {
                None => code = Some(parsed.code),
                Some(expected) if parsed.code != expected => {
                    return Err(SmtpError::ProtocolParse {
                        details: format!(
                            "continuation line code {} does not match {}",
                            parsed.code, expected
                        ),
                        last_response: self.last_response.clone(),
                    });
                }
                Some(_) => {}
            }

            if !first {
                text.push('\n');
            }
            first = false;
            text.push_str(&decode_response_text(parsed.payload));

            if !parsed.continuation {
                break;
            }
        }

        let response = SmtpResponse {
            // A response has at least one line, so the code is always set.
            code: code.unwrap_or_default(),
            text,
        };
        self.last_response = Some(response.clone());
        Ok(response)
    }

    /// Appends bytes to the output buffer. An overflowing append flushes
    /// the buffer first; bytes larger than a block bypass the buffer and
    /// go to the stream in block-sized chunks.
    pub async fn queue(&mut self, bytes: &[u8]) -> SmtpResult<()> {
        if self.out_len + bytes.len() > BLOCK_SIZE {
            self.flush().await?;
            if bytes.len() > BLOCK_SIZE {
                self.logger.log_client(bytes);
                for chunk in bytes.chunks(BLOCK_SIZE) {
                    write_all(&mut self.stream, &self.cancel, self.timeout, chunk).await?;
                }
                return Ok(());
            }
        }
        self.output[self.out_len..self.out_len + bytes.len()].copy_from_slice(bytes);
        self.out_len += bytes.len();
        Ok(())
    }

    /// Queues a command line, appending the CRLF terminator.
    pub async fn queue_line(&mut self, line: &str) -> SmtpResult<()> {
        self.queue(line.as_bytes()).await?;
        self.queue(b"\r\n").await
    }

    /// Writes the full output buffer and flushes the underlying stream.
    /// The buffer is cleared before writing, so an error never leaves
    /// stale queued bytes behind.
    pub async fn flush(&mut self) -> SmtpResult<()> {
        let len = self.out_len;
        self.out_len = 0;
        if len > 0 {
            self.logger.log_client(&self.output[..len]);
            write_all(&mut self.stream, &self.cancel, self.timeout, &self.output[..len]).await?;
        }
        flush_stream(&mut self.stream, &self.cancel, self.timeout).await
    }

    /// Queues a line, flushes, and reads the response. The synchronous
    /// path used when PIPELINING is off.
    pub async fn send_command(&mut self, line: &str) -> SmtpResult<SmtpResponse> {
        self.queue_line(line).await?;
        self.flush().await?;
        self.read_response().await
    }

    /// Reads one line, stripping the CRLF (or bare LF) terminator.
    async fn read_line(&mut self) -> SmtpResult<Vec<u8>> {
        loop {
            // Sentinel-bounded scan: input[end] is always b'\n'.
            let mut i = self.start;
            while self.input[i] != b'\n' {
                i += 1;
            }
            if i < self.end {
                let raw_start = self.start;
                self.start = i + 1;
                self.logger.log_server(&self.input[raw_start..self.start]);
                let mut line = &self.input[raw_start..i];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                return Ok(line.to_vec());
            }
            self.fill().await?;
        }
    }

    /// Compacts unconsumed bytes to the buffer start and issues one
    /// bounded read.
    async fn fill(&mut self) -> SmtpResult<()> {
        if self.start > 0 {
            self.input.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
            self.input[self.end] = b'\n';
        }

        let limit = INPUT_CAPACITY.min(self.end + BLOCK_SIZE);
        if self.end >= limit {
            return Err(SmtpError::ProtocolParse {
                details: "response line exceeds the input buffer".to_string(),
                last_response: self.last_response.clone(),
            });
        }

        let n = read_some(
            &mut self.stream,
            &self.cancel,
            self.timeout,
            &mut self.input[self.end..limit],
        )
        .await?;
        if n == 0 {
            return Err(SmtpError::UnexpectedDisconnect {
                last_response: self.last_response.clone(),
            });
        }
        self.end += n;
        self.input[self.end] = b'\n';
        Ok(())
    }
}

async fn read_some<S: AsyncRead + Unpin>(
    stream: &mut S,
    cancel: &CancellationToken,
    io_timeout: Duration,
    buf: &mut [u8],
) -> SmtpResult<usize> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SmtpError::Cancelled),
        result = timeout(io_timeout, stream.read(buf)) => match result {
            Err(_) => Err(SmtpError::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))),
            Ok(Err(e)) => Err(SmtpError::Io(e)),
            Ok(Ok(n)) => Ok(n),
        },
    }
}

async fn write_all<S: AsyncWrite + Unpin>(
    stream: &mut S,
    cancel: &CancellationToken,
    io_timeout: Duration,
    data: &[u8],
) -> SmtpResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SmtpError::Cancelled),
        result = timeout(io_timeout, stream.write_all(data)) => match result {
            Err(_) => Err(SmtpError::Io(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))),
            Ok(Err(e)) => Err(SmtpError::Io(e)),
            Ok(Ok(())) => Ok(()),
        },
    }
}

async fn flush_stream<S: AsyncWrite + Unpin>(
    stream: &mut S,
    cancel: &CancellationToken,
    io_timeout: Duration,
) -> SmtpResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SmtpError::Cancelled),
        result = timeout(io_timeout, stream.flush()) => match result {
            Err(_) => Err(SmtpError::Io(io::Error::new(io::ErrorKind::TimedOut, "flush timed out"))),
            Ok(Err(e)) => Err(SmtpError::Io(e)),
            Ok(Ok(())) => Ok(()),
        },
    }
}

struct ParsedLine<'a> {
    code: u16,
    continuation: bool,
    payload: &'a [u8],
}

/// Parses one response line (terminator already stripped): three ASCII
/// digits, then `-` for a continuation, a space before the text, or
/// nothing at all for a terminator-only line.
fn parse_response_line(line: &[u8]) -> Result<ParsedLine<'_>, String> {
    if line.len() < 3 {
        return Err(format!(
            "response line too short: {:?}",
            String::from_utf8_lossy(line)
        ));
    }
    let digits = &line[..3];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(format!(
            "invalid status code in {:?}",
            String::from_utf8_lossy(line)
        ));
    }
    let code = digits.iter().fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));
    if code < 100 {
        return Err(format!("status code {code} out of range"));
    }

    match line.get(3) {
        None => Ok(ParsedLine { code, continuation: false, payload: &[] }),
        Some(b' ') => Ok(ParsedLine { code, continuation: false, payload: &line[4..] }),
        Some(b'-') => Ok(ParsedLine { code, continuation: true, payload: &line[4..] }),
        // A stray CR after the digits still terminates the line.
        Some(b'\r') => Ok(ParsedLine { code, continuation: false, payload: &[] }),
        Some(&other) => Err(format!(
            "unexpected byte {:?} after status code {code}",
            other as char
        )),
    }
}

/// Decodes response text as UTF-8, falling back to ISO-8859-1 so a
/// misbehaving server can never make response parsing fail on encoding.
fn decode_response_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedStream;
    use crate::observability::NullProtocolLogger;

    fn stream_over(server_bytes: &[u8]) -> SmtpStream<ScriptedStream> {
        SmtpStream::new(
            ScriptedStream::with_input(server_bytes),
            Duration::from_secs(5),
            CancellationToken::new(),
            Arc::new(NullProtocolLogger),
        )
    }

    #[tokio::test]
    async fn test_single_line_response() {
        let mut stream = stream_over(b"250 OK\r\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.text, "OK");
    }

    #[tokio::test]
    async fn test_code_and_space_with_no_text() {
        let mut stream = stream_over(b"250 \r\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.text, "");
    }

    #[tokio::test]
    async fn test_terminator_only_line() {
        let mut stream = stream_over(b"250\r\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.text, "");
    }

    #[tokio::test]
    async fn test_multiline_response_joined_with_newline() {
        let mut stream = stream_over(b"250-A\r\n250 B\r\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.text, "A\nB");
    }

    #[tokio::test]
    async fn test_mismatched_continuation_code_is_protocol_error() {
        let mut stream = stream_over(b"250-A\r\n251 B\r\n");
        match stream.read_response().await {
            Err(SmtpError::ProtocolParse { .. }) => {}
            other => panic!("expected ProtocolParse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bare_lf_terminates_a_line() {
        let mut stream = stream_over(b"250-A\n250 B\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.text, "A\nB");
    }

    #[tokio::test]
    async fn test_non_digit_code_is_protocol_error() {
        let mut stream = stream_over(b"2x0 hello\r\n");
        assert!(matches!(
            stream.read_response().await,
            Err(SmtpError::ProtocolParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_code_below_100_is_protocol_error() {
        let mut stream = stream_over(b"099 hello\r\n");
        assert!(matches!(
            stream.read_response().await,
            Err(SmtpError::ProtocolParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_unexpected_separator_is_protocol_error() {
        let mut stream = stream_over(b"250+hello\r\n");
        assert!(matches!(
            stream.read_response().await,
            Err(SmtpError::ProtocolParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_response_is_unexpected_disconnect() {
        let mut stream = stream_over(b"220 he");
        match stream.read_response().await {
            Err(SmtpError::UnexpectedDisconnect { last_response }) => {
                assert!(last_response.is_none());
            }
            other => panic!("expected UnexpectedDisconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_carries_last_response() {
        let mut stream = stream_over(b"220 hello\r\n250 par");
        let greeting = stream.read_response().await.unwrap();
        assert_eq!(greeting.code, 220);
        match stream.read_response().await {
            Err(SmtpError::UnexpectedDisconnect { last_response }) => {
                assert_eq!(last_response.unwrap().code, 220);
            }
            other => panic!("expected UnexpectedDisconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_latin1_fallback_never_fails() {
        // 0xE9 is é in ISO-8859-1 but is not valid UTF-8 on its own.
        let mut stream = stream_over(b"250 caf\xE9\r\n");
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.text, "café");
    }

    #[tokio::test]
    async fn test_utf8_preferred() {
        let mut stream = stream_over("250 café\r\n".as_bytes());
        let response = stream.read_response().await.unwrap();
        assert_eq!(response.text, "café");
    }

    #[tokio::test]
    async fn test_read_ahead_across_responses() {
        // Both responses arrive in one segment; the second read must be
        // served from the buffer without touching the stream.
        let mut stream = stream_over(b"250 first\r\n354 second\r\n");
        assert_eq!(stream.read_response().await.unwrap().code, 250);
        assert_eq!(stream.read_response().await.unwrap().code, 354);
    }

    #[tokio::test]
    async fn test_queue_and_flush_batches_commands() {
        let scripted = ScriptedStream::with_input(b"");
        let written = scripted.written();
        let mut stream = SmtpStream::new(
            scripted,
            Duration::from_secs(5),
            CancellationToken::new(),
            Arc::new(NullProtocolLogger),
        );
        stream.queue_line("MAIL FROM:<a@x>").await.unwrap();
        stream.queue_line("RCPT TO:<b@y>").await.unwrap();
        assert!(written.lock().unwrap().is_empty(), "no bytes before flush");
        stream.flush().await.unwrap();
        assert_eq!(
            written.lock().unwrap().as_slice(),
            b"MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\n"
        );
    }

    #[tokio::test]
    async fn test_oversized_queue_writes_through() {
        let scripted = ScriptedStream::with_input(b"");
        let written = scripted.written();
        let mut stream = SmtpStream::new(
            scripted,
            Duration::from_secs(5),
            CancellationToken::new(),
            Arc::new(NullProtocolLogger),
        );
        let big = vec![b'x'; BLOCK_SIZE * 2 + 17];
        stream.queue(&big).await.unwrap();
        // Larger-than-block payloads bypass the buffer entirely.
        assert_eq!(written.lock().unwrap().len(), big.len());
        stream.flush().await.unwrap();
        assert_eq!(written.lock().unwrap().len(), big.len());
    }

    #[tokio::test]
    async fn test_overflow_flushes_buffered_bytes_first() {
        let scripted = ScriptedStream::with_input(b"");
        let written = scripted.written();
        let mut stream = SmtpStream::new(
            scripted,
            Duration::from_secs(5),
            CancellationToken::new(),
            Arc::new(NullProtocolLogger),
        );
        stream.queue(b"HEAD").await.unwrap();
        let filler = vec![b'y'; BLOCK_SIZE];
        stream.queue(&filler).await.unwrap();
        stream.flush().await.unwrap();
        let bytes = written.lock().unwrap().clone();
        assert!(bytes.starts_with(b"HEAD"));
        assert_eq!(bytes.len(), 4 + BLOCK_SIZE);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_read() {
        let cancel = CancellationToken::new();
        let mut stream = SmtpStream::new(
            ScriptedStream::pending(),
            Duration::from_secs(60),
            cancel.clone(),
            Arc::new(NullProtocolLogger),
        );
        cancel.cancel();
        assert!(matches!(stream.read_response().await, Err(SmtpError::Cancelled)));
    }

    #[tokio::test]
    async fn test_read_timeout_surfaces_as_io_error() {
        let mut stream = SmtpStream::new(
            ScriptedStream::pending(),
            Duration::from_millis(20),
            CancellationToken::new(),
            Arc::new(NullProtocolLogger),
        );
        match stream.read_response().await {
            Err(SmtpError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overlong_line_is_protocol_error() {
        let mut bytes = vec![b'2'; 3];
        bytes.push(b' ');
        bytes.extend(std::iter::repeat(b'a').take(INPUT_CAPACITY + 10));
        bytes.extend_from_slice(b"\r\n");
        let mut stream = stream_over(&bytes);
        assert!(matches!(
            stream.read_response().await,
            Err(SmtpError::ProtocolParse { .. })
        ));
    }

    #[test]
    fn test_parse_response_line() {
        let parsed = parse_response_line(b"250-hello").unwrap();
        assert_eq!(parsed.code, 250);
        assert!(parsed.continuation);
        assert_eq!(parsed.payload, b"hello");

        let parsed = parse_response_line(b"250").unwrap();
        assert!(!parsed.continuation);
        assert!(parsed.payload.is_empty());

        assert!(parse_response_line(b"25").is_err());
        assert!(parse_response_line(b"25a hello").is_err());
    }
}
