//! Mock implementations for testing.
//!
//! [`ScriptedStream`] plays a canned server: it serves a fixed byte script
//! to reads and records every byte the client writes, so tests can assert
//! on the exact command transcript. [`NullUpgrader`] satisfies STARTTLS
//! flows without real TLS, and [`MockMechanism`] drives the
//! authentication loop from a script.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::auth::SaslMechanism;
use crate::client::SmtpSession;
use crate::config::{SmtpConfig, TlsMode, TlsOptions};
use crate::errors::{SmtpError, SmtpResult};
use crate::observability::NullProtocolLogger;
use crate::transport::{MaybeTlsStream, TlsUpgrader};
use crate::types::Email;

/// In-memory stream with scripted server output and a recorded client
/// transcript.
pub struct ScriptedStream {
    input: Vec<u8>,
    pos: usize,
    written: Arc<Mutex<Vec<u8>>>,
    pending_when_drained: bool,
}

impl ScriptedStream {
    /// A stream whose reads serve `input` and then report EOF.
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            input: input.to_vec(),
            pos: 0,
            written: Arc::new(Mutex::new(Vec::new())),
            pending_when_drained: false,
        }
    }

    /// A stream whose reads never complete, for timeout and cancellation
    /// tests.
    pub fn pending() -> Self {
        Self {
            input: Vec::new(),
            pos: 0,
            written: Arc::new(Mutex::new(Vec::new())),
            pending_when_drained: true,
        }
    }

    /// Handle to the bytes the client has written so far.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

/// Renders a recorded transcript as text for assertions.
pub fn transcript(written: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&written.lock().unwrap()).into_owned()
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.input.len() {
            let n = (self.input.len() - self.pos).min(buf.remaining());
            buf.put_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        } else if self.pending_when_drained {
            // Never wake: the caller's timeout or cancellation fires first.
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Upgrader that passes the stream through unchanged, so STARTTLS flows
/// can run against in-memory streams.
#[derive(Debug, Default)]
pub struct NullUpgrader;

#[async_trait]
impl<S: Send + 'static> TlsUpgrader<S> for NullUpgrader {
    async fn upgrade(
        &self,
        stream: S,
        _host: &str,
        _options: &TlsOptions,
    ) -> SmtpResult<MaybeTlsStream<S>> {
        Ok(MaybeTlsStream::Plain(stream))
    }
}

/// SASL mechanism driven by a script of canned responses.
pub struct MockMechanism {
    name: String,
    initial: Option<String>,
    responses: Vec<String>,
    step: usize,
    fail_at_step: Option<usize>,
    security_layer: bool,
}

impl MockMechanism {
    /// A mechanism with an initial response and no further steps.
    pub fn single_shot(name: &str, initial: &str) -> Self {
        Self {
            name: name.to_string(),
            initial: Some(initial.to_string()),
            responses: Vec::new(),
            step: 0,
            fail_at_step: None,
            security_layer: false,
        }
    }

    /// A challenge-response mechanism with scripted replies.
    pub fn scripted(name: &str, responses: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            initial: None,
            responses: responses.iter().map(|s| s.to_string()).collect(),
            step: 0,
            fail_at_step: None,
            security_layer: false,
        }
    }

    /// Makes the mechanism fail at the given challenge step.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Marks the mechanism as negotiating a security layer.
    pub fn with_security_layer(mut self) -> Self {
        self.security_layer = true;
        self
    }
}

impl SaslMechanism for MockMechanism {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_initial_response(&self) -> bool {
        self.initial.is_some()
    }

    fn challenge(&mut self, _input: Option<&str>) -> SmtpResult<String> {
        if self.fail_at_step == Some(self.step) {
            return Err(SmtpError::Mechanism("scripted failure".to_string()));
        }
        let token = if self.step == 0 && self.initial.is_some() {
            self.initial.clone().unwrap_or_default()
        } else {
            let index = self.step - usize::from(self.initial.is_some());
            self.responses.get(index).cloned().unwrap_or_default()
        };
        self.step += 1;
        Ok(token)
    }

    fn is_authenticated(&self) -> bool {
        self.step > 0
    }

    fn negotiated_security_layer(&self) -> bool {
        self.security_layer
    }
}

/// Event sink that records every hook invocation as a line of text.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingEvents {
    /// Creates the sink and a handle to its log.
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let events = Self::default();
        let log = Arc::clone(&events.log);
        (events, log)
    }
}

impl crate::client::SessionEvents for RecordingEvents {
    fn on_sender_accepted(&mut self, mailbox: &crate::types::Address, _: &crate::protocol::SmtpResponse) {
        self.log.lock().unwrap().push(format!("sender-accepted:{}", mailbox.email()));
    }

    fn on_sender_rejected(&mut self, mailbox: &crate::types::Address, _: &crate::protocol::SmtpResponse) {
        self.log.lock().unwrap().push(format!("sender-rejected:{}", mailbox.email()));
    }

    fn on_recipient_accepted(&mut self, mailbox: &crate::types::Address, _: &crate::protocol::SmtpResponse) {
        self.log.lock().unwrap().push(format!("recipient-accepted:{}", mailbox.email()));
    }

    fn on_recipient_rejected(&mut self, mailbox: &crate::types::Address, _: &crate::protocol::SmtpResponse) {
        self.log.lock().unwrap().push(format!("recipient-rejected:{}", mailbox.email()));
    }

    fn on_no_recipients_accepted(&mut self) {
        self.log.lock().unwrap().push("no-recipients-accepted".to_string());
    }

    fn on_message_sent(&mut self, response: &crate::protocol::SmtpResponse) {
        self.log.lock().unwrap().push(format!("message-sent:{}", response.text));
    }

    fn on_authenticated(&mut self, text: &str) {
        self.log.lock().unwrap().push(format!("authenticated:{text}"));
    }
}

/// Configuration pointing at a mock server, TLS off.
pub fn mock_config() -> SmtpConfig {
    SmtpConfig::builder()
        .host("mock.example.com")
        .tls_mode(TlsMode::Plain)
        .build()
        .expect("mock config is valid")
}

/// Runs the connect sequence against a scripted server, returning the
/// session and the transcript handle.
pub async fn connected_session(
    server_script: &[u8],
) -> SmtpResult<(SmtpSession<ScriptedStream>, Arc<Mutex<Vec<u8>>>)> {
    connected_session_with_config(mock_config(), server_script).await
}

/// Like [`connected_session`], with explicit configuration.
pub async fn connected_session_with_config(
    config: SmtpConfig,
    server_script: &[u8],
) -> SmtpResult<(SmtpSession<ScriptedStream>, Arc<Mutex<Vec<u8>>>)> {
    let stream = ScriptedStream::with_input(server_script);
    let written = stream.written();
    let session = SmtpSession::handshake(
        config,
        stream,
        Arc::new(NullUpgrader),
        None,
        Arc::new(NullProtocolLogger),
    )
    .await?;
    Ok((session, written))
}

/// Creates a test email.
pub fn test_email() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")
        .to("recipient@example.com")
        .subject("Test Subject")
        .text("Test body")
        .build()
}
