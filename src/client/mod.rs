//! The SMTP session: state machine, connect sequencer, and authentication.
//!
//! A [`SmtpSession`] owns one connection and drives it through
//! `Disconnected → Connected → (Secured) → (Authenticated)`. All public
//! operations take `&mut self`, which is the mutual-exclusion boundary: no
//! two operations on a session can ever be in flight at once.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, Credentials, SaslMechanism};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{CommandKind, SmtpError, SmtpResult};
use crate::observability::{NullProtocolLogger, ProtocolLogger, SmtpMetrics};
use crate::protocol::{codes, ExtensionSet, SmtpCommand, SmtpResponse};
use crate::transport::{MaybeTlsStream, SmtpStream, TlsUpgrader};
use crate::types::{Address, ConnectionInfo};

mod transaction;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable connection.
    Disconnected,
    /// Connected and greeted, not authenticated.
    Connected {
        /// Whether the connection is TLS-protected.
        secure: bool,
    },
    /// Successfully authenticated.
    Authenticated {
        /// Whether the connection is TLS-protected.
        secure: bool,
    },
}

impl SessionState {
    /// Returns true unless the session is disconnected.
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    /// Returns true if the connection is TLS-protected.
    pub fn is_secure(&self) -> bool {
        matches!(
            self,
            SessionState::Connected { secure: true } | SessionState::Authenticated { secure: true }
        )
    }

    /// Returns true if the session has authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

/// Observer hooks fired as a transaction progresses.
///
/// Default implementations do nothing; implement only what you need.
pub trait SessionEvents: Send {
    /// The server accepted the MAIL FROM sender.
    fn on_sender_accepted(&mut self, _mailbox: &Address, _response: &SmtpResponse) {}

    /// The server rejected the MAIL FROM sender.
    fn on_sender_rejected(&mut self, _mailbox: &Address, _response: &SmtpResponse) {}

    /// The server accepted a recipient (251 counts as accepted-forwarded).
    fn on_recipient_accepted(&mut self, _mailbox: &Address, _response: &SmtpResponse) {}

    /// The server rejected a recipient.
    fn on_recipient_rejected(&mut self, _mailbox: &Address, _response: &SmtpResponse) {}

    /// Every recipient was rejected; the transaction is abandoned.
    fn on_no_recipients_accepted(&mut self) {}

    /// The server accepted the message content.
    fn on_message_sent(&mut self, _response: &SmtpResponse) {}

    /// Authentication succeeded.
    fn on_authenticated(&mut self, _text: &str) {}
}

/// Event sink that ignores everything.
pub struct NullEvents;

impl SessionEvents for NullEvents {}

/// An SMTP submission session over one connection.
pub struct SmtpSession<S = tokio::net::TcpStream> {
    config: SmtpConfig,
    stream: Option<SmtpStream<MaybeTlsStream<S>>>,
    upgrader: Arc<dyn TlsUpgrader<S>>,
    state: SessionState,
    caps: ExtensionSet,
    banner: String,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    logger: Arc<dyn ProtocolLogger>,
    metrics: Arc<SmtpMetrics>,
    events: Box<dyn SessionEvents>,
}

impl<S> std::fmt::Debug for SmtpSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("state", &self.state)
            .field("caps", &self.caps)
            .field("banner", &self.banner)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(feature = "rustls-tls")]
impl SmtpSession<tokio::net::TcpStream> {
    /// Connects to the configured server and runs the connect sequence:
    /// greeting, EHLO, and STARTTLS when the mode asks for it.
    pub async fn connect(config: SmtpConfig) -> SmtpResult<Self> {
        Self::connect_with_logger(config, Arc::new(NullProtocolLogger)).await
    }

    /// Like [`connect`](Self::connect), with a wire-level protocol logger.
    pub async fn connect_with_logger(
        config: SmtpConfig,
        logger: Arc<dyn ProtocolLogger>,
    ) -> SmtpResult<Self> {
        use tokio::net::TcpStream;

        config.validate()?;
        let address = config.address();
        logger.log_connect(&format!("smtp://{address}"));

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                SmtpError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(SmtpError::Io)?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();

        Self::handshake(
            config,
            stream,
            Arc::new(crate::transport::RustlsUpgrader),
            local_addr,
            logger,
        )
        .await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpSession<S> {
    /// Runs the connect sequence over an already-established byte stream.
    ///
    /// This is the generic entry point: `connect` wraps it for TCP, and
    /// tests drive it with in-memory streams. `local_addr` feeds the EHLO
    /// IP literal when no local domain is configured.
    pub async fn handshake(
        config: SmtpConfig,
        stream: S,
        upgrader: Arc<dyn TlsUpgrader<S>>,
        local_addr: Option<SocketAddr>,
        logger: Arc<dyn ProtocolLogger>,
    ) -> SmtpResult<Self> {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(SmtpMetrics::new());

        let inner = if config.tls.mode == TlsMode::SslOnConnect {
            let upgraded = upgrader.upgrade(stream, &config.host, &config.tls).await?;
            metrics.record_tls_upgrade();
            upgraded
        } else {
            MaybeTlsStream::Plain(stream)
        };
        let secure = inner.is_tls() || config.tls.mode == TlsMode::SslOnConnect;

        let framed = SmtpStream::new(inner, config.command_timeout, cancel.clone(), logger.clone());
        let mut session = Self {
            config,
            stream: Some(framed),
            upgrader,
            state: SessionState::Connected { secure },
            caps: ExtensionSet::default(),
            banner: String::new(),
            local_addr,
            cancel,
            logger,
            metrics,
            events: Box::new(NullEvents),
        };

        match session.run_connect_sequence().await {
            Ok(()) => {
                session.metrics.record_connection_attempt(true);
                Ok(session)
            }
            Err(e) => {
                session.metrics.record_connection_attempt(false);
                session.teardown();
                Err(e)
            }
        }
    }

    async fn run_connect_sequence(&mut self) -> SmtpResult<()> {
        let mode = self.config.tls.mode;

        let greeting = {
            let result = self.stream_mut()?.read_response().await;
            self.handle_fatal(result)?
        };
        if greeting.code != codes::SERVICE_READY {
            return Err(SmtpError::command(CommandKind::UnexpectedStatus, &greeting, None));
        }
        self.banner = greeting.text;

        self.ehlo().await?;

        if mode == TlsMode::StartTlsRequired && !self.caps.starttls {
            return Err(SmtpError::FeatureNotSupported { feature: "STARTTLS" });
        }

        let wants_starttls =
            matches!(mode, TlsMode::StartTlsIfAvailable | TlsMode::StartTlsRequired);
        if self.caps.starttls && wants_starttls && !self.state.is_secure() {
            let response = self.command(&SmtpCommand::StartTls).await?;
            if response.code != codes::SERVICE_READY {
                return Err(SmtpError::command(CommandKind::UnexpectedStatus, &response, None));
            }
            self.upgrade_tls().await?;
            self.ehlo().await?;
        }

        Ok(())
    }

    /// Replaces the plain stream with its TLS upgrade, in place. Fresh
    /// framing buffers: nothing may be carried across the handshake.
    async fn upgrade_tls(&mut self) -> SmtpResult<()> {
        let framed = self.stream.take().ok_or(SmtpError::NotConnected)?;
        let upgraded = match framed.into_inner() {
            MaybeTlsStream::Plain(raw) => {
                self.upgrader.upgrade(raw, &self.config.host, &self.config.tls).await?
            }
            already_tls => already_tls,
        };
        self.metrics.record_tls_upgrade();
        self.stream = Some(SmtpStream::new(
            upgraded,
            self.config.command_timeout,
            self.cancel.clone(),
            self.logger.clone(),
        ));
        self.state = SessionState::Connected { secure: true };
        Ok(())
    }

    /// EHLO exchange: on 250 the capability set is replaced wholesale. A
    /// 503 after authentication is tolerated (some servers refuse the
    /// re-handshake). Any other status falls back to HELO once.
    async fn ehlo(&mut self) -> SmtpResult<()> {
        let local_id = self.local_id();
        let was_authenticated = self.state.is_authenticated();

        let response = self.command(&SmtpCommand::Ehlo(local_id.clone())).await?;
        if response.code == codes::OK {
            self.caps = ExtensionSet::from_ehlo(&response);
            return Ok(());
        }
        if response.code == codes::BAD_SEQUENCE && was_authenticated {
            return Ok(());
        }

        let response = self.command(&SmtpCommand::Helo(local_id)).await?;
        if response.code == codes::OK {
            // HELO advertises nothing.
            self.caps = ExtensionSet::default();
            return Ok(());
        }
        Err(SmtpError::command(CommandKind::UnexpectedStatus, &response, None))
    }

    /// The identity sent in EHLO/HELO: the configured local domain, or an
    /// IP literal formed from the local endpoint.
    fn local_id(&self) -> String {
        if let Some(domain) = &self.config.local_domain {
            return domain.clone();
        }
        match self.local_addr {
            Some(SocketAddr::V4(v4)) => format!("[{}]", v4.ip()),
            Some(SocketAddr::V6(v6)) => format!("[IPv6:{}]", v6.ip()),
            None => "[127.0.0.1]".to_string(),
        }
    }

    /// Authenticates with the given credentials, trying advertised
    /// mechanisms from strongest to weakest until one succeeds.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> SmtpResult<()> {
        if !self.state.is_connected() {
            return Err(SmtpError::NotConnected);
        }
        if self.state.is_authenticated() {
            return Ok(());
        }
        if !self.caps.auth {
            return Err(SmtpError::FeatureNotSupported { feature: "AUTH" });
        }

        let mut saved: Option<SmtpError> = None;
        let mut constructed_any = false;

        for name in credentials.mechanism_preference() {
            if !self.caps.supports_mechanism(name) {
                continue;
            }
            let Some(mechanism) = auth::create_mechanism(name, credentials) else {
                continue;
            };
            constructed_any = true;

            match self.try_mechanism(mechanism).await {
                Ok((response, security_layer)) => {
                    self.finish_authentication(&response);
                    if security_layer {
                        self.ehlo().await?;
                    }
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.metrics.record_auth_attempt(false);
                    saved = Some(e);
                }
            }
        }

        if !constructed_any {
            return Err(SmtpError::NoCompatibleMechanism);
        }
        Err(saved.unwrap_or(SmtpError::NoCompatibleMechanism))
    }

    /// Authenticates with one externally-constructed mechanism instance.
    pub async fn authenticate_with(&mut self, mechanism: Box<dyn SaslMechanism>) -> SmtpResult<()> {
        if !self.state.is_connected() {
            return Err(SmtpError::NotConnected);
        }
        if !self.caps.auth {
            return Err(SmtpError::FeatureNotSupported { feature: "AUTH" });
        }

        match self.try_mechanism(mechanism).await {
            Ok((response, security_layer)) => {
                self.finish_authentication(&response);
                if security_layer {
                    self.ehlo().await?;
                }
                Ok(())
            }
            Err(e) => {
                if !e.is_fatal() {
                    self.metrics.record_auth_attempt(false);
                }
                Err(e)
            }
        }
    }

    fn finish_authentication(&mut self, response: &SmtpResponse) {
        self.metrics.record_auth_attempt(true);
        self.state = SessionState::Authenticated { secure: self.state.is_secure() };
        self.events.on_authenticated(&response.text);
    }

    /// Drives one AUTH exchange to its final status. Returns the success
    /// response and whether the mechanism negotiated a security layer
    /// (which obliges the caller to refresh the capability set).
    async fn try_mechanism(
        &mut self,
        mut mechanism: Box<dyn SaslMechanism>,
    ) -> SmtpResult<(SmtpResponse, bool)> {
        let name = mechanism.name().to_string();
        #[cfg(feature = "tracing")]
        tracing::debug!(mechanism = %name, "authenticating");

        let command = if mechanism.supports_initial_response() {
            let initial = mechanism.challenge(None)?;
            SmtpCommand::Auth { mechanism: name, initial_response: Some(initial) }
        } else {
            SmtpCommand::Auth { mechanism: name, initial_response: None }
        };
        let mut response = self.command(&command).await?;

        while response.code == codes::AUTH_CONTINUE {
            match mechanism.challenge(Some(response.text.trim())) {
                Ok(token) => {
                    response = self.command_raw(&token).await?;
                }
                Err(inner) => {
                    // A bare line cancels the exchange; the server answers
                    // with its final status, which carries the report.
                    let final_response = self.command_raw("").await?;
                    return Err(SmtpError::AuthenticationFailed {
                        status: final_response.code,
                        text: final_response.text,
                        inner: Some(Box::new(inner)),
                    });
                }
            }
        }

        if response.code == codes::AUTH_SUCCESS {
            Ok((response, mechanism.negotiated_security_layer()))
        } else {
            Err(SmtpError::AuthenticationFailed {
                status: response.code,
                text: response.text,
                inner: None,
            })
        }
    }

    /// Sends NOOP; any reply other than 250 is an error.
    pub async fn noop(&mut self) -> SmtpResult<()> {
        let response = self.command(&SmtpCommand::Noop).await?;
        if response.code == codes::OK {
            Ok(())
        } else {
            Err(SmtpError::command(CommandKind::UnexpectedStatus, &response, None))
        }
    }

    /// Disconnects, sending QUIT first when `graceful`. QUIT is best
    /// effort: every error is swallowed and the session always ends up
    /// disconnected.
    pub async fn disconnect(&mut self, graceful: bool) {
        if graceful {
            if let Some(stream) = self.stream.as_mut() {
                let _ = stream.send_command(&SmtpCommand::Quit.to_smtp_string()).await;
            }
        }
        self.teardown();
    }

    /// Expands a mailing list alias via EXPN, returning the member
    /// mailboxes parsed line by line from the reply.
    pub async fn expand(&mut self, alias: &str) -> SmtpResult<Vec<Address>> {
        validate_command_argument(alias)?;
        let response = self.command(&SmtpCommand::Expn(alias.to_string())).await?;
        match response.code {
            codes::OK => response.lines().map(Address::parse).collect(),
            codes::AUTH_REQUIRED => Err(SmtpError::NotAuthenticated { text: response.text }),
            _ => Err(SmtpError::command(CommandKind::UnexpectedStatus, &response, None)),
        }
    }

    /// Verifies an address via VRFY, returning the mailbox the server
    /// reports.
    pub async fn verify(&mut self, address: &str) -> SmtpResult<Address> {
        validate_command_argument(address)?;
        let response = self.command(&SmtpCommand::Vrfy(address.to_string())).await?;
        match response.code {
            codes::OK => Address::parse(response.first_line()),
            codes::AUTH_REQUIRED => Err(SmtpError::NotAuthenticated { text: response.text }),
            _ => Err(SmtpError::command(CommandKind::UnexpectedStatus, &response, None)),
        }
    }

    /// The extensions advertised by the last EHLO.
    pub fn capabilities(&self) -> &ExtensionSet {
        &self.caps
    }

    /// Maximum message size the server accepts; 0 when unknown.
    pub fn max_size(&self) -> u32 {
        self.caps.max_size
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true if the connection is TLS-protected.
    pub fn is_secure(&self) -> bool {
        self.state.is_secure()
    }

    /// Returns true if the session has authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    /// Returns true unless the session is disconnected.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Connection facts: host, TLS state, greeting, raw capabilities.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            secure: self.is_secure(),
            banner: self.banner.clone(),
            capabilities: self.caps.raw.clone(),
        }
    }

    /// Token that cancels any in-flight I/O on this session. Cancellation
    /// forfeits the connection.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replaces the event sink.
    pub fn set_events(&mut self, events: Box<dyn SessionEvents>) {
        self.events = events;
    }

    /// Metrics counters for this session.
    pub fn metrics(&self) -> &SmtpMetrics {
        &self.metrics
    }

    /// Sends one structured command and reads its response.
    async fn command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let line = command.to_smtp_string();
        #[cfg(feature = "tracing")]
        tracing::debug!(verb = line.split_whitespace().next().unwrap_or(""), "sending command");
        let result = self.stream_mut()?.send_command(&line).await;
        let response = self.handle_fatal(result)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(code = response.code, "received response");
        Ok(response)
    }

    /// Sends a raw line (SASL token or cancellation) and reads the
    /// response.
    async fn command_raw(&mut self, line: &str) -> SmtpResult<SmtpResponse> {
        let result = self.stream_mut()?.send_command(line).await;
        self.handle_fatal(result)
    }

    fn stream_mut(&mut self) -> SmtpResult<&mut SmtpStream<MaybeTlsStream<S>>> {
        self.stream.as_mut().ok_or(SmtpError::NotConnected)
    }

    /// Fatal errors forfeit the connection on the spot.
    fn handle_fatal<T>(&mut self, result: SmtpResult<T>) -> SmtpResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.teardown();
            }
        }
        result
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.state = SessionState::Disconnected;
        self.caps = ExtensionSet::default();
    }
}

/// EXPN/VRFY arguments travel on a command line and must not break it.
fn validate_command_argument(arg: &str) -> SmtpResult<()> {
    if arg.contains(['\r', '\n']) {
        return Err(SmtpError::InvalidAddress(
            "argument must not contain CR or LF".to_string(),
        ));
    }
    Ok(())
}
