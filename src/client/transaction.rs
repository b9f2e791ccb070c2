//! The mail transaction engine: MAIL FROM, RCPT TO, and the body phase.
//!
//! With PIPELINING, MAIL FROM and every RCPT TO are queued on the framing
//! stream and flushed as one batch; exactly one response is then consumed
//! per queued command, in order, before any of them is interpreted. The
//! body goes out as DATA with dot-stuffing, or as a single `BDAT n LAST`
//! chunk when the server speaks CHUNKING and the content needs BINARYMIME.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{CommandKind, SmtpError, SmtpResult};
use crate::mime::{EncodingConstraint, EncodingRequirement, FormattedEmail, MessageSource};
use crate::protocol::{codes, BodyKind, SmtpCommand, SmtpResponse};
use crate::transport::stuffing::DotStuffer;
use crate::transport::BLOCK_SIZE;
use crate::types::{Address, Email, Envelope, ProgressSink, SendOptions};

use super::SmtpSession;

/// A command sitting in the pipelining queue, waiting for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedCommand {
    kind: QueuedKind,
    /// Index into the deduplicated recipient list, for RCPT TO.
    recipient: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedKind {
    MailFrom,
    RcptTo,
}

/// Envelope-command outcome per the response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// 250, or 251 (accepted, will forward).
    Accepted,
    /// Mailbox-level rejection (550, 553, 450, 451, 452).
    Rejected,
    /// 530: authentication required.
    AuthRequired,
    /// Anything else.
    Unexpected,
}

fn classify(code: u16) -> Outcome {
    match code {
        codes::OK | codes::WILL_FORWARD => Outcome::Accepted,
        codes::MAILBOX_UNAVAILABLE
        | codes::INVALID_MAILBOX
        | codes::MAILBOX_UNAVAILABLE_TEMP
        | codes::LOCAL_ERROR
        | codes::INSUFFICIENT_STORAGE => Outcome::Rejected,
        codes::AUTH_REQUIRED => Outcome::AuthRequired,
        _ => Outcome::Unexpected,
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpSession<S> {
    /// Submits a message, returning the server's final reply text.
    ///
    /// The session must be connected (and authenticated if the server
    /// demands it). A non-fatal rejection leaves the session connected
    /// after an RSET; fatal errors disconnect it.
    pub async fn send<M: MessageSource + ?Sized>(
        &mut self,
        message: &mut M,
        envelope: &Envelope,
        options: &SendOptions,
        progress: Option<&mut dyn ProgressSink>,
    ) -> SmtpResult<String> {
        let result = self.send_inner(message, envelope, options, progress).await;
        match &result {
            Ok(_) => self.metrics.record_send_success(),
            Err(_) => self.metrics.record_send_failure(),
        }
        result
    }

    /// Formats an [`Email`] with the default formatter and submits it to
    /// its own envelope recipients.
    pub async fn send_email(&mut self, email: &Email) -> SmtpResult<String> {
        let envelope = email.envelope();
        let domain = email.from.domain().to_string();
        let mut message = FormattedEmail::new(email.clone(), domain);
        self.send(&mut message, &envelope, &SendOptions::default(), None).await
    }

    async fn send_inner<M: MessageSource + ?Sized>(
        &mut self,
        message: &mut M,
        envelope: &Envelope,
        options: &SendOptions,
        mut progress: Option<&mut dyn ProgressSink>,
    ) -> SmtpResult<String> {
        if !self.state.is_connected() {
            return Err(SmtpError::NotConnected);
        }

        // Recipients are deduplicated case-insensitively on the address
        // literal; the first spelling wins.
        let mut seen = HashSet::new();
        let recipients: Vec<&Address> =
            envelope.to.iter().filter(|r| seen.insert(r.dedup_key())).collect();
        if recipients.is_empty() {
            return Err(SmtpError::Configuration(
                "at least one recipient is required".to_string(),
            ));
        }

        let constraint = if self.caps.binary_mime {
            EncodingConstraint::Unrestricted
        } else if self.caps.eight_bit_mime {
            EncodingConstraint::EightBit
        } else {
            EncodingConstraint::SevenBit
        };
        message.prepare(constraint)?;

        let requirement = message.visit_encoding();
        if requirement == EncodingRequirement::Binary && !self.caps.binary_mime {
            return Err(SmtpError::FeatureNotSupported { feature: "BINARYMIME" });
        }

        let mut international = options.international;
        if international {
            if !self.caps.eight_bit_mime {
                return Err(SmtpError::FeatureNotSupported { feature: "8BITMIME" });
            }
            if !self.caps.smtputf8 {
                international = false;
            }
        }
        if !international {
            // Without SMTPUTF8 in force there is no way to put a non-ASCII
            // mailbox on the wire.
            if !envelope.from.is_ascii() || recipients.iter().any(|r| !r.is_ascii()) {
                return Err(SmtpError::FeatureNotSupported { feature: "SMTPUTF8" });
            }
        }

        let size = if self.caps.size || self.caps.chunking || progress.is_some() {
            Some(message.measure()?)
        } else {
            None
        };

        let body = match requirement {
            EncodingRequirement::Binary => Some(BodyKind::BinaryMime),
            EncodingRequirement::EightBit => Some(BodyKind::EightBitMime),
            EncodingRequirement::None => None,
        };

        let mail_from = SmtpCommand::MailFrom {
            address: envelope.from.email(),
            smtputf8: international,
            body,
            envelope_id: if self.caps.dsn { options.envelope_id.clone() } else { None },
            // The measured length also feeds BDAT and progress totals, but
            // the parameter itself belongs to the SIZE extension.
            size: if self.caps.size { size } else { None },
        };
        let rcpt_commands: Vec<SmtpCommand> = recipients
            .iter()
            .map(|r| SmtpCommand::RcptTo {
                address: r.email(),
                notify: if self.caps.dsn { options.notify_for(r) } else { None },
            })
            .collect();

        let (queue, responses) = self.issue_envelope(&mail_from, &rcpt_commands).await?;

        // Interpret responses only after every queued command has one.
        let mut accepted = 0usize;
        let mut rejections: Vec<(Address, SmtpResponse)> = Vec::new();

        for (command, response) in queue.iter().zip(&responses) {
            match command.kind {
                QueuedKind::MailFrom => match classify(response.code) {
                    Outcome::Accepted => {
                        self.events.on_sender_accepted(&envelope.from, response);
                    }
                    Outcome::Rejected => {
                        self.events.on_sender_rejected(&envelope.from, response);
                        self.recover().await;
                        return Err(SmtpError::command(
                            CommandKind::SenderNotAccepted,
                            response,
                            Some(envelope.from.clone()),
                        ));
                    }
                    Outcome::AuthRequired => {
                        self.recover().await;
                        return Err(SmtpError::NotAuthenticated { text: response.text.clone() });
                    }
                    Outcome::Unexpected => {
                        self.recover().await;
                        return Err(SmtpError::command(
                            CommandKind::UnexpectedStatus,
                            response,
                            None,
                        ));
                    }
                },
                QueuedKind::RcptTo => {
                    let mailbox = recipients[command.recipient.unwrap_or_default()];
                    match classify(response.code) {
                        Outcome::Accepted => {
                            accepted += 1;
                            self.events.on_recipient_accepted(mailbox, response);
                        }
                        Outcome::Rejected => {
                            rejections.push(((*mailbox).clone(), response.clone()));
                        }
                        Outcome::AuthRequired => {
                            self.recover().await;
                            return Err(SmtpError::NotAuthenticated {
                                text: response.text.clone(),
                            });
                        }
                        Outcome::Unexpected => {
                            self.recover().await;
                            return Err(SmtpError::command(
                                CommandKind::UnexpectedStatus,
                                response,
                                Some((*mailbox).clone()),
                            ));
                        }
                    }
                }
            }
        }

        if accepted == 0 {
            self.fire_rejection_events(&rejections);
            self.events.on_no_recipients_accepted();
            self.recover().await;
            let code = rejections.first().map(|(_, r)| r.code).unwrap_or(codes::MAILBOX_UNAVAILABLE);
            return Err(SmtpError::CommandFailed {
                code,
                text: "No recipients were accepted.".to_string(),
                kind: CommandKind::MessageNotAccepted,
                mailbox: None,
                enhanced: None,
            });
        }

        let use_bdat = self.caps.chunking && requirement == EncodingRequirement::Binary;
        let final_response = if use_bdat {
            self.send_body_bdat(message, &mut progress).await?
        } else {
            self.send_body_data(message, size, &mut progress).await?
        };

        self.fire_rejection_events(&rejections);
        self.events.on_message_sent(&final_response);
        Ok(final_response.text)
    }

    /// Writes MAIL FROM and all RCPT TO commands and collects one response
    /// per command. With PIPELINING the commands are queued and flushed as
    /// one batch before any response is read; otherwise each command is a
    /// synchronous exchange.
    async fn issue_envelope(
        &mut self,
        mail_from: &SmtpCommand,
        rcpt_commands: &[SmtpCommand],
    ) -> SmtpResult<(Vec<QueuedCommand>, Vec<SmtpResponse>)> {
        let mut queue = Vec::with_capacity(1 + rcpt_commands.len());
        queue.push(QueuedCommand { kind: QueuedKind::MailFrom, recipient: None });
        for i in 0..rcpt_commands.len() {
            queue.push(QueuedCommand { kind: QueuedKind::RcptTo, recipient: Some(i) });
        }

        let mut responses = Vec::with_capacity(queue.len());

        if self.caps.pipelining {
            let mail_line = mail_from.to_smtp_string();
            {
                let result = self.stream_mut()?.queue_line(&mail_line).await;
                self.handle_fatal(result)?;
            }
            for command in rcpt_commands {
                let line = command.to_smtp_string();
                let result = self.stream_mut()?.queue_line(&line).await;
                self.handle_fatal(result)?;
            }
            {
                let result = self.stream_mut()?.flush().await;
                self.handle_fatal(result)?;
            }
            for _ in 0..queue.len() {
                let result = self.stream_mut()?.read_response().await;
                responses.push(self.handle_fatal(result)?);
            }
        } else {
            let result = self.stream_mut()?.send_command(&mail_from.to_smtp_string()).await;
            let response = self.handle_fatal(result)?;
            let mail_accepted = classify(response.code) == Outcome::Accepted;
            responses.push(response);
            if mail_accepted {
                for command in rcpt_commands {
                    let result = self.stream_mut()?.send_command(&command.to_smtp_string()).await;
                    let response = self.handle_fatal(result)?;
                    let outcome = classify(response.code);
                    responses.push(response);
                    // Per-recipient rejections continue; a terminal status
                    // aborts the remaining recipients.
                    if matches!(outcome, Outcome::AuthRequired | Outcome::Unexpected) {
                        break;
                    }
                }
            }
        }

        Ok((queue, responses))
    }

    /// DATA body phase: 354, dot-stuffed content, `CRLF . CRLF`, final
    /// status.
    async fn send_body_data<M: MessageSource + ?Sized>(
        &mut self,
        message: &M,
        total: Option<u64>,
        progress: &mut Option<&mut dyn ProgressSink>,
    ) -> SmtpResult<SmtpResponse> {
        let intro = {
            let line = SmtpCommand::Data.to_smtp_string();
            let result = self.stream_mut()?.send_command(&line).await;
            self.handle_fatal(result)?
        };
        match intro.code {
            codes::START_MAIL_INPUT => {}
            codes::AUTH_REQUIRED => {
                self.recover().await;
                return Err(SmtpError::NotAuthenticated { text: intro.text });
            }
            _ => {
                self.recover().await;
                return Err(SmtpError::command(CommandKind::UnexpectedStatus, &intro, None));
            }
        }

        let mut encoded = Vec::new();
        message.write_to(&mut encoded)?;

        let mut stuffer = DotStuffer::new();
        let mut transferred = 0u64;
        let mut out = Vec::with_capacity(BLOCK_SIZE + 16);
        for chunk in encoded.chunks(BLOCK_SIZE) {
            out.clear();
            stuffer.process(chunk, &mut out);
            let result = self.stream_mut()?.queue(&out).await;
            self.handle_fatal(result)?;
            transferred += chunk.len() as u64;
            if let Some(sink) = progress.as_mut() {
                sink.report(transferred, total);
            }
        }
        out.clear();
        stuffer.finish(&mut out);
        {
            let result = self.stream_mut()?.queue(&out).await;
            self.handle_fatal(result)?;
        }
        {
            let result = self.stream_mut()?.flush().await;
            self.handle_fatal(result)?;
        }

        let final_response = {
            let result = self.stream_mut()?.read_response().await;
            self.handle_fatal(result)?
        };
        self.classify_body_response(final_response).await
    }

    /// BDAT body phase: one `BDAT n LAST` chunk of exactly n raw bytes.
    async fn send_body_bdat<M: MessageSource + ?Sized>(
        &mut self,
        message: &M,
        progress: &mut Option<&mut dyn ProgressSink>,
    ) -> SmtpResult<SmtpResponse> {
        let mut encoded = Vec::new();
        message.write_to(&mut encoded)?;
        let total = encoded.len() as u64;

        let bdat = SmtpCommand::Bdat { size: total, last: true };
        {
            let line = bdat.to_smtp_string();
            let result = self.stream_mut()?.queue_line(&line).await;
            self.handle_fatal(result)?;
        }
        let mut transferred = 0u64;
        for chunk in encoded.chunks(BLOCK_SIZE) {
            let result = self.stream_mut()?.queue(chunk).await;
            self.handle_fatal(result)?;
            transferred += chunk.len() as u64;
            if let Some(sink) = progress.as_mut() {
                sink.report(transferred, Some(total));
            }
        }
        {
            let result = self.stream_mut()?.flush().await;
            self.handle_fatal(result)?;
        }

        let final_response = {
            let result = self.stream_mut()?.read_response().await;
            self.handle_fatal(result)?
        };
        self.classify_body_response(final_response).await
    }

    /// Final body status: 250 accepts the message; 530 means the server
    /// wanted authentication; anything else rejects the content.
    async fn classify_body_response(&mut self, response: SmtpResponse) -> SmtpResult<SmtpResponse> {
        match response.code {
            codes::OK => Ok(response),
            codes::AUTH_REQUIRED => {
                self.recover().await;
                Err(SmtpError::NotAuthenticated { text: response.text })
            }
            _ => {
                self.recover().await;
                Err(SmtpError::command(CommandKind::MessageNotAccepted, &response, None))
            }
        }
    }

    fn fire_rejection_events(&mut self, rejections: &[(Address, SmtpResponse)]) {
        for (mailbox, response) in rejections {
            self.events.on_recipient_rejected(mailbox, response);
        }
    }

    /// Abandons the failed transaction with RSET. A refused or failed
    /// RSET forfeits the connection instead of masking the original
    /// error.
    pub(super) async fn recover(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.send_command(&SmtpCommand::Rset.to_smtp_string()).await {
            Ok(response) if response.code == codes::OK => {}
            _ => self.teardown(),
        }
    }
}
