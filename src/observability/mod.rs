//! Observability infrastructure: wire-level protocol logging, the AUTH
//! secret detector, and in-process metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives raw protocol traffic for capture or debugging.
///
/// The core hands over the bytes exactly as written and read; redaction of
/// authentication secrets is the logger's job, with [`SecretDetector`]
/// identifying which outgoing bytes are secret-bearing.
pub trait ProtocolLogger: Send + Sync {
    /// Called once per connection attempt with the target URI.
    fn log_connect(&self, _uri: &str) {}

    /// Called with outgoing bytes before they are written.
    fn log_client(&self, _bytes: &[u8]) {}

    /// Called with each response line as it is consumed, terminator
    /// included.
    fn log_server(&self, _bytes: &[u8]) {}
}

/// Logger that discards everything.
#[derive(Debug, Default)]
pub struct NullProtocolLogger;

impl ProtocolLogger for NullProtocolLogger {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    /// Matching the literal `AUTH ` command prefix.
    Auth { matched: usize },
    /// Inside the mechanism name.
    Mechanism,
    /// Inside a secret-bearing token (initial response or challenge
    /// response).
    Token,
    /// Saw CR, waiting for the LF that completes the line.
    NewLine,
    /// The byte stream deviated from the AUTH exchange shape; nothing is
    /// secret from here on.
    Error,
}

/// Pure state machine that flags the secret-bearing bytes of an AUTH
/// exchange in the outgoing byte stream.
///
/// Construct one when an AUTH command begins and feed it every outgoing
/// byte. The mechanism name and line terminators are not secret; the
/// initial response and every subsequent client token are. The transitions
/// agree bit-for-bit with the AUTH command format the client writes.
#[derive(Debug)]
pub struct SecretDetector {
    state: DetectorState,
}

impl Default for SecretDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretDetector {
    const COMMAND: &'static [u8] = b"AUTH ";

    /// Creates a detector positioned at the start of an AUTH command.
    pub fn new() -> Self {
        Self { state: DetectorState::Auth { matched: 0 } }
    }

    /// Feeds one outgoing byte; returns true if that byte is secret.
    pub fn is_secret(&mut self, byte: u8) -> bool {
        match self.state {
            DetectorState::Error => false,
            DetectorState::Auth { matched } => {
                if byte == Self::COMMAND[matched] {
                    self.state = if matched + 1 == Self::COMMAND.len() {
                        DetectorState::Mechanism
                    } else {
                        DetectorState::Auth { matched: matched + 1 }
                    };
                } else {
                    self.state = DetectorState::Error;
                }
                false
            }
            DetectorState::Mechanism => {
                match byte {
                    b' ' => self.state = DetectorState::Token,
                    b'\r' => self.state = DetectorState::NewLine,
                    b'\n' => self.state = DetectorState::Token,
                    _ => {}
                }
                false
            }
            DetectorState::NewLine => {
                self.state = if byte == b'\n' {
                    DetectorState::Token
                } else {
                    DetectorState::Error
                };
                false
            }
            DetectorState::Token => match byte {
                b'\r' => {
                    self.state = DetectorState::NewLine;
                    false
                }
                b'\n' => false,
                _ => true,
            },
        }
    }

    /// Scans a buffer of outgoing bytes, returning the `(offset, length)`
    /// spans that carry secrets.
    pub fn scan(&mut self, bytes: &[u8]) -> Vec<(usize, usize)> {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for (i, &byte) in bytes.iter().enumerate() {
            if self.is_secret(byte) {
                match spans.last_mut() {
                    Some((start, len)) if *start + *len == i => *len += 1,
                    _ => spans.push((i, 1)),
                }
            }
        }
        spans
    }
}

/// SMTP metrics collector.
#[derive(Debug, Default)]
pub struct SmtpMetrics {
    /// Total messages sent successfully.
    pub messages_sent: AtomicU64,
    /// Total messages that failed to send.
    pub messages_failed: AtomicU64,
    /// Total connection attempts.
    pub connection_attempts: AtomicU64,
    /// Successful connections.
    pub connections_successful: AtomicU64,
    /// Failed connections.
    pub connections_failed: AtomicU64,
    /// Total authentication attempts.
    pub auth_attempts: AtomicU64,
    /// Successful authentications.
    pub auth_successful: AtomicU64,
    /// Failed authentications.
    pub auth_failed: AtomicU64,
    /// TLS upgrades performed.
    pub tls_upgrades: AtomicU64,
}

impl SmtpMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful message send.
    pub fn record_send_success(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed message send.
    pub fn record_send_failure(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.connections_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an authentication attempt.
    pub fn record_auth_attempt(&self, success: bool) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.auth_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a TLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_bytes(detector: &mut SecretDetector, bytes: &[u8]) -> Vec<u8> {
        let mut secret = Vec::new();
        for &b in bytes {
            if detector.is_secret(b) {
                secret.push(b);
            }
        }
        secret
    }

    #[test]
    fn test_initial_response_is_secret() {
        let mut detector = SecretDetector::new();
        let secret = secret_bytes(&mut detector, b"AUTH PLAIN dGVzdA==\r\n");
        assert_eq!(secret, b"dGVzdA==");
    }

    #[test]
    fn test_mechanism_name_is_not_secret() {
        let mut detector = SecretDetector::new();
        let secret = secret_bytes(&mut detector, b"AUTH LOGIN\r\n");
        assert!(secret.is_empty());
    }

    #[test]
    fn test_challenge_responses_are_secret() {
        let mut detector = SecretDetector::new();
        let secret = secret_bytes(&mut detector, b"AUTH LOGIN\r\ndXNlcg==\r\ncGFzcw==\r\n");
        assert_eq!(secret, b"dXNlcg==cGFzcw==");
    }

    #[test]
    fn test_non_auth_command_is_never_secret() {
        let mut detector = SecretDetector::new();
        let secret = secret_bytes(&mut detector, b"MAIL FROM:<a@b>\r\n");
        assert!(secret.is_empty());
    }

    #[test]
    fn test_deviation_enters_error_state() {
        let mut detector = SecretDetector::new();
        // A bare CR not followed by LF is not part of the exchange shape.
        let secret = secret_bytes(&mut detector, b"AUTH PLAIN abc\rxyz secret");
        assert_eq!(secret, b"abc");
    }

    #[test]
    fn test_scan_spans() {
        let mut detector = SecretDetector::new();
        let bytes = b"AUTH PLAIN dGVzdA==\r\n";
        let spans = detector.scan(bytes);
        assert_eq!(spans, vec![(11, 8)]);
        assert_eq!(&bytes[11..19], b"dGVzdA==");
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = SmtpMetrics::new();
        metrics.record_send_success();
        metrics.record_send_failure();
        metrics.record_connection_attempt(true);
        metrics.record_auth_attempt(false);
        metrics.record_tls_upgrade();
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.messages_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.connections_successful.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.auth_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.tls_upgrades.load(Ordering::Relaxed), 1);
    }
}
