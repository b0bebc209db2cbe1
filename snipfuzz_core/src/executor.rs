use crate::config::TransportSettings;
use crate::input::{Message, Route, Seed};
use crate::session::{SessionCapability, SessionTransport};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Failures that point at a broken harness rather than at the target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    Config(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Payload could not be decoded: {0}")]
    Decode(String),
    #[error("Vendor session failure: {0}")]
    Session(String),
}

impl TransportError {
    /// The candidate payload itself could not be put on the wire; the device was not contacted.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, TransportError::Decode(_))
    }
}

/// Result of a single try, before any retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Reply(String),
    /// The peer answered with nothing; retrying would not change that.
    Closed,
    /// No answer within the timeout.
    Silent,
    Fault(TransportError),
    /// A fault after which the transport has reset itself and may be tried again.
    RetryableFault(TransportError),
}

/// What a send amounts to once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Data(String),
    Empty,
    TransportError(TransportError),
    DeviceCrash,
}

/// Decides whether persistent silence is a legitimate answer or a dead device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Dry runs and baselines: silence is recorded as an empty response.
    Validation,
    /// Probing and mutation against a validated harness: silence means the device is gone.
    Live,
}

/// Why a whole sequence send stopped early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFault {
    #[error("transport failure on message {index} (restore: {during_restore}): {error}")]
    Transport {
        index: usize,
        during_restore: bool,
        error: TransportError,
    },
    #[error("device stopped answering on message {index} (restore: {during_restore})")]
    Crash { index: usize, during_restore: bool },
}

pub trait Transport {
    fn attempt(&mut self, message: &Message) -> Attempt;
}

/// Raw TCP exchange: hex-decoded `Content` out, one bounded read back in.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
    buffer_size: usize,
}

impl SocketTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, buffer_size: usize) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            connect_timeout: connect_timeout.max(floor),
            read_timeout: read_timeout.max(floor),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self::new(
            settings.connect_timeout(),
            settings.socket_timeout(),
            settings.read_buffer_size,
        )
    }

    pub fn exchange(&self, ip: &str, port: u16, content: &[u8]) -> Attempt {
        let payload = match decode_hex_payload(content) {
            Ok(payload) => payload,
            Err(e) => return Attempt::Fault(e),
        };
        let address = match resolve(ip, port) {
            Ok(address) => address,
            Err(e) => return Attempt::Fault(e),
        };

        let mut stream = match TcpStream::connect_timeout(&address, self.connect_timeout) {
            Ok(stream) => stream,
            Err(e) if is_timeout(e.kind()) => return Attempt::Silent,
            Err(e) => return Attempt::Fault(TransportError::Connect(format!("{address}: {e}"))),
        };
        if let Err(e) = stream
            .set_read_timeout(Some(self.read_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.read_timeout)))
        {
            return Attempt::Fault(TransportError::Connect(format!("{address}: {e}")));
        }
        if let Err(e) = stream.write_all(&payload) {
            if is_timeout(e.kind()) {
                return Attempt::Silent;
            }
            return Attempt::Fault(TransportError::Connect(format!("{address}: {e}")));
        }

        let mut buffer = vec![0u8; self.buffer_size];
        match stream.read(&mut buffer) {
            Ok(0) => Attempt::Closed,
            Ok(n) => Attempt::Reply(hex::encode(&buffer[..n])),
            Err(e) if is_timeout(e.kind()) => Attempt::Silent,
            Err(e) => Attempt::Fault(TransportError::Connect(format!("{address}: {e}"))),
        }
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn decode_hex_payload(content: &[u8]) -> Result<Vec<u8>, TransportError> {
    let digits: Vec<u8> = content
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    hex::decode(&digits).map_err(|e| {
        TransportError::Decode(format!("{e} in {:?}", String::from_utf8_lossy(&digits)))
    })
}

fn resolve(ip: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (ip, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Config(format!("cannot resolve {ip}:{port}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::Config(format!("no address for {ip}:{port}")))
}

/// Dispatches each message on the route it was parsed with.
pub struct RoutedTransport<C: SessionCapability> {
    socket: SocketTransport,
    session: SessionTransport<C>,
}

impl<C: SessionCapability> RoutedTransport<C> {
    pub fn new(socket: SocketTransport, capability: C) -> Self {
        Self {
            socket,
            session: SessionTransport::new(capability),
        }
    }

    pub fn session(&self) -> &SessionTransport<C> {
        &self.session
    }
}

impl<C: SessionCapability> Transport for RoutedTransport<C> {
    fn attempt(&mut self, message: &Message) -> Attempt {
        match message.route() {
            Route::RawSocket { ip, port } => self.socket.exchange(ip, *port, message.content()),
            Route::VendorSession { fingerprint, cmd } => {
                self.session.attempt(fingerprint, *cmd, message.content())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff(),
        }
    }
}

/// Sends messages and whole seeds, applying the retry policy and restoring the device.
///
/// The restore seed is replayed after every sequence so each trial starts from the
/// same device state.
pub struct Messenger<T: Transport> {
    transport: T,
    retry: RetryPolicy,
    restore: Seed,
}

impl<T: Transport> Messenger<T> {
    pub fn new(transport: T, retry: RetryPolicy, restore: Seed) -> Self {
        Self {
            transport,
            retry,
            restore,
        }
    }

    pub fn restore_seed(&self) -> &Seed {
        &self.restore
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends one message, retrying silence and recoverable faults up to the ceiling.
    pub fn send(&mut self, message: &Message, phase: Phase) -> Outcome {
        let mut retries = 0u32;
        loop {
            match self.transport.attempt(message) {
                Attempt::Reply(data) if data.trim().is_empty() => return Outcome::Empty,
                Attempt::Reply(data) => return Outcome::Data(data),
                Attempt::Closed => return Outcome::Empty,
                Attempt::Fault(error) => return Outcome::TransportError(error),
                Attempt::Silent if retries >= self.retry.max_retries => {
                    return match phase {
                        Phase::Validation => Outcome::Empty,
                        Phase::Live => Outcome::DeviceCrash,
                    };
                }
                Attempt::RetryableFault(error) if retries >= self.retry.max_retries => {
                    return Outcome::TransportError(error);
                }
                Attempt::Silent | Attempt::RetryableFault(_) => {}
            }
            retries += 1;
            tracing::debug!(retry = retries, "No usable answer, retrying");
            let pause = self.retry.backoff * retries;
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }

    /// Sends `messages` in order, then replays the restore seed.
    ///
    /// `expected` holds the validated responses of the sequence. In the live phase
    /// only messages that answered during validation can be declared crashed; the
    /// others keep treating silence as an empty answer.
    pub fn send_seed(
        &mut self,
        messages: &[Message],
        expected: &[String],
        phase: Phase,
    ) -> Result<Vec<String>, SendFault> {
        let sequence = self.send_sequence(messages, expected, phase, false);
        let restore_messages = std::mem::take(&mut self.restore.messages);
        let restore_expected = std::mem::take(&mut self.restore.responses);
        let restored = self.send_sequence(&restore_messages, &restore_expected, phase, true);
        self.restore.messages = restore_messages;
        self.restore.responses = restore_expected;

        let responses = sequence?;
        restored?;
        Ok(responses)
    }

    /// Validates the restore seed once and remembers how it answers.
    pub fn validate_restore(&mut self) -> Result<(), SendFault> {
        let messages = std::mem::take(&mut self.restore.messages);
        let result = self.send_sequence(&messages, &[], Phase::Validation, true);
        self.restore.messages = messages;
        self.restore.responses = result?;
        Ok(())
    }

    /// Replays a seed against the device and records its baseline responses.
    pub fn dry_run(&mut self, seed: &mut Seed) -> Result<(), SendFault> {
        let responses = self.send_seed(&seed.messages, &[], Phase::Validation)?;
        seed.responses = responses;
        Ok(())
    }

    fn send_sequence(
        &mut self,
        messages: &[Message],
        expected: &[String],
        phase: Phase,
        during_restore: bool,
    ) -> Result<Vec<String>, SendFault> {
        let mut responses = Vec::with_capacity(messages.len());
        for (index, message) in messages.iter().enumerate() {
            let answered_before = expected.get(index).is_some_and(|r| !r.trim().is_empty());
            let message_phase = match phase {
                Phase::Live if answered_before => Phase::Live,
                _ => Phase::Validation,
            };
            match self.send(message, message_phase) {
                Outcome::Data(data) => responses.push(data),
                Outcome::Empty => responses.push(String::new()),
                Outcome::TransportError(error) => {
                    return Err(SendFault::Transport {
                        index,
                        during_restore,
                        error,
                    });
                }
                Outcome::DeviceCrash => {
                    return Err(SendFault::Crash {
                        index,
                        during_restore,
                    });
                }
            }
        }
        Ok(responses)
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::session::SessionError;
    use crate::session::test_utils::ScriptedSession;
    use std::net::TcpListener;
    use std::thread;

    fn restore_seed(content: &str) -> Seed {
        Seed::new(vec![socket_message(content)])
    }

    #[test]
    fn silence_is_retried_up_to_the_ceiling_then_empty_in_validation() {
        let transport = ScriptedTransport::new(Attempt::Silent);
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        let outcome = messenger.send(&socket_message("aa"), Phase::Validation);
        assert_eq!(outcome, Outcome::Empty);
        assert_eq!(messenger.transport().sends_of(b"aa"), 4);
    }

    #[test]
    fn silence_past_the_ceiling_is_a_crash_when_live() {
        let transport = ScriptedTransport::new(Attempt::Silent);
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        assert_eq!(
            messenger.send(&socket_message("aa"), Phase::Live),
            Outcome::DeviceCrash
        );
    }

    #[test]
    fn hard_faults_are_not_retried() {
        let transport = ScriptedTransport::new(Attempt::Fault(TransportError::Connect(
            "refused".to_string(),
        )));
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        assert!(matches!(
            messenger.send(&socket_message("aa"), Phase::Live),
            Outcome::TransportError(TransportError::Connect(_))
        ));
        assert_eq!(messenger.transport().sends_of(b"aa"), 1);
    }

    #[test]
    fn retryable_faults_become_transport_errors_after_the_ceiling() {
        let transport = ScriptedTransport::new(Attempt::RetryableFault(TransportError::Session(
            "decrypt".to_string(),
        )));
        let mut messenger = Messenger::new(transport, no_retry_delay(2), Seed::default());
        assert!(matches!(
            messenger.send(&socket_message("aa"), Phase::Validation),
            Outcome::TransportError(TransportError::Session(_))
        ));
        assert_eq!(messenger.transport().sends_of(b"aa"), 3);
    }

    #[test]
    fn blank_reply_counts_as_empty() {
        let transport = ScriptedTransport::new(Attempt::Reply("  ".to_string()));
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        assert_eq!(
            messenger.send(&socket_message("aa"), Phase::Live),
            Outcome::Empty
        );
    }

    #[test]
    fn seed_send_replays_restore_after_success() {
        let transport = ScriptedTransport::new(Attempt::Reply("ok".to_string()));
        let mut messenger = Messenger::new(transport, no_retry_delay(3), restore_seed("ff"));
        let messages = vec![socket_message("01"), socket_message("02")];
        let responses = messenger
            .send_seed(&messages, &[], Phase::Validation)
            .unwrap();
        assert_eq!(responses, vec!["ok", "ok"]);
        assert_eq!(
            messenger.transport().log,
            vec![b"01".to_vec(), b"02".to_vec(), b"ff".to_vec()]
        );
    }

    #[test]
    fn seed_send_aborts_on_fault_but_still_restores() {
        let transport = ScriptedTransport::new(Attempt::Reply("ok".to_string())).on(
            b"01",
            Attempt::Fault(TransportError::Decode("odd".to_string())),
        );
        let mut messenger = Messenger::new(transport, no_retry_delay(3), restore_seed("ff"));
        let messages = vec![socket_message("01"), socket_message("02")];
        let fault = messenger
            .send_seed(&messages, &[], Phase::Live)
            .unwrap_err();
        assert!(matches!(
            fault,
            SendFault::Transport {
                index: 0,
                during_restore: false,
                ..
            }
        ));
        assert_eq!(messenger.transport().sends_of(b"02"), 0);
        assert_eq!(messenger.transport().sends_of(b"ff"), 1);
    }

    #[test]
    fn restore_fault_is_reported_after_successful_sequence() {
        let transport = ScriptedTransport::new(Attempt::Reply("ok".to_string())).on(
            b"ff",
            Attempt::Fault(TransportError::Connect("reset".to_string())),
        );
        let mut messenger = Messenger::new(transport, no_retry_delay(0), restore_seed("ff"));
        let fault = messenger
            .send_seed(&[socket_message("01")], &[], Phase::Live)
            .unwrap_err();
        assert!(matches!(
            fault,
            SendFault::Transport {
                index: 0,
                during_restore: true,
                ..
            }
        ));
    }

    #[test]
    fn live_silence_only_crashes_messages_that_answered_before() {
        let transport = ScriptedTransport::new(Attempt::Silent);
        let mut messenger = Messenger::new(transport, no_retry_delay(1), Seed::default());
        let messages = vec![socket_message("01"), socket_message("02")];

        let expected = vec![String::new(), "was here".to_string()];
        let fault = messenger
            .send_seed(&messages, &expected, Phase::Live)
            .unwrap_err();
        assert_eq!(
            fault,
            SendFault::Crash {
                index: 1,
                during_restore: false
            }
        );
    }

    #[test]
    fn dry_run_records_responses_including_silence() {
        let transport = ScriptedTransport::new(Attempt::Reply("ok".to_string()))
            .on(b"02", Attempt::Silent);
        let mut messenger = Messenger::new(transport, no_retry_delay(1), Seed::default());
        let mut seed = Seed::new(vec![socket_message("01"), socket_message("02")]);
        messenger.dry_run(&mut seed).unwrap();
        assert_eq!(seed.responses, vec!["ok".to_string(), String::new()]);
    }

    #[test]
    fn restore_validation_learns_expectations() {
        let transport = ScriptedTransport::new(Attempt::Reply("reset-ok".to_string()));
        let mut messenger = Messenger::new(transport, no_retry_delay(0), restore_seed("ff"));
        messenger.validate_restore().unwrap();
        assert_eq!(messenger.restore_seed().responses, vec!["reset-ok"]);
        assert_eq!(messenger.restore_seed().messages.len(), 1);
    }

    #[test]
    fn hex_payload_ignores_spaces_and_rejects_garbage() {
        assert_eq!(decode_hex_payload(b"00 1f ff").unwrap(), vec![0x00, 0x1f, 0xff]);
        assert!(decode_hex_payload(b"0g").unwrap_err().is_payload_error());
        assert!(decode_hex_payload(b"abc").is_err());
    }

    #[test]
    fn socket_transport_exchanges_hex_with_a_live_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[0xde, 0xad]);
            stream.write_all(&[0xbe, 0xef]).unwrap();
        });

        let socket = SocketTransport::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            2048,
        );
        let attempt = socket.exchange("127.0.0.1", port, b"dead");
        server.join().unwrap();
        assert_eq!(attempt, Attempt::Reply("beef".to_string()));
    }

    #[test]
    fn socket_transport_reports_silence_and_closed_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            // First connection: keep it open without answering.
            let (silent, _) = listener.accept().unwrap();
            // Second connection: drain the request, then close without answering.
            let (mut closed, _) = listener.accept().unwrap();
            let mut buf = [0u8; 8];
            let _ = closed.read(&mut buf).unwrap();
            drop(closed);
            thread::sleep(Duration::from_millis(300));
            drop(silent);
        });

        let socket = SocketTransport::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            64,
        );
        assert_eq!(socket.exchange("127.0.0.1", port, b"00"), Attempt::Silent);
        assert_eq!(socket.exchange("127.0.0.1", port, b"00"), Attempt::Closed);
        server.join().unwrap();
    }

    #[test]
    fn socket_transport_rejects_bad_hex_without_connecting() {
        let socket = SocketTransport::new(Duration::from_millis(10), Duration::from_millis(10), 8);
        assert!(matches!(
            socket.exchange("127.0.0.1", 1, b"xyz"),
            Attempt::Fault(TransportError::Decode(_))
        ));
    }

    #[test]
    fn session_command_error_reopens_and_retries_within_ceiling() {
        let mut capability = ScriptedSession::new();
        capability
            .replies
            .push_back(Err(SessionError::Command("bad crc".to_string())));
        capability
            .replies
            .push_back(Ok(Some(serde_json::json!({"dps": {"1": false}}))));
        let transport = RoutedTransport::new(
            SocketTransport::new(Duration::from_millis(10), Duration::from_millis(10), 8),
            capability,
        );
        let mut messenger = Messenger::new(transport, no_retry_delay(2), Seed::default());
        let vendor = Message::from_lines(
            ["DevID:d", "LocalKey:k", "Address:10.0.0.1", "Content:{\"1\":false}"],
            &crate::input::RouteDefaults::default(),
        )
        .unwrap();

        assert_eq!(
            messenger.send(&vendor, Phase::Live),
            Outcome::Data("{\"dps\":{\"1\":false}}".to_string())
        );
        let manager = messenger.transport().session().manager();
        assert_eq!(manager.sessions_opened(), 2);
        assert_eq!(manager.capability().commands.len(), 2);
    }

    #[test]
    fn routed_transport_dispatches_on_route() {
        let mut routed = RoutedTransport::new(
            SocketTransport::new(Duration::from_millis(10), Duration::from_millis(10), 8),
            ScriptedSession::new(),
        );
        let vendor = Message::from_lines(
            ["DevID:d", "LocalKey:k", "Address:10.0.0.1", "Content:{\"1\":true}"],
            &crate::input::RouteDefaults::default(),
        )
        .unwrap();
        assert_eq!(
            routed.attempt(&vendor),
            Attempt::Reply("{\"1\":true}".to_string())
        );
        assert_eq!(routed.session().manager().sessions_opened(), 1);
        assert!(matches!(
            routed.attempt(&socket_message("zz")),
            Attempt::Fault(TransportError::Decode(_))
        ));
    }
}
