//! Connection lifecycle to the presence host.
//!
//! One Unix-socket session at a time, strict request/response per command.
//! Every socket operation carries a bounded timeout so shutdown can never
//! hang on a wedged host. Unsolicited traffic (pings, host shutdown) is
//! drained by [`PresenceTransport::poll`] between ticks.

use serde::Serialize;
use serde_json::Value;
use std::env;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{debug, info, warn};

use figma_presence_protocol::{
    decode_header, encode_frame, Activity, CloseReason, Command, Handshake, HostFrame, Opcode,
    WireError, FRAME_HEADER_BYTES,
};

/// Overrides socket discovery; used by tests.
const SOCKET_ENV: &str = "FIGMA_PRESENCE_IPC";
const SOCKET_PREFIX: &str = "discord-ipc-";
const SOCKET_SLOTS: u32 = 10;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("presence host socket not found (is the host running?)")]
    HostNotFound,

    #[error("presence host rejected the handshake: {0}")]
    Rejected(String),

    #[error("timed out waiting for presence host readiness")]
    Timeout,

    #[error("handshake I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("presence host closed the channel")]
    Disconnected,

    #[error("presence host rejected the payload: {0}")]
    Rejected(String),

    #[error("session I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

pub type DisconnectHandler = Box<dyn FnMut() + Send>;

/// Seam between the supervisor and the concrete IPC session, so supervisor
/// behavior is testable against a scripted transport.
pub trait PresenceTransport {
    fn connect(&mut self) -> Result<(), ConnectError>;
    fn publish(&mut self, activity: &Activity) -> Result<(), SessionError>;
    fn clear(&mut self) -> Result<(), SessionError>;
    /// Drains unsolicited host traffic; answers pings, notices closes.
    fn poll(&mut self);
    fn is_connected(&self) -> bool;
    fn session_epoch(&self) -> u64;
    fn on_disconnected(&mut self, handler: DisconnectHandler);
    fn close(&mut self);
}

pub struct PresenceSession {
    client_id: String,
    stream: Option<UnixStream>,
    phase: ConnectionPhase,
    session_epoch: u64,
    nonce_counter: u64,
    handler: Option<DisconnectHandler>,
}

impl PresenceSession {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            stream: None,
            phase: ConnectionPhase::Disconnected,
            session_epoch: 0,
            nonce_counter: 0,
            handler: None,
        }
    }

    /// Nonces are prefixed with the session epoch; any response carrying a
    /// nonce from a superseded login is discarded as a stale completion.
    fn next_nonce(&mut self) -> String {
        self.nonce_counter += 1;
        format!("{}.{}", self.session_epoch, self.nonce_counter)
    }

    fn try_connect(&mut self) -> Result<UnixStream, ConnectError> {
        let mut stream = open_host_socket()?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let handshake = Handshake::new(&self.client_id);
        let bytes = encode_frame(Opcode::Handshake, &handshake)?;
        stream.write_all(&bytes)?;
        stream.flush()?;

        await_ready(&mut stream)?;
        Ok(stream)
    }

    fn round_trip(&mut self, command: &Command, nonce: &str) -> Result<(), SessionError> {
        let outcome = match self.stream.as_mut() {
            None => return Err(SessionError::NotConnected),
            Some(stream) => {
                send_frame(stream, Opcode::Frame, command).and_then(|()| await_ack(stream, nonce))
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(SessionError::Disconnected) => {
                self.mark_disconnected("host closed the channel");
                Err(SessionError::Disconnected)
            }
            Err(SessionError::Io(err)) => {
                self.mark_disconnected("socket I/O failure");
                Err(SessionError::Io(err))
            }
            Err(other) => Err(other),
        }
    }

    /// Transitions to `Disconnected` and fires the registered handler.
    /// Idempotent per drop: only the first detection of a given loss fires.
    fn mark_disconnected(&mut self, reason: &str) {
        if self.phase == ConnectionPhase::Disconnected {
            return;
        }
        warn!(reason, "Presence host connection lost");
        self.phase = ConnectionPhase::Disconnected;
        self.stream = None;
        if let Some(handler) = self.handler.as_mut() {
            handler();
        }
    }
}

impl PresenceTransport for PresenceSession {
    fn connect(&mut self) -> Result<(), ConnectError> {
        self.phase = ConnectionPhase::Connecting;
        match self.try_connect() {
            Ok(stream) => {
                // Command acks get a shorter deadline than the handshake.
                let _ = stream.set_read_timeout(Some(ACK_TIMEOUT));
                self.stream = Some(stream);
                self.phase = ConnectionPhase::Connected;
                self.session_epoch += 1;
                info!(
                    epoch = self.session_epoch,
                    client_id = %self.client_id,
                    "Connected to presence host"
                );
                Ok(())
            }
            Err(err) => {
                self.phase = ConnectionPhase::Disconnected;
                self.stream = None;
                Err(err)
            }
        }
    }

    fn publish(&mut self, activity: &Activity) -> Result<(), SessionError> {
        let nonce = self.next_nonce();
        let command = Command::set_activity(process::id(), activity, nonce.clone())?;
        self.round_trip(&command, &nonce)?;
        debug!(nonce = %nonce, "Published presence payload");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SessionError> {
        let nonce = self.next_nonce();
        let command = Command::clear_activity(process::id(), nonce.clone());
        self.round_trip(&command, &nonce)?;
        debug!(nonce = %nonce, "Cleared presence payload");
        Ok(())
    }

    fn poll(&mut self) {
        let outcome = match self.stream.as_mut() {
            None => return,
            Some(stream) => poll_stream(stream),
        };
        if let PollOutcome::Lost(reason) = outcome {
            self.mark_disconnected(reason);
        }
    }

    fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    fn session_epoch(&self) -> u64 {
        self.session_epoch
    }

    fn on_disconnected(&mut self, handler: DisconnectHandler) {
        self.handler = Some(handler);
    }

    /// Best-effort clear and teardown, bounded by a short timeout. A
    /// deliberate close never fires the disconnect handler.
    fn close(&mut self) {
        let nonce = self.next_nonce();
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.set_read_timeout(Some(CLOSE_TIMEOUT));
            let _ = stream.set_write_timeout(Some(CLOSE_TIMEOUT));
            let command = Command::clear_activity(process::id(), nonce.clone());
            if send_frame(stream, Opcode::Frame, &command).is_ok() {
                let _ = await_ack(stream, &nonce);
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.phase = ConnectionPhase::Disconnected;
        self.stream = None;
    }
}

fn socket_candidates() -> Vec<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return vec![PathBuf::from(path)];
    }

    let mut bases = Vec::new();
    for var in ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"] {
        if let Ok(dir) = env::var(var) {
            bases.push(PathBuf::from(dir));
        }
    }
    bases.push(PathBuf::from("/tmp"));

    let mut candidates = Vec::new();
    for base in bases {
        // Flatpak and snap installs of the host nest the socket one level down.
        for sub in ["", "app/com.discord", "snap.discord"] {
            let dir = if sub.is_empty() {
                base.clone()
            } else {
                base.join(sub)
            };
            for slot in 0..SOCKET_SLOTS {
                candidates.push(dir.join(format!("{SOCKET_PREFIX}{slot}")));
            }
        }
    }
    candidates
}

fn open_host_socket() -> Result<UnixStream, ConnectError> {
    for candidate in socket_candidates() {
        match UnixStream::connect(&candidate) {
            Ok(stream) => {
                debug!(path = %candidate.display(), "Presence host socket found");
                return Ok(stream);
            }
            Err(err) => {
                debug!(path = %candidate.display(), error = %err, "Socket candidate unavailable");
            }
        }
    }
    Err(ConnectError::HostNotFound)
}

fn send_frame<T: Serialize>(
    stream: &mut UnixStream,
    opcode: Opcode,
    payload: &T,
) -> Result<(), SessionError> {
    let bytes = encode_frame(opcode, payload)?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut UnixStream) -> Result<(Opcode, Vec<u8>), SessionError> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    read_exact_or_disconnect(stream, &mut header)?;
    let (opcode, length) = decode_header(header)?;
    let mut payload = vec![0u8; length];
    read_exact_or_disconnect(stream, &mut payload)?;
    Ok((opcode, payload))
}

fn read_exact_or_disconnect(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), SessionError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(SessionError::Disconnected),
        Err(err) => Err(SessionError::Io(err)),
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn answer_ping(stream: &mut UnixStream, payload: &[u8]) -> Result<(), SessionError> {
    let value: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    send_frame(stream, Opcode::Pong, &value)
}

/// Reads frames until the host signals readiness or rejects the handshake.
fn await_ready(stream: &mut UnixStream) -> Result<(), ConnectError> {
    loop {
        match read_frame(stream) {
            Ok((Opcode::Frame, payload)) => {
                let frame: HostFrame = serde_json::from_slice(&payload).map_err(WireError::Json)?;
                if frame.is_ready() {
                    return Ok(());
                }
                debug!(evt = ?frame.evt, "Ignoring pre-ready host frame");
            }
            Ok((Opcode::Ping, payload)) => {
                if let Err(err) = answer_ping(stream, &payload) {
                    warn!(error = %err, "Failed to answer host ping during handshake");
                }
            }
            Ok((Opcode::Close, payload)) => {
                let reason: CloseReason = serde_json::from_slice(&payload).unwrap_or(CloseReason {
                    code: None,
                    message: None,
                });
                return Err(ConnectError::Rejected(
                    reason
                        .message
                        .unwrap_or_else(|| "connection closed".to_string()),
                ));
            }
            Ok((opcode, _)) => {
                debug!(?opcode, "Ignoring unexpected frame during handshake");
            }
            Err(SessionError::Io(err)) if is_timeout(&err) => return Err(ConnectError::Timeout),
            Err(SessionError::Disconnected) => {
                return Err(ConnectError::Rejected("host closed the channel".to_string()));
            }
            Err(SessionError::Io(err)) => return Err(ConnectError::Io(err)),
            Err(SessionError::Wire(err)) => return Err(ConnectError::Wire(err)),
            Err(other) => return Err(ConnectError::Rejected(other.to_string())),
        }
    }
}

/// Reads frames until the one acknowledging `nonce` arrives. Frames carrying
/// a different nonce are stale completions from a superseded session (or
/// unsolicited events) and are discarded.
fn await_ack(stream: &mut UnixStream, nonce: &str) -> Result<(), SessionError> {
    loop {
        let (opcode, payload) = read_frame(stream)?;
        match opcode {
            Opcode::Ping => {
                answer_ping(stream, &payload)?;
            }
            Opcode::Close => return Err(SessionError::Disconnected),
            Opcode::Frame => {
                let frame: HostFrame = serde_json::from_slice(&payload).map_err(WireError::Json)?;
                match frame.nonce.as_deref() {
                    Some(ack) if ack == nonce => {
                        if frame.is_error() {
                            return Err(SessionError::Rejected(
                                frame
                                    .error_message()
                                    .unwrap_or_else(|| "unknown error".to_string()),
                            ));
                        }
                        return Ok(());
                    }
                    _ => {
                        debug!(nonce = ?frame.nonce, "Discarding stale or unsolicited frame");
                    }
                }
            }
            opcode => {
                debug!(?opcode, "Ignoring unexpected frame while awaiting ack");
            }
        }
    }
}

enum PollOutcome {
    Quiet,
    Lost(&'static str),
}

fn poll_stream(stream: &mut UnixStream) -> PollOutcome {
    if stream.set_nonblocking(true).is_err() {
        return PollOutcome::Lost("socket unusable");
    }
    let outcome = drain_pending(stream);
    let _ = stream.set_nonblocking(false);
    outcome
}

fn drain_pending(stream: &mut UnixStream) -> PollOutcome {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    loop {
        match stream.peek(&mut header) {
            Ok(0) => return PollOutcome::Lost("host closed the channel"),
            Ok(n) if n < FRAME_HEADER_BYTES => return PollOutcome::Quiet,
            Ok(_) => {
                let _ = stream.set_nonblocking(false);
                match read_frame(stream) {
                    Ok((Opcode::Ping, payload)) => {
                        if let Err(err) = answer_ping(stream, &payload) {
                            warn!(error = %err, "Failed to answer host ping");
                        }
                    }
                    Ok((Opcode::Close, _)) => return PollOutcome::Lost("host closed the channel"),
                    Ok((opcode, _)) => {
                        debug!(?opcode, "Ignoring unsolicited frame");
                    }
                    Err(_) => return PollOutcome::Lost("socket I/O failure"),
                }
                if stream.set_nonblocking(true).is_err() {
                    return PollOutcome::Quiet;
                }
            }
            Err(err) if is_timeout(&err) => return PollOutcome::Quiet,
            Err(_) => return PollOutcome::Lost("socket I/O failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};
    use tempfile::TempDir;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = env::var(key).ok();
            env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn bind_host() -> (UnixListener, TempDir, EnvGuard) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discord-ipc-0");
        let listener = UnixListener::bind(&path).unwrap();
        let guard = EnvGuard::set(SOCKET_ENV, path.to_str().unwrap());
        (listener, dir, guard)
    }

    fn read_raw_frame(stream: &mut UnixStream) -> (Opcode, Value) {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        stream.read_exact(&mut header).unwrap();
        let (opcode, length) = decode_header(header).unwrap();
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).unwrap();
        (opcode, serde_json::from_slice(&payload).unwrap())
    }

    fn write_raw_frame(stream: &mut UnixStream, opcode: Opcode, value: &Value) {
        let bytes = encode_frame(opcode, value).unwrap();
        stream.write_all(&bytes).unwrap();
        stream.flush().unwrap();
    }

    fn ready_value() -> Value {
        json!({ "cmd": "DISPATCH", "evt": "READY", "data": { "v": 1 } })
    }

    fn accept_and_handshake(listener: &UnixListener) -> UnixStream {
        let (mut stream, _) = listener.accept().unwrap();
        let (opcode, value) = read_raw_frame(&mut stream);
        assert_eq!(opcode, Opcode::Handshake);
        assert_eq!(value["client_id"], json!("1234"));
        write_raw_frame(&mut stream, Opcode::Frame, &ready_value());
        stream
    }

    fn sample_activity() -> Activity {
        use figma_presence_protocol::Timestamps;
        Activity {
            details: "Designing".to_string(),
            state: "Working".to_string(),
            timestamps: Timestamps { start: 1 },
            assets: None,
            buttons: None,
            instance: false,
        }
    }

    #[test]
    fn connect_performs_handshake_and_bumps_epoch() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let _stream = accept_and_handshake(&listener);
        });

        let mut session = PresenceSession::new("1234");
        session.connect().unwrap();
        assert!(session.is_connected());
        assert_eq!(session.session_epoch(), 1);
        server.join().unwrap();
    }

    #[test]
    fn connect_surfaces_handshake_rejection() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (opcode, _) = read_raw_frame(&mut stream);
            assert_eq!(opcode, Opcode::Handshake);
            write_raw_frame(
                &mut stream,
                Opcode::Close,
                &json!({ "code": 4000, "message": "Invalid Client ID" }),
            );
        });

        let mut session = PresenceSession::new("1234");
        let err = session.connect().unwrap_err();
        assert!(matches!(err, ConnectError::Rejected(message) if message == "Invalid Client ID"));
        assert!(!session.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn connect_fails_when_no_socket_exists() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("discord-ipc-0");
        let _env = EnvGuard::set(SOCKET_ENV, missing.to_str().unwrap());

        let mut session = PresenceSession::new("1234");
        assert!(matches!(
            session.connect(),
            Err(ConnectError::HostNotFound)
        ));
    }

    #[test]
    fn publish_without_connection_is_an_error() {
        let mut session = PresenceSession::new("1234");
        assert!(matches!(
            session.publish(&sample_activity()),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn publish_round_trips_a_set_activity_command() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let captured = Arc::new(Mutex::new(None::<Value>));
        let captured_clone = Arc::clone(&captured);
        let server = std::thread::spawn(move || {
            let mut stream = accept_and_handshake(&listener);
            let (opcode, value) = read_raw_frame(&mut stream);
            assert_eq!(opcode, Opcode::Frame);
            let nonce = value["nonce"].clone();
            *captured_clone.lock().unwrap() = Some(value);
            write_raw_frame(
                &mut stream,
                Opcode::Frame,
                &json!({ "cmd": "SET_ACTIVITY", "nonce": nonce, "data": null }),
            );
        });

        let mut session = PresenceSession::new("1234");
        session.connect().unwrap();
        session.publish(&sample_activity()).unwrap();
        server.join().unwrap();

        let value = captured.lock().unwrap().take().unwrap();
        assert_eq!(value["cmd"], json!("SET_ACTIVITY"));
        assert_eq!(value["args"]["activity"]["details"], json!("Designing"));
    }

    #[test]
    fn publish_surfaces_host_rejection() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let mut stream = accept_and_handshake(&listener);
            let (_, value) = read_raw_frame(&mut stream);
            let nonce = value["nonce"].clone();
            write_raw_frame(
                &mut stream,
                Opcode::Frame,
                &json!({
                    "evt": "ERROR",
                    "nonce": nonce,
                    "data": { "code": 4000, "message": "Invalid Asset" }
                }),
            );
        });

        let mut session = PresenceSession::new("1234");
        session.connect().unwrap();
        let err = session.publish(&sample_activity()).unwrap_err();
        assert!(matches!(err, SessionError::Rejected(message) if message == "Invalid Asset"));
        server.join().unwrap();
    }

    #[test]
    fn stale_nonce_frames_are_discarded_before_the_ack() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let mut stream = accept_and_handshake(&listener);
            let (_, value) = read_raw_frame(&mut stream);
            let nonce = value["nonce"].clone();
            // A completion from a superseded session arrives first.
            write_raw_frame(
                &mut stream,
                Opcode::Frame,
                &json!({ "cmd": "SET_ACTIVITY", "nonce": "0.99", "data": null }),
            );
            write_raw_frame(
                &mut stream,
                Opcode::Frame,
                &json!({ "cmd": "SET_ACTIVITY", "nonce": nonce, "data": null }),
            );
        });

        let mut session = PresenceSession::new("1234");
        session.connect().unwrap();
        session.publish(&sample_activity()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn poll_notices_host_close_and_fires_handler_once() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let stream = accept_and_handshake(&listener);
            drop(stream);
        });

        let mut session = PresenceSession::new("1234");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        session.on_disconnected(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        session.connect().unwrap();
        server.join().unwrap();

        session.poll();
        assert!(!session.is_connected());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second poll on an already-lost session must not re-fire.
        session.poll();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_increments_the_session_epoch() {
        let _lock = env_lock();
        let (listener, _dir, _env) = bind_host();

        let server = std::thread::spawn(move || {
            let stream = accept_and_handshake(&listener);
            drop(stream);
            let _second = accept_and_handshake(&listener);
        });

        let mut session = PresenceSession::new("1234");
        session.connect().unwrap();
        assert_eq!(session.session_epoch(), 1);

        session.poll();
        while session.is_connected() {
            session.poll();
        }

        session.connect().unwrap();
        assert_eq!(session.session_epoch(), 2);
        server.join().unwrap();
    }
}
