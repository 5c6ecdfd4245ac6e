//! One WebSocket connection: state machine, read loop and write path.
//!
//! ```text
//! Connecting --handshake ok--> Open --close sent/received--> Closing --> Closed
//!      |                        |                                          ^
//!      +------ failure ---------+------------- protocol error -------------+
//! ```
//!
//! The read loop ([`Connection::run`]) is the only reader of the socket and
//! runs on the connection's own thread. Writes from any thread go through a
//! single lock, so frames from concurrent senders never interleave on the
//! wire. A third socket handle is kept for shutdown, and
//! [`Connection::force_close`] only ever try-locks the writer, so teardown
//! never waits behind a blocked writer.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::close::{close_frame, parse_close_payload, CloseCode};
use crate::error::{ProtocolViolation, WsError};
use crate::frame::{decode_frame, fragment, write_frame, Frame, Opcode, MAX_CONTROL_PAYLOAD};
use crate::message::{Message, MessageKind, Reassembler};
use crate::transport::Socket;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity. Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Per-connection limits and timers, taken from the server config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// A connection with no inbound traffic for this long is dead.
    pub stale_after: Duration,
    /// How long to wait for the peer's close frame after sending ours.
    pub close_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        ConnectionLimits {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            stale_after: Duration::from_secs(90),
            close_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    client_id: String,
    route: String,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last inbound frame.
    last_activity_ms: AtomicU64,
    close_sent: AtomicBool,
    /// Milliseconds since `epoch` when our close frame went out.
    close_sent_ms: AtomicU64,
    writer: Mutex<Box<dyn Socket>>,
    control: Box<dyn Socket>,
    limits: ConnectionLimits,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("route", &self.route)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap `socket` in a connection in the `Connecting` state.
    ///
    /// The connection keeps its own handles for writing and shutdown; the
    /// caller keeps `socket` as the read half for [`Connection::run`].
    pub fn new(
        id: ConnectionId,
        client_id: impl Into<String>,
        route: impl Into<String>,
        socket: &dyn Socket,
        limits: ConnectionLimits,
    ) -> Result<Self, WsError> {
        Ok(Connection {
            id,
            client_id: client_id.into(),
            route: route.into(),
            peer: socket.peer_addr(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            close_sent: AtomicBool::new(false),
            close_sent_ms: AtomicU64::new(0),
            writer: Mutex::new(socket.try_clone_socket()?),
            control: socket.try_clone_socket()?,
            limits,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Connecting -> Open`, once the 101 response is on the wire.
    pub(crate) fn mark_open(&self) -> bool {
        self.touch();
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Pure observation used by the registry sweep.
    ///
    /// `Closed` is never alive. A `Closing` connection is alive until the
    /// close timeout runs out; anything else until it goes stale.
    pub fn is_alive(&self) -> bool {
        match self.state() {
            ConnectionState::Closed => false,
            ConnectionState::Closing if self.close_sent.load(Ordering::Acquire) => {
                let sent = self.close_sent_ms.load(Ordering::Acquire);
                Duration::from_millis(self.now_ms().saturating_sub(sent)) <= self.limits.close_timeout
            }
            _ => self.idle_for() <= self.limits.stale_after,
        }
    }

    /// Open and quiet for more than half the staleness window.
    pub(crate) fn needs_heartbeat(&self) -> bool {
        self.state() == ConnectionState::Open && self.idle_for() > self.limits.stale_after / 2
    }

    /// Write raw bytes ahead of any frame traffic (the handshake response).
    pub(crate) fn write_raw(&self, bytes: &[u8]) -> Result<(), WsError> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Write data frames in one lock hold. Fails unless `Open`.
    fn send_data(&self, frames: &[Frame]) -> Result<(), WsError> {
        let mut writer = self.writer.lock();
        let state = self.state();
        if state != ConnectionState::Open || self.close_sent.load(Ordering::Acquire) {
            return Err(WsError::NotOpen(state));
        }
        for frame in frames {
            write_frame(&mut *writer, frame)?;
        }
        Ok(())
    }

    pub fn send(&self, message: &Message) -> Result<(), WsError> {
        self.send_data(&[Frame::new(message.kind.opcode(), message.payload.as_slice())])
    }

    pub fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_data(&[Frame::text(text)])
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_data(&[Frame::binary(data)])
    }

    /// Send one message split into frames of at most `max_fragment` bytes.
    pub fn send_fragmented(
        &self,
        kind: MessageKind,
        payload: &[u8],
        max_fragment: usize,
    ) -> Result<(), WsError> {
        self.send_data(&fragment(kind.opcode(), payload, max_fragment))
    }

    pub fn ping(&self, payload: &[u8]) -> Result<(), WsError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolViolation::ControlPayloadTooLarge(payload.len() as u64).into());
        }
        self.send_control(Frame::ping(payload))
    }

    /// Control frames may go out while `Open`, or `Closing` before our
    /// close frame was sent.
    fn send_control(&self, frame: Frame) -> Result<(), WsError> {
        let mut writer = self.writer.lock();
        let state = self.state();
        if !matches!(state, ConnectionState::Open | ConnectionState::Closing)
            || self.close_sent.load(Ordering::Acquire)
        {
            return Err(WsError::NotOpen(state));
        }
        write_frame(&mut *writer, &frame)
    }

    /// Write our close frame. At most one is ever sent per connection.
    fn send_close(&self, code: CloseCode, reason: &str) -> Result<bool, WsError> {
        let mut writer = self.writer.lock();
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.close_sent_ms.store(self.now_ms(), Ordering::Release);
        write_frame(&mut *writer, &close_frame(code, reason))?;
        Ok(true)
    }

    /// Start the closing handshake: `Open -> Closing`, send a close frame
    /// and wait at most the close timeout for the peer's reply.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        if !self.transition(ConnectionState::Open, ConnectionState::Closing) {
            return Err(WsError::NotOpen(self.state()));
        }
        debug!(conn_id = %self.id, code = code.as_u16(), reason, "closing connection");
        self.send_close(code, reason)?;
        self.control.set_read_timeout(Some(self.limits.close_timeout))?;
        Ok(())
    }

    /// Tear down without waiting for the peer: best-effort close frame,
    /// then `Closed` and socket shutdown. Unblocks the read loop.
    ///
    /// Never blocks on the writer lock. If another thread is stuck in a
    /// write, the close frame is skipped and the shutdown releases it.
    pub fn force_close(&self, code: CloseCode, reason: &str) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if code.is_sendable() {
            match self.writer.try_lock() {
                Some(mut writer) => {
                    if !self.close_sent.swap(true, Ordering::AcqRel) {
                        self.close_sent_ms.store(self.now_ms(), Ordering::Release);
                        let _ = write_frame(&mut *writer, &close_frame(code, reason));
                    }
                }
                None => debug!(conn_id = %self.id, "writer busy, skipping close frame"),
            }
        }
        self.mark_closed();
        let _ = self.control.shutdown();
    }

    /// Run the read loop until the connection closes. Returns the close
    /// code the connection ended with.
    ///
    /// `deliver` receives every complete application message, in order.
    /// The socket is shut down and the state is `Closed` on return.
    pub fn run<F>(&self, mut reader: Box<dyn Socket>, mut deliver: F) -> CloseCode
    where
        F: FnMut(Message),
    {
        let mut reassembler = Reassembler::new(self.limits.max_message_size);
        let max_frame = self.limits.max_frame_size as u64;

        let code = loop {
            if self.state() == ConnectionState::Closed {
                break CloseCode::Abnormal;
            }
            let frame = match decode_frame(&mut reader, max_frame) {
                Ok(frame) => frame,
                Err(e) if e.is_timeout() && self.state() == ConnectionState::Closing => {
                    debug!(conn_id = %self.id, "close handshake timed out");
                    break CloseCode::Abnormal;
                }
                Err(e) => break self.fail(e),
            };
            self.touch();
            trace!(conn_id = %self.id, opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");

            match self.handle_frame(frame, &mut reassembler, &mut deliver) {
                Ok(Some(code)) => break code,
                Ok(None) => {}
                Err(e) => break self.fail(e),
            }
        };

        self.mark_closed();
        let _ = self.control.shutdown();
        debug!(conn_id = %self.id, client_id = %self.client_id, code = code.as_u16(), "connection closed");
        code
    }

    /// Returns `Some(code)` once the close handshake is complete.
    fn handle_frame<F>(
        &self,
        frame: Frame,
        reassembler: &mut Reassembler,
        deliver: &mut F,
    ) -> Result<Option<CloseCode>, WsError>
    where
        F: FnMut(Message),
    {
        match frame.opcode {
            Opcode::Ping => {
                if !self.close_sent.load(Ordering::Acquire) {
                    self.send_control(Frame::pong(frame.payload))?;
                }
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let received = parse_close_payload(&frame.payload)?;
                debug!(
                    conn_id = %self.id,
                    code = received.code.as_u16(),
                    reason = %received.reason,
                    "close frame received"
                );
                self.transition(ConnectionState::Open, ConnectionState::Closing);
                let reply = match received.code {
                    CloseCode::NoStatus => CloseCode::Normal,
                    code => code,
                };
                // A failed echo still ends the handshake from our side.
                let _ = self.send_close(reply, "");
                Ok(Some(received.code))
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                if self.state() != ConnectionState::Open {
                    return Ok(None);
                }
                if let Some(message) = reassembler.push(frame)? {
                    deliver(message);
                }
                Ok(None)
            }
        }
    }

    /// Map a read-loop failure to its close code, telling the peer when the
    /// code may go on the wire.
    fn fail(&self, error: WsError) -> CloseCode {
        let code = error.close_code();
        match &error {
            WsError::EndOfStream { .. } | WsError::Io(_) => {
                debug!(conn_id = %self.id, error = %error, "connection dropped");
            }
            _ => {
                warn!(conn_id = %self.id, code = code.as_u16(), error = %error, "protocol failure");
            }
        }
        if code.is_sendable() {
            let _ = self.send_close(code, &error.to_string());
        }
        code
    }
}
