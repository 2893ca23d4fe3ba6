//! Low-level control-port connection.
//!
//! This module speaks the line-based control protocol: it frames the inbound
//! byte stream into replies, matches synchronous replies to the commands that
//! caused them, and routes asynchronous notifications to subscribers.
//!
//! # Overview
//!
//! - **[`ReplyFramer`]**: sans-IO framing of bytes into [`ControlReply`] values
//! - **[`ControlConnection`]**: connection state, outbound buffer, FIFO handler
//!   queue and notification subscribers, driven by [`ControlConnection::next_event`]
//! - **[`Dialer`]**: how a connection reaches the control port ([`TcpDialer`]
//!   in production)
//!
//! # Framing
//!
//! ```text
//! 250-AUTH METHODS=NULL\r\n        ◄── '-' : more lines follow
//! 250-VERSION Tor="0.4.8.9"\r\n
//! 250 OK\r\n                       ◄── ' ' : final line, dispatch reply
//! ```
//!
//! The status code is taken from the first line of a reply. Lines shorter than
//! four bytes are ignored. If the unframed remainder of the input grows past
//! [`MAX_LINE_LENGTH`] the connection is dropped.
//!
//! # Dispatch
//!
//! ```text
//!                 ┌──────────────────┐
//!   final line ──▶│ code >= 600 ?    │── yes ──▶ notification subscribers
//!                 └────────┬─────────┘
//!                          │ no
//!                          ▼
//!                 ┌──────────────────┐
//!                 │ handler queued ? │── no ───▶ log, count, drop
//!                 └────────┬─────────┘
//!                          │ yes
//!                          ▼
//!              ConnectionEvent::Reply(oldest handler, reply)
//! ```
//!
//! Handlers are plain values of the caller's choosing (`H`); the caller decides
//! what to do when one comes back paired with its reply.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::reply::ControlReply;

/// Maximum number of buffered bytes without a line terminator.
///
/// The control protocol puts no limit on line length; this bound only keeps a
/// misbehaving peer from exhausting memory.
pub const MAX_LINE_LENGTH: usize = 100_000;

const READ_CHUNK_SIZE: usize = 4096;

/// Splits a control-port byte stream into complete replies.
#[derive(Debug, Default)]
pub struct ReplyFramer {
    buffer: Vec<u8>,
    message: ControlReply,
}

impl ReplyFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every reply completed by it, in order.
    ///
    /// Lines end at `\n`, with an optional preceding `\r`. Incomplete input is
    /// kept for the next call; check [`is_overflowing`](Self::is_overflowing)
    /// afterwards.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ControlReply> {
        self.buffer.extend_from_slice(data);
        let mut replies = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() < 4 {
                continue;
            }

            if self.message.lines.is_empty() {
                self.message.code = std::str::from_utf8(&line[..3])
                    .ok()
                    .and_then(|code| code.parse().ok())
                    .unwrap_or(0);
            }
            self.message
                .lines
                .push(String::from_utf8_lossy(&line[4..]).into_owned());

            if line[3] == b' ' {
                replies.push(std::mem::take(&mut self.message));
            }
        }

        replies
    }

    /// Returns true once the unframed remainder exceeds [`MAX_LINE_LENGTH`].
    pub fn is_overflowing(&self) -> bool {
        self.buffer.len() > MAX_LINE_LENGTH
    }

    /// Number of buffered bytes not yet forming a complete line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards buffered input and any partially received reply.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message.clear();
    }
}

/// Opens the byte stream to a control port.
pub trait Dialer {
    /// Stream type produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Connects to `addr`.
    fn dial(&mut self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>>;
}

/// Dials control ports over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial(&mut self, addr: SocketAddr) -> impl Future<Output = io::Result<TcpStream>> {
        TcpStream::connect(addr)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// A target is set and the transport connect is in progress.
    Connecting,
    /// The transport is up and commands may be sent.
    Connected,
}

/// Something the owner of a [`ControlConnection`] must react to.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent<H> {
    /// The transport connected.
    Connected,
    /// A synchronous reply completed; `H` is the handler queued with its command.
    Reply(H, ControlReply),
    /// The connection failed, hit EOF, or was force-closed.
    Disconnected,
}

/// One connection to a control port.
pub struct ControlConnection<H, D: Dialer = TcpDialer> {
    dialer: D,
    state: ConnectionState,
    target: Option<SocketAddr>,
    stream: Option<D::Stream>,
    framer: ReplyFramer,
    handlers: VecDeque<H>,
    outbound: Vec<u8>,
    ready: VecDeque<ConnectionEvent<H>>,
    subscribers: Vec<mpsc::UnboundedSender<ControlReply>>,
    unexpected_replies: u64,
}

impl<H> ControlConnection<H, TcpDialer> {
    /// Creates a disconnected TCP control connection.
    pub fn tcp() -> Self {
        Self::new(TcpDialer)
    }
}

impl<H, D: Dialer> ControlConnection<H, D> {
    /// Creates a disconnected connection that uses `dialer` to reach the port.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            state: ConnectionState::Disconnected,
            target: None,
            stream: None,
            framer: ReplyFramer::new(),
            handlers: VecDeque::new(),
            outbound: Vec::new(),
            ready: VecDeque::new(),
            subscribers: Vec::new(),
            unexpected_replies: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Starts connecting to `target` (`host:port`).
    ///
    /// Fails with [`Error::InvalidTarget`] without touching any state if the
    /// target does not parse. An existing connection is torn down first. The
    /// outcome is reported by [`next_event`](Self::next_event).
    pub fn connect(&mut self, target: &str) -> Result<()> {
        let addr: SocketAddr = target.parse().map_err(|_| {
            plog(
                LogLevel::Warn,
                &format!("tor: Error parsing socket address {}", target),
            );
            Error::InvalidTarget(target.to_string())
        })?;

        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }
        self.target = Some(addr);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Drops the socket, buffered input, unsent output and pending handlers.
    ///
    /// Safe to call in any state. Does not produce a
    /// [`ConnectionEvent::Disconnected`].
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        self.framer.reset();
        self.handlers.clear();
        self.outbound.clear();
        self.ready.clear();
    }

    /// Queues `cmd` (a CRLF is appended) and registers `handler` for its reply.
    ///
    /// Fails with [`Error::NotConnected`] unless connected. Commands are never
    /// resent.
    pub fn send_command(&mut self, cmd: &str, handler: H) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.outbound.extend_from_slice(cmd.as_bytes());
        self.outbound.extend_from_slice(b"\r\n");
        self.handlers.push_back(handler);
        Ok(())
    }

    /// Registers a new receiver for asynchronous notifications (code >= 600).
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ControlReply> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Number of commands still waiting for their reply.
    pub fn pending_commands(&self) -> usize {
        self.handlers.len()
    }

    /// Synchronous replies that arrived with no command waiting for them.
    pub fn unexpected_replies(&self) -> u64 {
        self.unexpected_replies
    }

    /// Waits for the next event on this connection.
    ///
    /// Drives the transport: completes a pending connect, flushes queued
    /// commands and reads input. While disconnected this never resolves.
    pub async fn next_event(&mut self) -> ConnectionEvent<H> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return event;
            }

            match self.state {
                ConnectionState::Disconnected => std::future::pending::<()>().await,
                ConnectionState::Connecting => {
                    let Some(addr) = self.target else {
                        self.disconnect();
                        return ConnectionEvent::Disconnected;
                    };
                    match self.dialer.dial(addr).await {
                        Ok(stream) => {
                            self.stream = Some(stream);
                            self.state = ConnectionState::Connected;
                            plog(LogLevel::Debug, "tor: Successfully connected!");
                            return ConnectionEvent::Connected;
                        }
                        Err(e) => {
                            plog(
                                LogLevel::Debug,
                                &format!("tor: Error connecting to control socket: {}", e),
                            );
                            self.disconnect();
                            return ConnectionEvent::Disconnected;
                        }
                    }
                }
                ConnectionState::Connected => {
                    if let Err(e) = self.flush().await {
                        plog(
                            LogLevel::Debug,
                            &format!("tor: Error writing to control socket: {}", e),
                        );
                        self.disconnect();
                        return ConnectionEvent::Disconnected;
                    }

                    let Some(stream) = self.stream.as_mut() else {
                        self.disconnect();
                        return ConnectionEvent::Disconnected;
                    };
                    let mut buf = [0u8; READ_CHUNK_SIZE];
                    match stream.read(&mut buf).await {
                        Ok(0) => {
                            plog(LogLevel::Debug, "tor: End of stream");
                            self.disconnect();
                            return ConnectionEvent::Disconnected;
                        }
                        Ok(n) => self.receive(&buf[..n]),
                        Err(e) => {
                            plog(
                                LogLevel::Debug,
                                &format!("tor: Error reading from control socket: {}", e),
                            );
                            self.disconnect();
                            return ConnectionEvent::Disconnected;
                        }
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.outbound.is_empty() {
            let n = stream.write(&self.outbound).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.outbound.drain(..n);
        }
        stream.flush().await
    }

    fn receive(&mut self, data: &[u8]) {
        for reply in self.framer.feed(data) {
            if reply.is_async() {
                self.notify(reply);
            } else if let Some(handler) = self.handlers.pop_front() {
                self.ready.push_back(ConnectionEvent::Reply(handler, reply));
            } else {
                self.unexpected_replies += 1;
                plog(
                    LogLevel::Debug,
                    &format!("tor: Received unexpected sync reply {}", reply.code),
                );
            }
        }

        if self.framer.is_overflowing() {
            plog(
                LogLevel::Notice,
                &format!(
                    "tor: Disconnecting: {}",
                    Error::LineTooLong(MAX_LINE_LENGTH)
                ),
            );
            self.disconnect();
            self.ready.push_back(ConnectionEvent::Disconnected);
        }
    }

    fn notify(&mut self, reply: ControlReply) {
        self.subscribers.retain(|tx| tx.send(reply.clone()).is_ok());
    }
}


#[cfg(test)]
mod tests {
    use super::testing::DuplexDialer;
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn lines(reply: &ControlReply) -> Vec<&str> {
        reply.lines.iter().map(String::as_str).collect()
    }

    async fn connected(
        dialer: DuplexDialer,
    ) -> ControlConnection<u32, DuplexDialer> {
        let mut conn = ControlConnection::new(dialer);
        conn.connect("127.0.0.1:9051").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.next_event().await, ConnectionEvent::Connected);
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn
    }

    #[test]
    fn test_framer_multiline_reply() {
        let mut framer = ReplyFramer::new();
        let replies = framer.feed(b"250-AUTH METHODS=NULL\r\n250 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 250);
        assert_eq!(lines(&replies[0]), vec!["AUTH METHODS=NULL", "OK"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_framer_byte_at_a_time() {
        let mut framer = ReplyFramer::new();
        let input = b"250-ServiceID=abc\r\n250-PrivateKey=xyz\r\n250 OK\r\n";
        let mut replies = Vec::new();
        for b in input.iter() {
            replies.extend(framer.feed(std::slice::from_ref(b)));
        }
        assert_eq!(replies.len(), 1);
        assert_eq!(lines(&replies[0]), vec!["ServiceID=abc", "PrivateKey=xyz", "OK"]);
    }

    #[test]
    fn test_framer_ignores_short_lines() {
        let mut framer = ReplyFramer::new();
        let replies = framer.feed(b"\r\n25\r\n250\r\n250 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(lines(&replies[0]), vec!["OK"]);
    }

    #[test]
    fn test_framer_code_taken_from_first_line() {
        let mut framer = ReplyFramer::new();
        let replies = framer.feed(b"250-first\r\n999 last\r\n");
        assert_eq!(replies[0].code, 250);
    }

    #[test]
    fn test_framer_accepts_bare_lf() {
        let mut framer = ReplyFramer::new();
        let replies = framer.feed(b"510 Unrecognized command\n");
        assert_eq!(replies[0].code, 510);
        assert_eq!(lines(&replies[0]), vec!["Unrecognized command"]);
    }

    #[test]
    fn test_framer_several_replies_in_one_chunk() {
        let mut framer = ReplyFramer::new();
        let replies = framer.feed(b"250 one\r\n650 event\r\n515 bad\r\n250 par");
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[1].code, 650);
        assert_eq!(replies[2].code, 515);
        assert_eq!(framer.buffered(), 7);
    }

    #[test]
    fn test_framer_overflow() {
        let mut framer = ReplyFramer::new();
        framer.feed(&vec![b'a'; MAX_LINE_LENGTH]);
        assert!(!framer.is_overflowing());
        framer.feed(b"a");
        assert!(framer.is_overflowing());
        framer.reset();
        assert!(!framer.is_overflowing());
    }

    #[test]
    fn test_connect_rejects_bad_target() {
        let mut conn: ControlConnection<u32, _> = ControlConnection::new(DuplexDialer::default());
        assert!(matches!(
            conn.connect("not an address"),
            Err(Error::InvalidTarget(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_requires_connection() {
        let mut conn: ControlConnection<u32, _> = ControlConnection::new(DuplexDialer::default());
        assert!(matches!(
            conn.send_command("PROTOCOLINFO 1", 1),
            Err(Error::NotConnected)
        ));
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_refused_connect_reports_disconnect() {
        let mut conn: ControlConnection<u32, _> = ControlConnection::new(DuplexDialer::default());
        conn.connect("127.0.0.1:9051").unwrap();
        assert_eq!(conn.next_event().await, ConnectionEvent::Disconnected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_replies_matched_in_command_order() {
        let (dialer, server) = DuplexDialer::pair();
        let mut conn = connected(dialer).await;

        conn.send_command("PROTOCOLINFO 1", 1).unwrap();
        conn.send_command("GETINFO version", 2).unwrap();

        let (read, mut write) = tokio::io::split(server);
        let daemon = tokio::spawn(async move {
            let mut reader = BufReader::new(read).lines();
            let first = reader.next_line().await.unwrap().unwrap();
            let second = reader.next_line().await.unwrap().unwrap();
            write
                .write_all(b"250 first\r\n250-second\r\n250 OK\r\n")
                .await
                .unwrap();
            (first, second, reader, write)
        });

        match conn.next_event().await {
            ConnectionEvent::Reply(h, reply) => {
                assert_eq!(h, 1);
                assert_eq!(lines(&reply), vec!["first"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match conn.next_event().await {
            ConnectionEvent::Reply(h, reply) => {
                assert_eq!(h, 2);
                assert_eq!(lines(&reply), vec!["second", "OK"]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let (first, second, _reader, _write) = daemon.await.unwrap();
        assert_eq!(first, "PROTOCOLINFO 1");
        assert_eq!(second, "GETINFO version");
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_notifications_bypass_handler_queue() {
        let (dialer, mut server) = DuplexDialer::pair();
        let mut conn = connected(dialer).await;
        let mut events = conn.subscribe();
        let mut second_observer = conn.subscribe();

        conn.send_command("ADD_ONION NEW:ED25519-V3 Port=1,127.0.0.1:1", 7)
            .unwrap();
        server
            .write_all(b"650-STATUS_GENERAL NOTICE\r\n650 more\r\n250 OK\r\n")
            .await
            .unwrap();

        match conn.next_event().await {
            ConnectionEvent::Reply(h, reply) => {
                assert_eq!(h, 7);
                assert_eq!(reply.code, 250);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event = events.try_recv().unwrap();
        assert_eq!(event.code, 650);
        assert_eq!(lines(&event), vec!["STATUS_GENERAL NOTICE", "more"]);
        assert_eq!(second_observer.try_recv().unwrap(), event);
        assert_eq!(conn.unexpected_replies(), 0);
    }

    #[tokio::test]
    async fn test_stray_reply_with_empty_queue() {
        let (dialer, server) = DuplexDialer::pair();
        let mut conn = connected(dialer).await;

        let (read, mut write) = tokio::io::split(server);
        let daemon = tokio::spawn(async move {
            write.write_all(b"250 stray\r\n").await.unwrap();
            let mut reader = BufReader::new(read).lines();
            let command = reader.next_line().await.unwrap().unwrap();
            write.write_all(b"250 answer\r\n").await.unwrap();
            (command, reader, write)
        });

        // The stray reply is dropped without producing an event.
        for _ in 0..200 {
            if conn.unexpected_replies() == 1 {
                break;
            }
            let polled =
                tokio::time::timeout(Duration::from_millis(10), conn.next_event()).await;
            assert!(polled.is_err(), "unexpected event {:?}", polled);
        }
        assert_eq!(conn.unexpected_replies(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);

        // Framing stays in step: the next command gets the next reply.
        conn.send_command("GETINFO version", 3).unwrap();
        match conn.next_event().await {
            ConnectionEvent::Reply(h, reply) => {
                assert_eq!(h, 3);
                assert_eq!(lines(&reply), vec!["answer"]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let (command, _reader, _write) = daemon.await.unwrap();
        assert_eq!(command, "GETINFO version");
        assert_eq!(conn.unexpected_replies(), 1);
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_eof_disconnects_and_clears_handlers() {
        let (dialer, server) = DuplexDialer::pair();
        let mut conn = connected(dialer).await;
        conn.send_command("PROTOCOLINFO 1", 1).unwrap();
        drop(server);

        assert_eq!(conn.next_event().await, ConnectionEvent::Disconnected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_oversized_line_forces_disconnect() {
        let (dialer, mut server) = DuplexDialer::pair();
        let mut conn = connected(dialer).await;

        let writer = tokio::spawn(async move {
            server
                .write_all(&vec![b'x'; MAX_LINE_LENGTH + 1])
                .await
                .unwrap();
            server
        });

        assert_eq!(conn.next_event().await, ConnectionEvent::Disconnected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let _server = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_while_connected_starts_over() {
        let (mut dialer, _server) = DuplexDialer::pair();
        let (second, _second_server) = tokio::io::duplex(1024);
        dialer.streams.push_back(second);
        let mut conn = connected(dialer).await;
        conn.send_command("PROTOCOLINFO 1", 1).unwrap();

        conn.connect("127.0.0.1:9052").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.pending_commands(), 0);
        assert_eq!(conn.next_event().await, ConnectionEvent::Connected);
    }
}
