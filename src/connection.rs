// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live connections.
//!
//! A [`Connection`] is created from a [`Classified`] socket and runs its own receive thread.
//! Binary connections carry exactly one request and then close; WebSocket connections stay
//! open until either side closes them.
//!
//! Events flow to a [`Handler`]. Each connection reports [`Handler::on_connect`] once,
//! any number of [`Handler::on_message`], and [`Handler::on_closed`] exactly once.

use crate::codec::{self, Decoder, Event, Opcode, Reassembler};
use crate::config::ServerConfig;
use crate::handshake::Classified;
use loopgate_internal::wire::{self, ACK_FAILED, ACK_HANDLED};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use crate::codec::Message;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection is closed")]
    Closed,
    #[error("binary connections only carry their acknowledgement")]
    NotWebSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Binary,
    WebSocket,
}

/// Receives connection events.
///
/// Callbacks run on the connection's receive thread, or on whichever thread calls
/// [`Connection::close`].
pub trait Handler: Send + Sync + 'static {
    fn on_connect(&self, _connection: &Arc<Connection>) {}

    /// A complete message arrived.
    ///
    /// For binary connections the return value becomes the acknowledgement byte.
    /// WebSocket connections ignore it.
    fn on_message(&self, connection: &Arc<Connection>, message: Message) -> bool;

    fn on_closed(&self, _connection: &Arc<Connection>) {}
}

pub struct Connection {
    id: u64,
    port: u16,
    kind: Kind,
    writer: Mutex<TcpStream>,
    /// Used to shut the socket down without waiting on `writer`.
    control: TcpStream,
    closed: AtomicBool,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Turns a classified socket into a live connection.
    ///
    /// `on_connect` fires before the receive thread starts, so it always precedes
    /// the first message.
    pub fn open(
        classified: Classified,
        id: u64,
        handler: Arc<dyn Handler>,
        config: &ServerConfig,
    ) -> Result<Arc<Connection>, Error> {
        let (stream, kind, leftover) = match classified {
            Classified::Binary(stream) => (stream, Kind::Binary, Vec::new()),
            Classified::WebSocket { stream, leftover } => (stream, Kind::WebSocket, leftover),
        };
        let port = stream.peer_addr()?.port();
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        if kind == Kind::Binary {
            // the request must arrive within the handshake window
            reader.set_read_timeout(Some(config.handshake_timeout))?;
        }
        let connection = Arc::new(Connection {
            id,
            port,
            kind,
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
            handler,
        });
        connection.handler.on_connect(&connection);

        let receiver = connection.clone();
        let max_message_size = config.max_message_size;
        let spawned = match kind {
            Kind::Binary => std::thread::Builder::new()
                .name(format!("loopgate::binary {id}"))
                .spawn(move || receiver.receive_binary(reader, max_message_size)),
            Kind::WebSocket => std::thread::Builder::new()
                .name(format!("loopgate::websocket {id}"))
                .spawn(move || receiver.receive_websocket(reader, leftover, max_message_size)),
        };
        if let Err(e) = spawned {
            connection.close();
            return Err(e.into());
        }
        Ok(connection)
    }

    /// Unique for the lifetime of the listener that accepted the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), Error> {
        self.send_frame(Opcode::Binary, data)
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), Error> {
        if self.kind != Kind::WebSocket {
            return Err(Error::NotWebSocket);
        }
        self.write_raw(&codec::encode(opcode, payload))
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Closes the socket. Only the first call has any effect.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            // the peer may have closed first
            logwise::info_sync!(
                "Shutdown of connection {id} failed: {e}",
                id = self.id,
                e = logwise::privacy::LogIt(&e)
            );
        }
        self.handler.on_closed(self);
    }

    fn receive_binary(self: Arc<Self>, mut reader: TcpStream, max_message_size: usize) {
        let handled = match wire::read_frame(&mut reader, max_message_size) {
            Ok(payload) => self.handler.on_message(&self, Message::Binary(payload)),
            Err(e) => {
                logwise::warn_sync!(
                    "Binary request on connection {id} failed: {e}",
                    id = self.id,
                    e = logwise::privacy::LogIt(&e)
                );
                false
            }
        };
        let ack = if handled { ACK_HANDLED } else { ACK_FAILED };
        if let Err(e) = self.write_raw(&[ack]) {
            logwise::warn_sync!(
                "Could not acknowledge binary request on connection {id}: {e}",
                id = self.id,
                e = logwise::privacy::LogIt(&e)
            );
        }
        self.close();
    }

    fn receive_websocket(self: Arc<Self>, reader: TcpStream, leftover: Vec<u8>, max_message_size: usize) {
        let mut decoder = Decoder::new(reader, max_message_size).with_leftover(&leftover);
        let mut reassembler = Reassembler::new(max_message_size);
        loop {
            let frame = match decoder.next_frame() {
                Ok(frame) => frame,
                Err(codec::Error::ConnectionClosed { mid_frame: false }) => break,
                Err(e) => {
                    if !self.is_closed() {
                        logwise::warn_sync!(
                            "WebSocket {id} read error: {e}",
                            id = self.id,
                            e = logwise::privacy::LogIt(&e)
                        );
                    }
                    break;
                }
            };
            let event = match reassembler.accept(frame) {
                Ok(event) => event,
                Err(e) => {
                    logwise::warn_sync!(
                        "WebSocket {id} protocol error: {e}",
                        id = self.id,
                        e = logwise::privacy::LogIt(&e)
                    );
                    break;
                }
            };
            match event {
                Event::Message(message) => {
                    self.handler.on_message(&self, message);
                }
                Event::Ping(payload) => {
                    if let Err(e) = self.send_frame(Opcode::Pong, &payload) {
                        logwise::warn_sync!(
                            "WebSocket {id} could not answer ping: {e}",
                            id = self.id,
                            e = logwise::privacy::LogIt(&e)
                        );
                        break;
                    }
                }
                Event::Close(_) => {
                    // echo without a status code, then hang up
                    if let Err(e) = self.send_frame(Opcode::Close, &[]) {
                        logwise::warn_sync!(
                            "WebSocket {id} could not echo close: {e}",
                            id = self.id,
                            e = logwise::privacy::LogIt(&e)
                        );
                    }
                    break;
                }
                Event::Pong(_) | Event::Nothing => {}
            }
        }
        self.close();
    }
}
