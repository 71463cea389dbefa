// SPDX-License-Identifier: MIT OR Apache-2.0
//! The loopback listener.
//!
//! One non-blocking accept loop runs on its own thread. Every accepted socket gets a
//! short-lived thread that runs [`handshake::classify`]; classified sockets become
//! [`Connection`]s and join the active set until they close.

use crate::config::ServerConfig;
use crate::connection::{Connection, Handler, Message};
use crate::handshake;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("listener is already running")]
    AlreadyRunning,
    #[error("cannot change the port while the listener is running")]
    PortChangeWhileRunning,
    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts loopback connections and tracks the live ones.
pub struct Listener {
    config: ServerConfig,
    active: Arc<ActiveSet>,
    state: Mutex<State>,
    next_id: Arc<AtomicU64>,
}

struct State {
    port: u16,
    running: Option<Running>,
}

struct Running {
    stop: Arc<AtomicBool>,
    accept_thread: JoinHandle<()>,
}

/// The active connections, plus the application handler they report to.
///
/// Registration and removal happen under the set's lock together with the
/// notification, so observers never see a connection twice or miss its close.
struct ActiveSet {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    handler: Arc<dyn Handler>,
}

impl Handler for ActiveSet {
    fn on_connect(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.insert(connection.id(), connection.clone());
        self.handler.on_connect(connection);
    }

    fn on_message(&self, connection: &Arc<Connection>, message: Message) -> bool {
        self.handler.on_message(connection, message)
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if connections.remove(&connection.id()).is_some() {
            self.handler.on_closed(connection);
        }
    }
}

impl Listener {
    /// Creates a stopped listener for `config.port`.
    ///
    /// `handler` receives every connection event. Its `on_connect` and `on_closed`
    /// run while the active set is locked and must not call back into the listener.
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        Listener {
            state: Mutex::new(State {
                port: config.port,
                running: None,
            }),
            config,
            active: Arc::new(ActiveSet {
                connections: Mutex::new(HashMap::new()),
                handler,
            }),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The configured port, or the bound one once started on port 0.
    pub fn port(&self) -> u16 {
        self.state().port
    }

    pub fn set_port(&self, port: u16) -> Result<(), Error> {
        let mut state = self.state();
        if state.running.is_some() {
            return Err(Error::PortChangeWhileRunning);
        }
        state.port = port;
        Ok(())
    }

    /// Binds `port` on the loopback interface and starts accepting.
    ///
    /// Port 0 picks a free port; [`Listener::port`] reports it afterwards.
    pub fn start(&self, port: u16) -> Result<(), Error> {
        let mut state = self.state();
        if state.running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        state.port = port;
        self.bind(&mut state)
    }

    /// Starts on the port last given to [`Listener::set_port`] or [`Listener::start`].
    pub fn restart(&self) -> Result<(), Error> {
        let mut state = self.state();
        if state.running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.bind(&mut state)
    }

    fn bind(&self, state: &mut State) -> Result<(), Error> {
        let requested = state.port;
        let socket = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, requested)))
            .map_err(|source| Error::Bind {
                port: requested,
                source,
            })?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();

        let stop = Arc::new(AtomicBool::new(false));
        let accept = AcceptLoop {
            socket,
            port,
            stop: stop.clone(),
            config: self.config.clone(),
            active: self.active.clone(),
            next_id: self.next_id.clone(),
        };
        let accept_thread = std::thread::Builder::new()
            .name("loopgate::listen".to_string())
            .spawn(move || accept.run())?;
        logwise::info_sync!("Listening on 127.0.0.1:{port}", port = port);
        state.port = port;
        state.running = Some(Running {
            stop,
            accept_thread,
        });
        Ok(())
    }

    /// Stops accepting and releases the port. Live connections are left alone.
    pub fn stop(&self) {
        let running = self.state().running.take();
        let Some(running) = running else {
            return;
        };
        running.stop.store(true, Ordering::Release);
        if running.accept_thread.join().is_err() {
            logwise::error_sync!("Accept thread panicked");
        }
        logwise::info_sync!("Listener stopped");
    }

    /// Forcibly closes every active connection.
    pub fn close_all(&self) {
        let snapshot: Vec<Arc<Connection>> = self
            .active
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for connection in snapshot {
            connection.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running.is_some()
    }

    /// Number of classified connections that have not closed yet.
    pub fn connection_count(&self) -> usize {
        self.active
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop {
    socket: TcpListener,
    port: u16,
    stop: Arc<AtomicBool>,
    config: ServerConfig,
    active: Arc<ActiveSet>,
    next_id: Arc<AtomicU64>,
}

impl AcceptLoop {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    logwise::info_sync!("Accepted {peer}", peer = logwise::privacy::LogIt(&peer));
                    self.dispatch(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(self.config.accept_backoff);
                }
                Err(e) => {
                    logwise::error_sync!("Accept failed: {e}", e = logwise::privacy::LogIt(&e));
                    std::thread::sleep(self.config.accept_backoff);
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream) {
        // accepted sockets inherit non-blocking mode on some platforms
        if let Err(e) = stream.set_nonblocking(false) {
            logwise::error_sync!(
                "Could not configure accepted socket: {e}",
                e = logwise::privacy::LogIt(&e)
            );
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let port = self.port;
        let config = self.config.clone();
        let active = self.active.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("loopgate::handshake {id}"))
            .spawn(move || {
                let classified = match handshake::classify(stream, port, &config) {
                    Ok(classified) => classified,
                    Err(e) => {
                        logwise::info_sync!(
                            "Connection {id} dropped during handshake: {e}",
                            id = id,
                            e = logwise::privacy::LogIt(&e)
                        );
                        return;
                    }
                };
                if let Err(e) = Connection::open(classified, id, active, &config) {
                    logwise::error_sync!(
                        "Connection {id} could not be opened: {e}",
                        id = id,
                        e = logwise::privacy::LogIt(&e)
                    );
                }
            });
        if let Err(e) = spawned {
            logwise::error_sync!(
                "Could not spawn handshake thread: {e}",
                e = logwise::privacy::LogIt(&e)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Frame, Opcode};
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct Echo {
        events: Mutex<mpsc::Sender<String>>,
    }

    impl Handler for Echo {
        fn on_connect(&self, connection: &Arc<Connection>) {
            let _ = self.events.lock().unwrap().send(format!("connect {}", connection.id()));
        }

        fn on_message(&self, connection: &Arc<Connection>, message: Message) -> bool {
            if let Message::Text(text) = message {
                connection.send_text(&text).unwrap();
            }
            true
        }

        fn on_closed(&self, connection: &Arc<Connection>) {
            let _ = self.events.lock().unwrap().send(format!("closed {}", connection.id()));
        }
    }

    fn listener() -> (Listener, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let config = ServerConfig {
            port: 0,
            handshake_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        let handler = Arc::new(Echo {
            events: Mutex::new(tx),
        });
        (Listener::new(config, handler), rx)
    }

    fn upgrade(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let request = format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));
        stream
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn lifecycle_errors_fail_fast() {
        let (listener, _rx) = listener();
        assert!(!listener.is_running());
        listener.stop();
        listener.start(0).unwrap();
        assert!(listener.is_running());
        assert_ne!(listener.port(), 0);
        assert!(matches!(listener.start(0), Err(Error::AlreadyRunning)));
        assert!(matches!(listener.restart(), Err(Error::AlreadyRunning)));
        assert!(matches!(listener.set_port(1), Err(Error::PortChangeWhileRunning)));
        listener.stop();
        listener.stop();
        assert!(!listener.is_running());
        listener.set_port(0).unwrap();
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (listener, _rx) = listener();
        assert!(matches!(listener.start(port), Err(Error::Bind { port: p, .. }) if p == port));
        assert!(!listener.is_running());
    }

    #[test]
    fn stop_releases_the_port() {
        let (listener, _rx) = listener();
        listener.start(0).unwrap();
        let port = listener.port();
        listener.stop();
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
        listener.restart().unwrap();
        assert_eq!(listener.port(), port);
    }

    #[test]
    fn websocket_connections_are_tracked() {
        let (listener, rx) = listener();
        listener.start(0).unwrap();
        let mut client = upgrade(listener.port());
        let connected = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(connected.starts_with("connect "));
        assert_eq!(listener.connection_count(), 1);

        client
            .write_all(&Frame::new(Opcode::Text, b"ping?".to_vec()).to_bytes(Some([1, 2, 3, 4])))
            .unwrap();
        let reply = Decoder::for_client(&mut client, 1024).next_frame().unwrap();
        assert_eq!(reply.payload, b"ping?");

        drop(client);
        let closed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(closed.replace("closed", "connect"), connected);
        wait_for(|| listener.connection_count() == 0);
    }

    #[test]
    fn close_all_closes_every_connection_once() {
        let (listener, rx) = listener();
        listener.start(0).unwrap();
        let mut first = upgrade(listener.port());
        let _second = upgrade(listener.port());
        wait_for(|| listener.connection_count() == 2);
        listener.close_all();
        listener.close_all();
        assert_eq!(listener.connection_count(), 0);

        let events: Vec<String> = rx.try_iter().collect();
        assert_eq!(events.iter().filter(|e| e.starts_with("connect")).count(), 2);
        assert_eq!(events.iter().filter(|e| e.starts_with("closed")).count(), 2);
        let mut rest = Vec::new();
        assert_eq!(first.read_to_end(&mut rest).unwrap(), 0);
        // no further events once everything is closed
        listener.stop();
        assert!(rx.try_recv().is_err());
    }
}
