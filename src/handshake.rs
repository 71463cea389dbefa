//! Classification of freshly accepted sockets.
//!
//! The first three bytes decide the protocol:
//!
//! - `SGR` selects the binary companion protocol. The marker is consumed and not used further.
//! - `GET` starts an HTTP upgrade to WebSocket on `/`, answered with `101 Switching Protocols`
//!   or `400 Bad Request`.
//! - Anything else, or silence until the timeout, closes the socket without a reply.
//!
//! [`classify`] is a factory: it takes the accepted socket by value and hands it back inside
//! a [`Classified`] value that the connection layer turns into a live connection.

use crate::config::ServerConfig;
use base64::Engine;
use loopgate_internal::wire::BINARY_MARKER;
use sha1::Digest;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

const WEBSOCKET_MARKER: &[u8; 3] = b"GET";
const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";
/// RFC 6455 section 1.3.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    Timeout,
    #[error("First data did not match a known handshake: {0:?}")]
    UnknownMarker([u8; 3]),
    #[error("upgrade request exceeds {0} bytes")]
    HeaderTooLarge(usize),
    /// The request was answered with `400 Bad Request`.
    #[error("upgrade request rejected: {0}")]
    Rejected(String),
}

/// A socket whose protocol is known and whose handshake is complete.
#[derive(Debug)]
pub enum Classified {
    Binary(TcpStream),
    WebSocket {
        stream: TcpStream,
        /// Bytes received after the upgrade request; the start of the first frame, if any.
        leftover: Vec<u8>,
    },
}

/// Reads the first bytes of `stream` and completes the matching handshake.
///
/// `listening_port` is the port the `Host` header must name. On error the stream is dropped,
/// which closes it.
pub fn classify(
    mut stream: TcpStream,
    listening_port: u16,
    config: &ServerConfig,
) -> Result<Classified, Error> {
    let deadline = Instant::now() + config.handshake_timeout;
    let mut marker = [0u8; 3];
    set_remaining_timeout(&stream, deadline)?;
    stream.read_exact(&mut marker).map_err(timeout_or_io)?;

    if marker.eq_ignore_ascii_case(BINARY_MARKER) {
        return Ok(Classified::Binary(stream));
    }
    if !marker.eq_ignore_ascii_case(WEBSOCKET_MARKER) {
        return Err(Error::UnknownMarker(marker));
    }

    let mut head = marker.to_vec();
    let leftover = match read_head(&mut stream, &mut head, deadline, config.max_header_size) {
        Ok(leftover) => leftover,
        Err(Error::HeaderTooLarge(max)) => {
            reject(&mut stream);
            return Err(Error::HeaderTooLarge(max));
        }
        Err(e) => return Err(e),
    };

    let key = match UpgradeRequest::parse(&head).and_then(|r| r.validate(listening_port)) {
        Ok(key) => key,
        Err(reason) => {
            reject(&mut stream);
            return Err(Error::Rejected(reason));
        }
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n",
        accept = accept_key(&key)
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    stream.set_read_timeout(None)?;
    Ok(Classified::WebSocket { stream, leftover })
}

/// Computes `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = sha1::Sha1::default();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::prelude::BASE64_STANDARD.encode(hasher.finalize())
}

/// Reads until the blank line that ends the request head.
///
/// On return `head` holds the request up to and including the terminator; any bytes
/// received past it are returned.
fn read_head(
    stream: &mut TcpStream,
    head: &mut Vec<u8>,
    deadline: Instant,
    max_header_size: usize,
) -> Result<Vec<u8>, Error> {
    let mut buf = [0u8; 1024];
    loop {
        if let Some(pos) = head
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
        {
            let end = pos + HEADER_TERMINATOR.len();
            if end > max_header_size {
                return Err(Error::HeaderTooLarge(max_header_size));
            }
            return Ok(head.split_off(end));
        }
        if head.len() > max_header_size {
            return Err(Error::HeaderTooLarge(max_header_size));
        }
        set_remaining_timeout(stream, deadline)?;
        let read = match stream.read(&mut buf) {
            Ok(0) => return Err(Error::Io(ErrorKind::UnexpectedEof.into())),
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(timeout_or_io(e)),
        };
        head.extend_from_slice(&buf[..read]);
    }
}

fn set_remaining_timeout(stream: &TcpStream, deadline: Instant) -> Result<(), Error> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Error::Timeout);
    }
    // a zero duration would be rejected by set_read_timeout
    stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
    Ok(())
}

fn timeout_or_io(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

fn reject(stream: &mut TcpStream) {
    if let Err(e) = stream.write_all(BAD_REQUEST).and_then(|_| stream.flush()) {
        logwise::warn_sync!(
            "Failed to send 400 response: {e}",
            e = logwise::privacy::LogIt(&e)
        );
    }
}

/// The parts of an HTTP request head that the upgrade looks at.
#[derive(Debug)]
struct UpgradeRequest {
    method: String,
    target: String,
    /// Header names are lowercased; values are trimmed. Repeated headers are joined with `, `.
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    fn parse(head: &[u8]) -> Result<Self, String> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r'));
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("Invalid request line: {request_line}"));
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            // not a header line
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            headers
                .entry(name.trim().to_ascii_lowercase())
                .and_modify(|joined| {
                    joined.push_str(", ");
                    joined.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        Ok(UpgradeRequest {
            method: method.to_string(),
            target: target.to_string(),
            headers,
        })
    }

    fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or_default()
    }

    /// Checks the request against what the bridge accepts and returns the trimmed key.
    fn validate(&self, listening_port: u16) -> Result<String, String> {
        if !self.method.eq_ignore_ascii_case("GET") || self.target != "/" {
            return Err("Requested resource is not root".to_string());
        }
        let host = self.header("host");
        let expected_hosts = [
            format!("127.0.0.1:{listening_port}"),
            format!("localhost:{listening_port}"),
        ];
        if !expected_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            return Err(format!("Host mismatch: {host}"));
        }
        if !contains_ignore_case(self.header("upgrade"), "websocket") {
            return Err("Upgrade to websocket not found".to_string());
        }
        if !contains_ignore_case(self.header("connection"), "upgrade") {
            return Err("Connection upgrade not found".to_string());
        }
        if self.header("sec-websocket-version") != "13" {
            return Err("Websocket version 13 not found".to_string());
        }
        let key = self.header("sec-websocket-key");
        if key.is_empty() {
            return Err("Sec-WebSocket-Key not found".to_string());
        }
        Ok(key.to_string())
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const EDGE: &str = "GET / HTTP/1.1\r\n\
        Host: 127.0.0.1:18245\r\n\
        Connection: Upgrade\r\n\
        Pragma: no-cache\r\n\
        Upgrade: websocket\r\n\
        Origin: null\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: RYW37tzTtSM3oj38soRrsw==\r\n\
        Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n";

    const FIREFOX: &str = "GET / HTTP/1.1\r\n\
        Host: localhost:18245\r\n\
        Accept: */*\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: null\r\n\
        Sec-WebSocket-Key: 6PwSdgvoAjNuzQuHkz+O9A==\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Upgrade: websocket\r\n\r\n";

    fn validate(request: &str, port: u16) -> Result<String, String> {
        UpgradeRequest::parse(request.as_bytes()).and_then(|r| r.validate(port))
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn browser_requests_validate() {
        assert_eq!(validate(EDGE, 18245).unwrap(), "RYW37tzTtSM3oj38soRrsw==");
        assert_eq!(validate(FIREFOX, 18245).unwrap(), "6PwSdgvoAjNuzQuHkz+O9A==");
    }

    #[test]
    fn non_conforming_requests_are_rejected() {
        assert!(validate(EDGE, 18246).unwrap_err().starts_with("Host mismatch"));
        assert!(validate(&EDGE.replace("GET / ", "GET /index.html "), 18245).is_err());
        assert!(validate(&EDGE.replace("Upgrade: websocket", "Upgrade: h2c"), 18245).is_err());
        assert!(validate(&EDGE.replace("Connection: Upgrade", "Connection: close"), 18245).is_err());
        assert!(validate(&EDGE.replace("Version: 13", "Version: 8"), 18245).is_err());
        assert!(validate(&EDGE.replace("Sec-WebSocket-Key", "X-Key"), 18245).is_err());
        assert!(validate(&EDGE.replace("Host: 127.0.0.1", "Host: example.com"), 18245).is_err());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let lower = EDGE
            .replace("Host:", "host:")
            .replace("Upgrade: websocket", "UPGRADE: WebSocket");
        assert!(validate(&lower, 18245).is_ok());
    }

    #[test]
    fn stray_and_repeated_header_lines_are_tolerated() {
        let stray = EDGE.replace("Pragma: no-cache\r\n", "Pragma no-cache\r\n");
        assert_eq!(validate(&stray, 18245).unwrap(), "RYW37tzTtSM3oj38soRrsw==");

        let split = FIREFOX.replace(
            "Connection: keep-alive, Upgrade\r\n",
            "Connection: keep-alive\r\nConnection: Upgrade\r\n",
        );
        assert_eq!(validate(&split, 18245).unwrap(), "6PwSdgvoAjNuzQuHkz+O9A==");
    }

    fn socket_pair() -> (TcpStream, TcpStream, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server, port)
    }

    fn quick_config() -> ServerConfig {
        ServerConfig {
            handshake_timeout: Duration::from_millis(300),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn binary_marker_is_classified() {
        let (mut client, server, port) = socket_pair();
        client.write_all(b"sgr").unwrap();
        let classified = classify(server, port, &quick_config()).unwrap();
        assert!(matches!(classified, Classified::Binary(_)));
    }

    #[test]
    fn websocket_upgrade_is_answered() {
        let (mut client, server, port) = socket_pair();
        let mut request = EDGE.replace("18245", &port.to_string()).into_bytes();
        request.push(0x81);
        client.write_all(&request).unwrap();
        let classified = classify(server, port, &quick_config()).unwrap();
        let Classified::WebSocket { leftover, .. } = classified else {
            panic!("expected a websocket");
        };
        assert_eq!(leftover, vec![0x81]);

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        while !response.ends_with(b"\r\n\r\n") {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            response.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains(&format!(
            "Sec-WebSocket-Accept: {}\r\n",
            accept_key("RYW37tzTtSM3oj38soRrsw==")
        )));
    }

    #[test]
    fn bad_upgrade_gets_400() {
        let (mut client, server, port) = socket_pair();
        let request = EDGE.replace("18245", &port.to_string());
        client.write_all(request.as_bytes()).unwrap();
        let err = classify(server, port.wrapping_add(1), &quick_config()).unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, BAD_REQUEST);
    }

    #[test]
    fn oversized_head_gets_400() {
        let (mut client, server, port) = socket_pair();
        let config = ServerConfig {
            max_header_size: 64,
            ..quick_config()
        };
        let mut request = b"GET".to_vec();
        request.extend_from_slice(&[b'x'; 97]);
        client.write_all(&request).unwrap();
        let err = classify(server, port, &config).unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge(64)));
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, BAD_REQUEST);
    }

    #[test]
    fn unknown_marker_closes_silently() {
        let (mut client, server, port) = socket_pair();
        client.write_all(b"\x16\x03\x01").unwrap();
        let err = classify(server, port, &quick_config()).unwrap_err();
        assert!(matches!(err, Error::UnknownMarker([0x16, 0x03, 0x01])));
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn silence_times_out() {
        let (_client, server, port) = socket_pair();
        let err = classify(server, port, &quick_config()).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
