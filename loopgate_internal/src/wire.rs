// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::request::CommandRequest;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// The default loopback port of the loopgate server.
///
/// The browser-side polling script hard-codes the same value.
pub const DEFAULT_PORT: u16 = 18245;
/// The three bytes a companion process sends first to select the binary protocol.
pub const BINARY_MARKER: &[u8; 3] = b"SGR";
/// Acknowledgement byte for a request that was handled.
pub const ACK_HANDLED: u8 = 1;
/// Acknowledgement byte for a request that failed.
pub const ACK_FAILED: u8 = 0;

/// Errors on the binary channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { len: u64, max: usize },
    #[error("Failed to encode request: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sends a raw byte frame.
///
/// The frame is prefixed with a 4-byte little-endian length.
pub fn write_frame<W: Write>(stream: &mut W, msg: &[u8]) -> Result<(), Error> {
    let len: u32 = msg.len().try_into().map_err(|_| Error::MessageTooLarge {
        len: msg.len() as u64,
        max: u32::MAX as usize,
    })?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(msg)?;
    stream.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame, refusing frames larger than `max`.
pub fn read_frame<R: Read>(stream: &mut R, max: usize) -> Result<Vec<u8>, Error> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len as u64 > max as u64 {
        return Err(Error::MessageTooLarge {
            len: len as u64,
            max,
        });
    }
    let mut msg = vec![0u8; len as usize];
    stream.read_exact(&mut msg)?;
    Ok(msg)
}

/// Hands a request off to a running server.
///
/// Connects, sends the protocol marker and the JSON-encoded request, and waits for the
/// single acknowledgement byte. Returns `Ok(true)` if the server reported the request as handled.
pub fn handoff(addr: SocketAddr, request: &CommandRequest, timeout: Duration) -> Result<bool, Error> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(BINARY_MARKER)?;
    write_frame(&mut stream, &request.to_json()?)?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack)?;
    Ok(ack[0] == ACK_HANDLED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_is_little_endian() {
        let mut out = Vec::new();
        write_frame(&mut out, b"hello").unwrap();
        assert_eq!(&out[..4], &[5, 0, 0, 0]);
        assert_eq!(&out[4..], b"hello");
        let back = read_frame(&mut out.as_slice(), 1024).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn oversized_frame_is_refused() {
        let bytes = [0xff, 0xff, 0x00, 0x00];
        let err = read_frame(&mut bytes.as_slice(), 16).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { len: 0xffff, max: 16 }));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let bytes = [4, 0, 0, 0, b'a'];
        let err = read_frame(&mut bytes.as_slice(), 16).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
