//! WebSocket framing (RFC 6455 section 5).
//!
//! The codec is split into three layers:
//!
//! - [`Frame`] turns one frame into wire bytes. The server never fragments and never masks.
//! - [`FrameParser`] accumulates raw bytes and pops complete, unmasked frames.
//!   [`Decoder`] drives a parser from any [`Read`].
//! - [`Reassembler`] folds frames into application [`Event`]s: complete messages
//!   (after fragmentation) and control frames.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (client to server only)   |  Payload Data ... |
//! +-------------------------------------------+-------------------+
//! ```

use std::io::Read;

const FIN_BIT: u8 = 0b1000_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_BITS: u8 = 0b0111_1111;

/// Errors that are fatal to the connection being decoded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Clients must mask every frame they send.
    #[error("client frame is not masked")]
    UnmaskedFrame,
    /// Servers must never mask frames.
    #[error("server frame is masked")]
    MaskedFrame,
    #[error("payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: u64, max: usize },
    /// The peer closed the stream. `mid_frame` is set if a frame was partially received.
    #[error("connection closed (mid frame: {mid_frame})")]
    ConnectionClosed { mid_frame: bool },
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved opcodes. Logged and ignored.
    Reserved(u8),
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Opcode {
        match bits & OPCODE_BITS {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(bits) => bits & OPCODE_BITS,
        }
    }
}

/// A single frame, already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final (FIN) frame.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Frame {
            fin: true,
            opcode,
            payload,
        }
    }

    /// A frame with an explicit FIN bit, for building fragmented messages.
    pub fn fragment(fin: bool, opcode: Opcode, payload: Vec<u8>) -> Self {
        Frame { fin, opcode, payload }
    }

    /// Serializes the frame.
    ///
    /// `mask` is required for frames sent from client to server, but forbidden from server to client.
    pub fn to_bytes(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let len = self.payload.len();
        let mut frame = Vec::with_capacity(len + 14);
        let fin = if self.fin { FIN_BIT } else { 0 };
        frame.push(fin | self.opcode.bits());
        let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
        if len < 126 {
            frame.push(len as u8 | mask_bit);
        } else if len <= u16::MAX as usize {
            frame.push(126 | mask_bit);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127 | mask_bit);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        match mask {
            Some(key) => {
                frame.extend_from_slice(&key);
                frame.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ key[i % 4]),
                );
            }
            None => frame.extend_from_slice(&self.payload),
        }
        frame
    }
}

/// Encodes one unfragmented, unmasked server frame.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    Frame::new(opcode, payload.to_vec()).to_bytes(None)
}

/// Incremental frame parser.
///
/// Bytes are pushed as they arrive from the socket; [`FrameParser::parse`] pops one
/// frame at a time once enough bytes are buffered.
#[derive(Debug)]
pub struct FrameParser {
    unparsed_data: Vec<u8>,
    max_payload: usize,
    /// Server role: frames must be masked. Client role: frames must not be.
    expect_masked: bool,
}

impl FrameParser {
    /// A parser for frames a client sent to this server.
    pub fn new(max_payload: usize) -> FrameParser {
        FrameParser {
            unparsed_data: Vec::new(),
            max_payload,
            expect_masked: true,
        }
    }

    /// A parser for frames a server sent to this client.
    pub fn for_client(max_payload: usize) -> FrameParser {
        FrameParser {
            expect_masked: false,
            ..FrameParser::new(max_payload)
        }
    }

    pub fn send_data(&mut self, data: &[u8]) {
        self.unparsed_data.extend_from_slice(data);
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.unparsed_data.is_empty()
    }

    /// Pops the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn parse(&mut self) -> Result<Option<Frame>, Error> {
        let buf = &self.unparsed_data;
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & FIN_BIT != 0;
        let opcode = Opcode::from_bits(buf[0]);
        let masked = buf[1] & MASK_BIT != 0;
        match (masked, self.expect_masked) {
            (false, true) => return Err(Error::UnmaskedFrame),
            (true, false) => return Err(Error::MaskedFrame),
            _ => {}
        }
        let (len, mask_begin) = match buf[1] & LEN_BITS {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len_bytes), 10)
            }
            short => (short as u64, 2),
        };
        if len > self.max_payload as u64 {
            return Err(Error::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        let len = len as usize;
        let data_begin = if masked { mask_begin + 4 } else { mask_begin };
        if buf.len() < data_begin + len {
            return Ok(None);
        }

        let mut payload = buf[data_begin..data_begin + len].to_vec();
        if masked {
            let key = &buf[mask_begin..data_begin];
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }
        self.unparsed_data.drain(0..data_begin + len);
        Ok(Some(Frame { fin, opcode, payload }))
    }
}

/// Blocking frame decoder over a byte stream.
pub struct Decoder<R> {
    reader: R,
    parser: FrameParser,
    buf: Box<[u8]>,
}

impl<R: Read> Decoder<R> {
    /// Decodes client frames (server role).
    pub fn new(reader: R, max_payload: usize) -> Self {
        Self::with_parser(reader, FrameParser::new(max_payload))
    }

    /// Decodes server frames (client role).
    pub fn for_client(reader: R, max_payload: usize) -> Self {
        Self::with_parser(reader, FrameParser::for_client(max_payload))
    }

    fn with_parser(reader: R, parser: FrameParser) -> Self {
        Decoder {
            reader,
            parser,
            buf: vec![0u8; 4096].into_boxed_slice(),
        }
    }

    /// Feeds bytes that were read before framing began, e.g. past the end of the HTTP upgrade.
    pub fn with_leftover(mut self, leftover: &[u8]) -> Self {
        self.parser.send_data(leftover);
        self
    }

    /// Blocks until a full frame is available.
    pub fn next_frame(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = self.parser.parse()? {
                return Ok(frame);
            }
            let read = match self.reader.read(&mut self.buf) {
                Ok(read) => read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                return Err(Error::ConnectionClosed {
                    mid_frame: !self.parser.is_empty(),
                });
            }
            self.parser.send_data(&self.buf[..read]);
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// What a frame means to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A message completed with this frame.
    Message(Message),
    /// Close requested by the peer.
    Close(Vec<u8>),
    /// Ping; answer with a pong carrying the same payload.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Nothing to deliver: a non-final fragment, or a frame that was dropped.
    Nothing,
}

/// Reassembles fragmented messages.
#[derive(Debug)]
pub struct Reassembler {
    open: Option<(Opcode, Vec<u8>)>,
    max_message: usize,
}

impl Reassembler {
    pub fn new(max_message: usize) -> Self {
        Reassembler {
            open: None,
            max_message,
        }
    }

    /// Whether a fragmented message is waiting for its final frame.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn accept(&mut self, frame: Frame) -> Result<Event, Error> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.open.take().is_some() {
                    logwise::warn_sync!("New data frame while a fragmented message was open; dropping the open message");
                }
                if frame.fin {
                    Ok(Self::deliver(frame.opcode, frame.payload))
                } else {
                    self.open = Some((frame.opcode, frame.payload));
                    Ok(Event::Nothing)
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut data)) = self.open.take() else {
                    logwise::warn_sync!(
                        "Continuation frame without start ignored ({len} bytes)",
                        len = frame.payload.len()
                    );
                    return Ok(Event::Nothing);
                };
                let total = data.len() + frame.payload.len();
                if total > self.max_message {
                    return Err(Error::PayloadTooLarge {
                        len: total as u64,
                        max: self.max_message,
                    });
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Self::deliver(opcode, data))
                } else {
                    self.open = Some((opcode, data));
                    Ok(Event::Nothing)
                }
            }
            Opcode::Close => Ok(Event::Close(frame.payload)),
            Opcode::Ping => Ok(Event::Ping(frame.payload)),
            Opcode::Pong => Ok(Event::Pong(frame.payload)),
            Opcode::Reserved(bits) => {
                logwise::warn_sync!(
                    "Frame of unknown opcode {bits} ignored ({len} bytes)",
                    bits = bits,
                    len = frame.payload.len()
                );
                Ok(Event::Nothing)
            }
        }
    }

    fn deliver(opcode: Opcode, data: Vec<u8>) -> Event {
        match opcode {
            Opcode::Text => match String::from_utf8(data) {
                Ok(text) => Event::Message(Message::Text(text)),
                Err(e) => {
                    logwise::warn_sync!(
                        "Text message is not valid UTF-8, dropped: {e}",
                        e = logwise::privacy::LogIt(&e)
                    );
                    Event::Nothing
                }
            },
            _ => Event::Message(Message::Binary(data)),
        }
    }
}
