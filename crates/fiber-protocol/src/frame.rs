//! Message framing over raw byte streams.
//!
//! Two framings share one decoder:
//!
//! ```text
//! Footer:  {"a":1}<-FIBERFOOTER->{"b":2}<-FIBERFOOTER->   (persistent)
//! Close:   {"a":1}<EOF>                                  (one-shot)
//! ```
//!
//! [`FrameDecoder`] accumulates bytes until a footer appears. Bytes after the
//! footer stay buffered for the next frame, so several messages may arrive
//! in one read. At end of stream any non-blank remainder is treated as a
//! close-terminated frame. In lenient mode an unterminated buffer that
//! already holds one complete JSON value is accepted as well, which lets
//! one-shot clients omit both the footer and the half-close.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Oversized input is rejected with [`FrameError::TooLarge`]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

/// Marker appended after every message on footer-framed connections.
pub const FIBER_FOOTER: &str = "<-FIBERFOOTER->";

/// Maximum size of a single frame (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Bytes reserved before each socket read.
const READ_CHUNK: usize = 8 * 1024;

/// How the end of a message is signalled on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// JSON followed by [`FIBER_FOOTER`].
    Footer,
    /// JSON followed by the writer closing its side of the stream.
    Close,
}

/// Framing and payload errors.
///
/// The display strings are what clients see in the `error` field of the
/// error envelope.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Empty data received as request")]
    Empty,

    #[error("Corrupt data received as request")]
    Corrupt { reason: String },

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Encoding
// ============================================================================

/// Serializes `payload` and applies `framing`.
pub fn encode<T: Serialize + ?Sized>(payload: &T, framing: Framing) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(payload).map_err(|e| FrameError::Corrupt {
        reason: e.to_string(),
    })?;
    Ok(encode_raw(&json, framing))
}

/// Applies `framing` to bytes that are already serialized.
pub fn encode_raw(payload: &[u8], framing: Framing) -> Bytes {
    match framing {
        Framing::Footer => {
            let mut buf = BytesMut::with_capacity(payload.len() + FIBER_FOOTER.len());
            buf.put_slice(payload);
            buf.put_slice(FIBER_FOOTER.as_bytes());
            buf.freeze()
        }
        Framing::Close => Bytes::copy_from_slice(payload),
    }
}

/// Parses one defragmented message.
///
/// A trailing footer is tolerated, so this accepts the output of
/// [`encode`] for either framing.
pub fn decode(frame: &[u8]) -> Result<Value, FrameError> {
    let body = frame
        .strip_suffix(FIBER_FOOTER.as_bytes())
        .unwrap_or(frame);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FrameError::Empty);
    }
    serde_json::from_slice(body).map_err(|e| FrameError::Corrupt {
        reason: e.to_string(),
    })
}

// ============================================================================
// Decoder
// ============================================================================

/// Footer-aware frame decoder usable with `tokio_util::codec`.
///
/// A footer ends a frame only when the bytes before it are a complete JSON
/// value, or cannot become one. Footer text inside a string is skipped.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    lenient: bool,
    max_size: usize,
    /// Where the next footer search starts.
    search_from: usize,
    depth: Nesting,
}

impl FrameDecoder {
    /// Decoder that only ends frames at a footer or at end of stream.
    pub fn strict() -> Self {
        Self {
            lenient: false,
            max_size: MAX_FRAME_SIZE,
            search_from: 0,
            depth: Nesting::default(),
        }
    }

    /// Decoder that also ends a frame once the buffer holds a complete
    /// JSON object or array.
    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::strict()
        }
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    fn find_footer(&self, buf: &[u8]) -> Option<usize> {
        buf.get(self.search_from..)?
            .windows(FIBER_FOOTER.len())
            .position(|window| window == FIBER_FOOTER.as_bytes())
            .map(|pos| self.search_from + pos)
    }

    fn reset(&mut self) {
        self.search_from = 0;
        self.depth = Nesting::default();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::strict()
    }
}

/// Whether a footer at the end of `body` terminates the message.
///
/// A body that is merely cut short (an open string or container) may still
/// be completed by bytes after the footer.
fn footer_ends_message(body: &[u8]) -> bool {
    if body.iter().all(u8::is_ascii_whitespace) {
        return true;
    }
    match serde_json::from_slice::<serde::de::IgnoredAny>(body) {
        Ok(_) => true,
        Err(e) => !e.is_eof(),
    }
}

/// Incremental bracket tracker for lenient framing.
///
/// Each byte is looked at once, so a large message arriving in many reads
/// is parsed only when its outermost container closes.
#[derive(Debug, Clone, Default)]
struct Nesting {
    scanned: usize,
    level: usize,
    in_string: bool,
    escaped: bool,
}

impl Nesting {
    /// Scans the new bytes of `buf`. Returns true if a top-level object or
    /// array closed among them.
    fn advance(&mut self, buf: &[u8]) -> bool {
        let mut closed = false;
        for &byte in buf.get(self.scanned..).unwrap_or_default() {
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.level += 1,
                b'}' | b']' if self.level > 0 => {
                    self.level -= 1;
                    closed |= self.level == 0;
                }
                _ => {}
            }
        }
        self.scanned = buf.len();
        closed
    }
}

impl Decoder for FrameDecoder {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(pos) = self.find_footer(src) {
            if footer_ends_message(&src[..pos]) {
                let frame = src.split_to(pos);
                src.advance(FIBER_FOOTER.len());
                self.reset();
                return Ok(Some(frame));
            }
            self.search_from = pos + FIBER_FOOTER.len();
        }

        if src.len() > self.max_size {
            return Err(FrameError::TooLarge {
                size: src.len(),
                max: self.max_size,
            });
        }

        // A footer may be split across reads
        let tail = src.len().saturating_sub(FIBER_FOOTER.len() - 1);
        self.search_from = self.search_from.max(tail);

        if self.lenient
            && self.depth.advance(src)
            && serde_json::from_slice::<serde::de::IgnoredAny>(src).is_ok()
        {
            self.reset();
            return Ok(Some(src.split()));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.reset();
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            return Ok(None);
        }
        Ok(Some(buf.split()))
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Reads successive frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, decoder: FrameDecoder) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            decoder,
        }
    }

    /// Returns the next frame, or `None` on a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<BytesMut>, FrameError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            self.buffer.reserve(READ_CHUNK);
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return self.decoder.decode_eof(&mut self.buffer);
            }
        }
    }

    /// Reads the next frame and parses it as JSON.
    ///
    /// End of stream before any byte arrived counts as an empty message.
    pub async fn next_value(&mut self) -> Result<Value, FrameError> {
        match self.next_frame().await? {
            Some(frame) => decode(&frame),
            None => Err(FrameError::Empty),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
