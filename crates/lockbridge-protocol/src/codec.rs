//! Tokio codec for lockbridge message framing.
//!
//! Frames are newline-delimited JSON objects. The codec implements:
//! - [`Decoder`]: extracts complete lines from the byte stream and parses
//!   them into [`Message`] values
//! - [`Encoder<Message>`]: serializes messages and appends the delimiter
//!
//! # Error Handling
//!
//! An oversized frame is a transport-level fault ([`Error::FrameTooLarge`]);
//! the connection cannot recover because the peer's framing is unbounded.
//! An undecodable line is a message-level fault: the offending line is
//! consumed, logged and counted, and the decoder keeps scanning for the
//! next frame. A decoder error would put `Framed` into its terminated
//! state, so `Err` is reserved for the unrecoverable cases: only once a
//! connection accumulates [`MAX_PROTOCOL_VIOLATIONS`] undecodable lines
//! does the codec fail with [`Error::MalformedMessage`] and end the
//! stream.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::Message;
use lockbridge_core::{
    Error,
    constants::{MAX_FRAME_SIZE, MAX_PROTOCOL_VIOLATIONS},
};

/// Newline-delimited JSON codec for [`Message`] frames.
///
/// # Example
///
/// ```no_run
/// use tokio::net::TcpStream;
/// use tokio_util::codec::Framed;
/// use lockbridge_protocol::WireCodec;
/// use futures::StreamExt;
///
/// # async fn example() -> lockbridge_core::Result<()> {
/// let stream = TcpStream::connect("127.0.0.1:9500").await?;
/// let mut framed = Framed::new(stream, WireCodec::new());
///
/// while let Some(result) = framed.next().await {
///     match result {
///         Ok(message) => println!("Received: {:?}", message),
///         Err(e) => eprintln!("Error: {}", e),
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WireCodec {
    /// Maximum allowed frame size in bytes.
    ///
    /// Frames exceeding this are rejected before parsing to bound the
    /// memory a misbehaving peer can pin.
    max_frame_size: usize,
    /// Undecodable lines tolerated before the connection is given up on.
    max_violations: u32,
    /// Undecodable lines seen so far on this connection.
    violations: u32,
}

impl WireCodec {
    /// Create a codec with the default maximum frame size (64 KB) and the
    /// default protocol-violation threshold.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_violations: MAX_PROTOCOL_VIOLATIONS,
            violations: 0,
        }
    }

    /// Create a codec with a custom maximum frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            ..Self::new()
        }
    }

    /// Get the current maximum frame size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Undecodable lines this codec has dropped so far.
    #[must_use]
    pub fn violations(&self) -> u32 {
        self.violations
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > self.max_frame_size {
                    return Err(Error::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            if newline > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    size: newline,
                    max: self.max_frame_size,
                });
            }

            // Consume the line including its delimiter before parsing, so a
            // malformed line never poisons the buffer for subsequent frames.
            let line = src.split_to(newline + 1);
            let line = &line[..newline];

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            match serde_json::from_slice(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    self.violations += 1;
                    warn!(
                        violations = self.violations,
                        error = %e,
                        "Dropped undecodable frame"
                    );
                    if self.violations >= self.max_violations {
                        return Err(Error::MalformedMessage(format!(
                            "{} undecodable frames on one connection",
                            self.violations
                        )));
                    }
                }
            }
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let payload = serde_json::to_vec(&message)?;
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}
