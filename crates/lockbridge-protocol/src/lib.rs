//! Wire protocol for the lockbridge locker-cabinet bridge.
//!
//! Messages are JSON objects exchanged over a persistent bidirectional TCP
//! connection, one object per line. This crate provides the message model
//! ([`Message`]) and a Tokio codec ([`WireCodec`]) for automatic framing
//! with `tokio_util::codec::Framed`.
//!
//! # Architecture
//!
//! ```text
//! TCP Stream -> WireCodec (Decoder) -> Message (parsed)
//! Message -> WireCodec (Encoder) -> TCP Stream (JSON + '\n')
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//! use lockbridge_protocol::{Message, WireCodec};
//! use futures::{SinkExt, StreamExt};
//!
//! # async fn example() -> lockbridge_core::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9500").await?;
//! let mut framed = Framed::new(stream, WireCodec::new());
//!
//! framed.send(Message::Ping).await?;
//! if let Some(Ok(reply)) = framed.next().await {
//!     println!("Received: {:?}", reply);
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod message;

pub use codec::WireCodec;
pub use message::{CellReport, ControllerSnapshot, Message};
