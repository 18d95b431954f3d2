//! Transport abstraction
//!
//! TCP, TLS and WebSocket connections all reach the broker as one erased
//! byte-stream type so the accept path and connection actor stay
//! transport-agnostic.

mod websocket;

pub use websocket::WsStream;

use tokio::io::{AsyncRead, AsyncWrite};

/// Marker for any bidirectional byte stream the broker can serve.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// An erased transport stream.
pub type BoxedStream = Box<dyn StreamIo>;
