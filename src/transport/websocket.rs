//! WebSocket transport
//!
//! MQTT over WebSocket carries packets in binary frames. This wrapper
//! buffers incoming frames and presents them as a continuous byte stream so
//! the connection actor can treat the socket like TCP. Generic over the
//! inner stream so it also runs on top of TLS.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// WebSocket stream adapter implementing `AsyncRead`/`AsyncWrite`.
pub struct WsStream<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    /// Bytes from a frame not yet consumed by the reader
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Accept a WebSocket handshake, validating the request path and
    /// answering the `mqtt` subprotocol when offered.
    pub async fn accept(stream: S, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, mut response: Response| {
                let request_path = req.uri().path();
                if request_path != expected_path {
                    return Err(ErrorResponse::new(Some(format!(
                        "invalid path: expected '{}', got '{}'",
                        expected_path, request_path
                    ))));
                }

                if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
                    if let Ok(protocols_str) = protocols.to_str() {
                        for protocol in protocols_str.split(',').map(|s| s.trim()) {
                            if protocol == "mqtt" || protocol == "mqttv3.1" {
                                if let Ok(value) = protocol.parse() {
                                    response
                                        .headers_mut()
                                        .insert("sec-websocket-protocol", value);
                                }
                                break;
                            }
                        }
                    }
                }
                Ok(response)
            },
        )
        .await
        .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let to_copy = std::cmp::min(buf.remaining(), self.read_buffer.len());
                buf.put_slice(&self.read_buffer[..to_copy]);
                let _ = self.read_buffer.split_to(to_copy);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                Poll::Ready(Some(Ok(_))) => {
                    // Ping/pong are handled by tungstenite; text frames are
                    // not valid MQTT transport and are skipped
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(buf.to_vec().into());
                match Pin::new(&mut self.sink).start_send(message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                Pin::new(&mut self.sink)
                    .poll_flush(cx)
                    .map_err(io::Error::other)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
