//! WebSocket Transport
//!
//! Wraps a tokio-tungstenite WebSocket so MQTT packets carried in binary
//! frames read and write like a plain byte stream. Generic over the
//! underlying stream so the same adapter serves `ws` and `wss` listeners.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Subprotocols a client may offer for MQTT
const MQTT_SUBPROTOCOLS: &[&str] = &["mqtt", "mqttv3.1"];

/// WebSocket stream that implements AsyncRead and AsyncWrite
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    /// Bytes of the last binary frame not yet handed to the reader
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Accept a WebSocket upgrade on `expected_path`, echoing the MQTT
    /// subprotocol when the client offers one
    pub async fn accept_with_path(stream: S, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let callback = move |req: &Request, mut response: Response| {
            let request_path = req.uri().path();
            if request_path != expected_path {
                let mut error = ErrorResponse::new(Some(format!(
                    "Invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                )));
                *error.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                return Err(error);
            }

            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .and_then(|list| {
                    list.split(',')
                        .map(str::trim)
                        .find(|p| MQTT_SUBPROTOCOLS.contains(p))
                        .map(str::to_string)
                });
            if let Some(protocol) = offered {
                if let Ok(value) = HeaderValue::from_str(&protocol) {
                    response
                        .headers_mut()
                        .insert("sec-websocket-protocol", value);
                }
            }
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }

    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        buf.put_slice(&self.read_buffer[..n]);
        self.read_buffer.advance(n);
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                self.drain_into(buf);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                // Control and text frames carry no MQTT bytes
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => return Poll::Pending,
        }

        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[tokio::test]
    async fn test_binary_frames_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = WsStream::accept_with_path(stream, "/mqtt").await.unwrap();
            let mut buf = [0u8; 4];
            ws.read_exact(&mut buf).await.unwrap();
            ws.write_all(&buf).await.unwrap();
            ws.flush().await.unwrap();
        });

        let mut request = format!("ws://{}/mqtt", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static("mqtt"));
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut client, response) = tokio_tungstenite::client_async(request, stream)
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("sec-websocket-protocol").unwrap(),
            "mqtt"
        );

        client.send(Message::Binary(vec![1, 2])).await.unwrap();
        client.send(Message::Binary(vec![3, 4])).await.unwrap();
        let echoed = client.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Binary(vec![1, 2, 3, 4]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            WsStream::accept_with_path(stream, "/mqtt").await.is_err()
        });

        let request = format!("ws://{}/other", addr).into_client_request().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        assert!(tokio_tungstenite::client_async(request, stream).await.is_err());
        assert!(server.await.unwrap());
    }
}
