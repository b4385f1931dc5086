//! WebSocket transport with the 3-byte length-prefixed framing the Noise
//! layer expects underneath it.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::error::TransportError;

/// Caps an individual frame at the 24-bit length prefix's range.
const MAX_FRAME_SIZE: usize = 0xFF_FF_FF;

/// A connected WebSocket wrapped in WA's own frame-length convention.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Connects to a websocket endpoint.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self { stream })
    }

    /// Sends a framed payload with a 24-bit big-endian length prefix.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge);
        }

        let len = payload.len();
        let mut frame = Vec::with_capacity(3 + len);
        frame.push(((len >> 16) & 0xFF) as u8);
        frame.push(((len >> 8) & 0xFF) as u8);
        frame.push((len & 0xFF) as u8);
        frame.extend_from_slice(payload);

        self.stream.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    /// Reads the next framed payload, transparently answering ping frames.
    pub async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let message = self.stream.next().await.ok_or(TransportError::Closed)??;

            match message {
                Message::Ping(payload) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Binary(data) => {
                    if data.len() < 3 {
                        return Err(TransportError::InvalidFrame("missing 3-byte prefix"));
                    }
                    let len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
                    if data.len() != 3 + len {
                        return Err(TransportError::InvalidFrame("length prefix mismatch"));
                    }
                    return Ok(Bytes::copy_from_slice(&data[3..]));
                }
                _ => continue,
            }
        }
    }

    /// Closes the underlying socket.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
