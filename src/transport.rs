//! WebSocket transport carrying length-prefixed, optionally zlib-compressed frames.

use bytes::Bytes;
use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io::Read;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::error::TransportError;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    stream: WsStream,
}

/// One decoded unit handed up by [`WsReader`]: either an application frame, or a ping the
/// caller must forward to the writer half (the reader no longer owns the sink after
/// [`WsTransport::split`], so it can't reply inline the way [`WsTransport::next_frame`] does).
pub enum WsEvent {
    Frame(Bytes),
    Ping(Bytes),
}

/// Read half of a split [`WsTransport`]. Owned by a dedicated reader task.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

/// Write half of a split [`WsTransport`]. Owned by a dedicated writer task, which is also
/// the only place that can reply to a ping forwarded up from [`WsReader`].
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(TransportError::WebSocket)?;
        request
            .headers_mut()
            .insert("Origin", "https://web.whatsapp.com".parse().unwrap());

        let (stream, _) = connect_async(request).await.map_err(TransportError::Connect)?;
        Ok(Self { stream })
    }

    /// Sends a framed payload: 1-byte compression flag, 3-byte big-endian length prefix,
    /// then the (optionally compressed) payload.
    pub async fn send_frame(&mut self, payload: &[u8], compress: bool) -> Result<(), TransportError> {
        let (flag, body) = if compress {
            (FLAG_COMPRESSED, zlib_compress(payload))
        } else {
            (0u8, payload.to_vec())
        };

        if body.len() + 1 > 0xFF_FF_FF {
            return Err(TransportError::FrameTooLarge);
        }

        let len = body.len() + 1;
        let mut frame = Vec::with_capacity(3 + len);
        frame.push(((len >> 16) & 0xFF) as u8);
        frame.push(((len >> 8) & 0xFF) as u8);
        frame.push((len & 0xFF) as u8);
        frame.push(flag);
        frame.extend_from_slice(&body);

        self.stream.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    /// Reads the next framed payload, transparently replying to pings and inflating
    /// zlib-compressed bodies.
    pub async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let message = self.stream.next().await.ok_or(TransportError::Closed)??;

            match message {
                Message::Ping(payload) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Binary(data) => {
                    if data.len() < 4 {
                        return Err(TransportError::InvalidFrame("missing length/flag prefix"));
                    }

                    let expected_len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
                    let flag = data[3];
                    let body = &data[4..];

                    if body.len() + 1 != expected_len {
                        return Err(TransportError::InvalidFrame("length prefix mismatch"));
                    }

                    if flag & FLAG_COMPRESSED != 0 {
                        return Ok(Bytes::from(zlib_decompress(body)?));
                    }
                    return Ok(Bytes::copy_from_slice(body));
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Pong(_) | Message::Text(_) | Message::Frame(_) => continue,
            }
        }
    }

    /// Splits into independent read/write halves so a reader task and writer task can run
    /// concurrently without sharing a lock around the socket, the way a single-reader/
    /// single-writer connection loop needs to.
    pub fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

impl WsReader {
    /// Reads the next frame or ping. Unlike [`WsTransport::next_frame`], pings are handed
    /// back to the caller rather than answered inline — only [`WsWriter`] can write to the
    /// socket once the halves are split.
    pub async fn next_event(&mut self) -> Result<WsEvent, TransportError> {
        loop {
            let message = self.stream.next().await.ok_or(TransportError::Closed)??;

            match message {
                Message::Ping(payload) => return Ok(WsEvent::Ping(payload)),
                Message::Binary(data) => {
                    if data.len() < 4 {
                        return Err(TransportError::InvalidFrame("missing length/flag prefix"));
                    }

                    let expected_len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
                    let flag = data[3];
                    let body = &data[4..];

                    if body.len() + 1 != expected_len {
                        return Err(TransportError::InvalidFrame("length prefix mismatch"));
                    }

                    if flag & FLAG_COMPRESSED != 0 {
                        return Ok(WsEvent::Frame(Bytes::from(zlib_decompress(body)?)));
                    }
                    return Ok(WsEvent::Frame(Bytes::copy_from_slice(body)));
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Pong(_) | Message::Text(_) | Message::Frame(_) => continue,
            }
        }
    }
}

impl WsWriter {
    /// Sends a framed payload; same wire shape as [`WsTransport::send_frame`].
    pub async fn send_frame(&mut self, payload: &[u8], compress: bool) -> Result<(), TransportError> {
        let (flag, body) = if compress {
            (FLAG_COMPRESSED, zlib_compress(payload))
        } else {
            (0u8, payload.to_vec())
        };

        if body.len() + 1 > 0xFF_FF_FF {
            return Err(TransportError::FrameTooLarge);
        }

        let len = body.len() + 1;
        let mut frame = Vec::with_capacity(3 + len);
        frame.push(((len >> 16) & 0xFF) as u8);
        frame.push(((len >> 8) & 0xFF) as u8);
        frame.push((len & 0xFF) as u8);
        frame.push(flag);
        frame.extend_from_slice(&body);

        self.sink.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    /// Answers a ping payload forwarded up from [`WsReader`].
    pub async fn send_pong(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.sink.send(Message::Pong(payload)).await?;
        Ok(())
    }
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    // Infallible for an in-memory reader.
    encoder.read_to_end(&mut out).expect("zlib compression of in-memory buffer cannot fail");
    out
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| TransportError::Inflate)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trips() {
        let data = b"a binary node payload".repeat(10);
        let compressed = zlib_compress(&data);
        let restored = zlib_decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }
}
