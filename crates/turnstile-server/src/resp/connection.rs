use bytes::BytesMut;
use redis_protocol::resp2::decode::decode_bytes;
use redis_protocol::resp2::encode::extend_encode;
use redis_protocol::resp2::types::BytesFrame;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use turnstile_core::StoreError;

/// One client connection to a RESP2 server. Strictly request/response: a
/// request is written, then frames are read until one complete reply is
/// decoded.
pub struct RespConnection {
    stream: TcpStream,
    buf: BytesMut,
}

impl RespConnection {
    pub async fn connect(addr: &str) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Send one frame and wait for its reply.
    ///
    /// If this future is dropped part way, the connection may hold a partial
    /// reply and must not be reused.
    pub async fn request(&mut self, frame: &BytesFrame) -> Result<BytesFrame, StoreError> {
        let mut out = BytesMut::new();
        // false = don't encode integers as bulk strings (standard RESP2)
        extend_encode(&mut out, frame, false).map_err(|e| StoreError::Protocol(e.to_string()))?;
        self.stream.write_all(&out).await?;

        loop {
            if !self.buf.is_empty() {
                match decode_bytes(&self.buf.clone().freeze()) {
                    Ok(Some((reply, consumed))) => {
                        // Advance the buffer past the consumed bytes
                        let _ = self.buf.split_to(consumed);
                        return Ok(reply);
                    }
                    Ok(None) => {} // Need more data
                    Err(e) => return Err(StoreError::Protocol(e.to_string())),
                }
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "store closed the connection",
                )));
            }
        }
    }
}
