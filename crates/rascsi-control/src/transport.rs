//! Socket transport for the engine wire protocol.
//!
//! One request per connection:
//!
//! ```text
//! request  := "RASCSI" len32_le payload
//! response := len32_le payload
//! ```
//!
//! Connect failures are retried with a fixed pause. Once the request is on
//! the wire nothing is retried, since the engine may already have acted on it.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rascsi_core::constants::{
    CONNECT_RETRIES, CONNECT_RETRY_DELAY, FRAME_HEADER_LEN, MAX_FRAME_SIZE, PROTOCOL_MAGIC,
    READ_CHUNK_SIZE,
};
use rascsi_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Client side of the engine socket.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    host: String,
    port: u16,
    retries: u32,
    retry_delay: Duration,
}

impl SocketTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retries: CONNECT_RETRIES,
            retry_delay: CONNECT_RETRY_DELAY,
        }
    }

    /// Number of additional connect attempts after the first failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open a connection, retrying refused or unreachable endpoints.
    pub async fn connect(&self) -> Result<TcpStream> {
        let total = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=total {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    if attempt > 1 {
                        debug!(endpoint = %self.endpoint(), attempt, "connected after retry");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint(),
                        attempt,
                        total,
                        error = %e,
                        "engine connect failed"
                    );
                    last_error = e.to_string();
                    if attempt < total {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!(endpoint = %self.endpoint(), attempts = total, "giving up on engine connection");
        Err(Error::TransportUnavailable {
            endpoint: self.endpoint(),
            attempts: total,
            message: last_error,
        })
    }

    /// Deliver one request payload and return the response payload.
    pub async fn send(&self, payload: &[u8]) -> Result<Bytes> {
        let mut stream = self.connect().await?;
        write_request(&mut stream, payload).await?;
        let response = read_frame(&mut stream).await?;
        debug!(
            endpoint = %self.endpoint(),
            sent = payload.len(),
            received = response.len(),
            "engine round trip complete"
        );
        Ok(response)
    }
}

fn frame_len(payload: &[u8]) -> Result<u32> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(payload.len() as u32)
}

/// Write `"RASCSI" len32_le payload`.
pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = frame_len(payload)?;
    let mut buf = BytesMut::with_capacity(PROTOCOL_MAGIC.len() + FRAME_HEADER_LEN + payload.len());
    buf.put_slice(PROTOCOL_MAGIC);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write `len32_le payload` (the response direction, no magic).
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = frame_len(payload)?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and verify the six-byte request magic.
pub async fn read_magic<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 6];
    let mut filled = 0;
    while filled < magic.len() {
        let n = reader.read(&mut magic[filled..]).await?;
        if n == 0 {
            return Err(Error::MalformedFrame {
                message: format!("expected {} magic bytes, got {}", magic.len(), filled),
            });
        }
        filled += n;
    }
    if &magic != PROTOCOL_MAGIC {
        return Err(Error::MalformedFrame {
            message: format!("bad magic {:02x?}", magic),
        });
    }
    Ok(())
}

/// Read one `len32_le payload` frame.
///
/// Reads exactly the declared number of bytes in chunks of at most
/// [`READ_CHUNK_SIZE`]. The declared length is checked against
/// [`MAX_FRAME_SIZE`] before anything is allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(Error::MalformedFrame {
                message: format!("expected {} header bytes, got {}", FRAME_HEADER_LEN, filled),
            });
        }
        filled += n;
    }

    let expected = u32::from_le_bytes(header) as usize;
    if expected > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: expected,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = BytesMut::with_capacity(expected);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while payload.len() < expected {
        let want = (expected - payload.len()).min(READ_CHUNK_SIZE);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(Error::PeerClosed {
                received: payload.len(),
                expected,
            });
        }
        payload.put_slice(&chunk[..n]);
    }

    Ok(payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rascsi_core::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Bind a listener that answers every connection with `reply` and counts accepts.
    async fn scripted_engine(reply: Vec<u8>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = read_magic(&mut stream).await;
                let _ = read_frame(&mut stream).await;
                let _ = stream.write_all(&reply).await;
                let _ = stream.shutdown().await;
            }
        });
        (port, accepts)
    }

    fn fast(port: u16) -> SocketTransport {
        SocketTransport::new("127.0.0.1", port).with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn send_returns_payload() {
        let mut reply = 5u32.to_le_bytes().to_vec();
        reply.extend_from_slice(b"hello");
        let (port, _) = scripted_engine(reply).await;

        let response = fast(port).send(b"ping").await.unwrap();
        assert_eq!(&response[..], b"hello");
    }

    #[tokio::test]
    async fn zero_length_response_is_valid() {
        let (port, _) = scripted_engine(0u32.to_le_bytes().to_vec()).await;
        let response = fast(port).send(b"").await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn short_header_is_malformed_and_not_retried() {
        let (port, accepts) = scripted_engine(vec![0x10, 0x00]).await;

        let err = fast(port).send(b"ping").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_mid_payload_is_peer_closed() {
        let mut reply = 10u32.to_le_bytes().to_vec();
        reply.extend_from_slice(b"abc");
        let (port, accepts) = scripted_engine(reply).await;

        let err = fast(port).send(b"ping").await.unwrap_err();
        assert!(matches!(
            err,
            Error::PeerClosed {
                received: 3,
                expected: 10
            }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_header_fails_before_allocation() {
        let (port, _) = scripted_engine(u32::MAX.to_le_bytes().to_vec()).await;
        let err = fast(port).send(b"ping").await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn unreachable_engine_exhausts_retries() {
        // Reserve a port, then free it so connects are refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = SocketTransport::new("127.0.0.1", port)
            .with_retries(3)
            .with_retry_delay(Duration::from_millis(5));
        let err = transport.send(b"ping").await.unwrap_err();
        assert!(err.is_transient());
        match err {
            Error::TransportUnavailable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_retry_budget() {
        let transport = SocketTransport::new("localhost", 6868);
        assert_eq!(transport.retries + 1, 21);
        assert_eq!(transport.retry_delay, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn request_framing_layout() {
        let mut out = Vec::new();
        write_request(&mut out, b"abc").await.unwrap();
        assert_eq!(&out[..6], b"RASCSI");
        assert_eq!(&out[6..10], &3u32.to_le_bytes());
        assert_eq!(&out[10..], b"abc");

        let mut out = Vec::new();
        write_frame(&mut out, b"abc").await.unwrap();
        assert_eq!(out, [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let mut input: &[u8] = b"RASCSX\0\0\0\0";
        let err = read_magic(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);
    }

    proptest! {
        #[test]
        fn read_frame_consumes_exactly_declared_length(
            payload in prop::collection::vec(any::<u8>(), 0..6000),
            trailing in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
            wire.extend_from_slice(&payload);
            wire.extend_from_slice(&trailing);

            let mut reader: &[u8] = &wire;
            let frame = rt.block_on(read_frame(&mut reader)).unwrap();
            prop_assert_eq!(&frame[..], &payload[..]);
            prop_assert_eq!(reader, &trailing[..]);
        }
    }
}
