//! TCP transport: one length-prefixed message per frame, receive with timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uav_core::wire::{self, Codec, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};
use uav_core::Message;

const LEN_SIZE: usize = 4;

/// A message could not be moved across the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("no message within {0:?}")]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
}

/// Message-oriented wrapper over a byte stream.
pub struct FramedConnection<S> {
    stream: S,
    codec: Arc<dyn Codec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedConnection<S> {
    pub fn new(stream: S, codec: Arc<dyn Codec>) -> Self {
        Self { stream, codec }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let frame = wire::encode_frame(self.codec.as_ref(), msg)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next message, or `Timeout` if none arrives in time. EOF before a full frame is `Closed`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Message, TransportError> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn read_frame(&mut self) -> Result<Message, TransportError> {
        let mut len_buf = [0u8; LEN_SIZE];
        read_exact_or_closed(&mut self.stream, &mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge.into());
        }
        let mut payload = vec![0u8; len as usize];
        read_exact_or_closed(&mut self.stream, &mut payload).await?;
        Ok(self.codec.decode(&payload)?)
    }
}

async fn read_exact_or_closed<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(e.into()),
    }
}

pub async fn connect(
    addr: SocketAddr,
    codec: Arc<dyn Codec>,
) -> Result<FramedConnection<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(FramedConnection::new(stream, codec))
}

pub async fn accept(
    listener: &TcpListener,
    codec: Arc<dyn Codec>,
) -> Result<(FramedConnection<TcpStream>, SocketAddr), TransportError> {
    let (stream, addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((FramedConnection::new(stream, codec), addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uav_core::{field, BincodeCodec, JsonCodec};

    fn pair(codec: Arc<dyn Codec>) -> (
        FramedConnection<tokio::io::DuplexStream>,
        FramedConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (
            FramedConnection::new(a, codec.clone()),
            FramedConnection::new(b, codec),
        )
    }

    #[tokio::test]
    async fn send_receive_both_codecs() {
        for codec in [Arc::new(BincodeCodec) as Arc<dyn Codec>, Arc::new(JsonCodec)] {
            let (mut a, mut b) = pair(codec);
            let msg = Message::new("A").with_block(field::M0, &[3u8; 32]);
            a.send(&msg).await.unwrap();
            assert_eq!(b.receive(Duration::from_secs(1)).await.unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (_a, mut b) = pair(Arc::new(BincodeCodec));
        let err = b.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn dropped_peer_is_closed() {
        let (a, mut b) = pair(Arc::new(BincodeCodec));
        drop(a);
        let err = b.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut b = FramedConnection::new(b, Arc::new(JsonCodec));
        raw.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        let err = b.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Decode(FrameDecodeError::TooLarge)));
    }
}
