//! Frame codec.
//!
//! Every message travels in one frame:
//!
//! ```text
//! [ChainPack UInt: len][protocol byte][payload of len - 1 bytes]
//! ```
//!
//! `len` counts the protocol byte plus the payload. The protocol byte selects
//! ChainPack (1), Cpon (2) or JSON-RPC (3) for the payload.

use crate::config::RpcConfig;
use crate::error::{Result, ShvError};
use bytes::{BufMut, BytesMut};
use shv_chainpack::codec::chainpack::{uint_data_size, write_uint_data, ChainPackReader};
use shv_chainpack::rpc::{decode_message, encode_message, parse_message, RpcMessage};
use shv_chainpack::ProtocolType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One decoded frame: protocol plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: ProtocolType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(protocol: ProtocolType, payload: Vec<u8>) -> Self {
        Self { protocol, payload }
    }

    /// Serialize a message for `protocol`.
    pub fn from_message(message: &RpcMessage, protocol: ProtocolType) -> Result<Self> {
        let payload = encode_message(&message.to_rpc_value(), protocol)?;
        Ok(Self::new(protocol, payload))
    }

    /// Decode and classify the payload.
    pub fn to_message(&self) -> Result<RpcMessage> {
        let value = decode_message(&self.payload, self.protocol)?;
        Ok(parse_message(&value)?)
    }
}

/// Read one frame.
///
/// Returns `None` on clean EOF before the first length byte. EOF inside a
/// frame, a length above [`RpcConfig::MAX_MESSAGE_SIZE`] and an unknown
/// protocol byte are errors.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let head = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut len_buf = vec![0u8; uint_data_size(head)];
    len_buf[0] = head;
    reader.read_exact(&mut len_buf[1..]).await?;
    let len = ChainPackReader::new(&len_buf[..])
        .read_uint_data()
        .map_err(|e| ShvError::Frame {
            message: format!("Invalid frame length: {}", e),
        })?;

    if len == 0 {
        return Err(ShvError::Frame {
            message: "Frame without protocol byte".to_string(),
        });
    }
    if len > RpcConfig::MAX_MESSAGE_SIZE as u64 {
        return Err(ShvError::Frame {
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let protocol_byte = reader.read_u8().await?;
    let protocol = ProtocolType::from_u8(protocol_byte).ok_or_else(|| ShvError::Frame {
        message: format!("Unknown protocol byte {}", protocol_byte),
    })?;

    let mut payload = vec![0u8; len as usize - 1];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::new(protocol, payload)))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = frame.payload.len() + 1;
    if len > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(ShvError::Frame {
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut buf = BytesMut::with_capacity(len + 9);
    {
        let mut header = (&mut buf).writer();
        write_uint_data(&mut header, len as u64)?;
    }
    buf.put_u8(frame.protocol.as_u8());
    buf.extend_from_slice(&frame.payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Message-level I/O on an unsplit stream, used during the handshake before
/// a connection actor takes the stream over.
pub struct RpcStream<S> {
    stream: S,
    protocol: ProtocolType,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RpcStream<S> {
    pub fn new(stream: S, protocol: ProtocolType) -> Self {
        Self { stream, protocol }
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: ProtocolType) {
        self.protocol = protocol;
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send(&mut self, message: &RpcMessage) -> Result<()> {
        let frame = Frame::from_message(message, self.protocol)?;
        write_frame(&mut self.stream, &frame).await
    }

    /// Next message and the protocol it arrived in. EOF is
    /// [`ShvError::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<(RpcMessage, ProtocolType)> {
        let frame = read_frame(&mut self.stream)
            .await?
            .ok_or(ShvError::ConnectionClosed)?;
        Ok((frame.to_message()?, frame.protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shv_chainpack::{RpcRequest, RpcValue};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let frame = Frame::new(ProtocolType::ChainPack, b"hello world".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        assert_eq!(buf[0], 12);
        assert_eq!(buf[1], 1);

        let mut cursor = Cursor::new(buf);
        let read = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_multi_byte_length() {
        let frame = Frame::new(ProtocolType::Cpon, vec![b'x'; 300]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        assert_eq!(uint_data_size(buf[0]), 2);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_frame_read_empty_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mut cursor = Cursor::new(vec![10u8, 1, b'a']);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let mut buf = Vec::new();
        write_uint_data(&mut buf, RpcConfig::MAX_MESSAGE_SIZE as u64 + 1).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ShvError::Frame { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_protocol_byte() {
        let mut cursor = Cursor::new(vec![2u8, 9, 0]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ShvError::Frame { .. })
        ));
    }

    #[tokio::test]
    async fn test_messages_in_every_protocol() {
        let request = RpcMessage::from(RpcRequest::new(
            "sensors/t1",
            "get",
            Some(RpcValue::from(1)),
            4,
        ));
        for protocol in [ProtocolType::ChainPack, ProtocolType::Cpon, ProtocolType::JsonRpc] {
            let frame = Frame::from_message(&request, protocol).unwrap();
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();
            let read = read_frame(&mut Cursor::new(buf)).await.unwrap().unwrap();
            assert_eq!(read.protocol, protocol);
            assert_eq!(read.to_message().unwrap(), request);
        }
    }

    #[tokio::test]
    async fn test_rpc_stream_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = RpcStream::new(a, ProtocolType::Cpon);
        let mut right = RpcStream::new(b, ProtocolType::ChainPack);

        let hello = RpcMessage::from(RpcRequest::new("", "hello", None, 1));
        left.send(&hello).await.unwrap();
        let (message, protocol) = right.recv().await.unwrap();
        assert_eq!(message, hello);
        assert_eq!(protocol, ProtocolType::Cpon);

        drop(left);
        assert!(matches!(right.recv().await, Err(ShvError::ConnectionClosed)));
    }
}
