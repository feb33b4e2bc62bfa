//! The binding handshake spoken to the tunnel ingress.
//!
//! Each message is framed as a little-endian `u16` length followed by the
//! protobuf-encoded body. The client sends a [`ConnRequest`] naming the bound
//! host and port and reads back a [`ConnResponse`]; a response carrying an
//! error code or message means the ingress refused the connection.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Clone, PartialEq, Message)]
pub struct ConnRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(int64, tag = "2")]
    pub port: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnResponse {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
    #[prost(string, tag = "2")]
    pub proto: String,
    #[prost(string, tag = "3")]
    pub error_code: String,
    #[prost(string, tag = "4")]
    pub error_message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("handshake message too large: {0} bytes")]
    TooLarge(usize),

    #[error("connection rejected: {code}: {message}")]
    Rejected { code: String, message: String },
}

/// Performs the client side of the handshake on `io`.
///
/// On success the stream is positioned at the start of the proxied byte
/// stream.
pub async fn handshake<IO>(io: &mut IO, host: &str, port: u16) -> Result<ConnResponse, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let req = ConnRequest {
        host: host.to_string(),
        port: port.into(),
    };
    write_frame(io, &req).await?;

    let rsp = read_frame::<_, ConnResponse>(io).await?;
    if !rsp.error_code.is_empty() || !rsp.error_message.is_empty() {
        return Err(HandshakeError::Rejected {
            code: rsp.error_code,
            message: rsp.error_message,
        });
    }
    Ok(rsp)
}

pub async fn write_frame<IO, M>(io: &mut IO, msg: &M) -> Result<(), HandshakeError>
where
    IO: AsyncWrite + Unpin,
    M: Message,
{
    let body = msg.encode_to_vec();
    let len = u16::try_from(body.len()).map_err(|_| HandshakeError::TooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<IO, M>(io: &mut IO) -> Result<M, HandshakeError>
where
    IO: AsyncRead + Unpin,
    M: Message + Default,
{
    let len = io.read_u16_le().await?;
    let mut body = vec![0u8; usize::from(len)];
    io.read_exact(&mut body).await?;
    Ok(M::decode(&body[..])?)
}
