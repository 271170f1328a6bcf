//! Length-prefixed binary framing over TCP.
//!
//! Request frames: `rpc id (u16 BE) | body length (u32 BE) | bincode body`.
//! Reply frames and listen-stream event frames drop the id:
//! `body length (u32 BE) | bincode body`. Field layout inside a body is
//! whatever bincode derives for the message structs, which is stable within
//! a deployment.

use bincode::{Decode, Encode};
use convi::{CastInto as _, ExpectInto as _};
use evhub_core::Event;
use evhub_core::bincode::STD_BINCODE_CONFIG;
use snafu::ResultExt as _;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::{
    ConnectSnafu, DecodingSnafu, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, MessageTooLargeSnafu,
    ReadSnafu, RpcError, RpcId, RpcRequest, RpcResult, WireResult, WriteSnafu,
};

impl RpcId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(id: u16) -> RpcResult<Self> {
        Ok(match id {
            0 => Self::RegisterClient,
            1 => Self::DeleteClient,
            2 => Self::IsClientExists,
            3 => Self::SendEvent,
            4 => Self::ListEvents,
            5 => Self::ListAllEvents,
            6 => Self::CountEvents,
            7 => Self::GetLatestVersion,
            8 => Self::ListenEvents,
            9 => Self::ListenAllEvents,
            10 => Self::ListMembers,
            id => return Err(RpcError::UnknownRpcId { id }),
        })
    }
}

pub fn encode_message<T>(v: &T) -> Vec<u8>
where
    T: Encode,
{
    bincode::encode_to_vec(v, STD_BINCODE_CONFIG).expect("Can't fail")
}

pub fn decode_message<T>(bytes: &[u8]) -> RpcResult<T>
where
    T: Decode<()>,
{
    Ok(bincode::decode_from_slice(bytes, STD_BINCODE_CONFIG)
        .context(DecodingSnafu)?
        .0)
}

async fn write_length_prefixed(
    write: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
) -> RpcResult<()> {
    let len: u32 = body.len().expect_into();
    write
        .write_all(&len.to_be_bytes())
        .await
        .context(WriteSnafu)?;
    write.write_all(body).await.context(WriteSnafu)?;
    Ok(())
}

async fn read_length_prefixed(
    read: &mut (impl AsyncRead + Unpin),
    limit: u32,
) -> RpcResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    read.read_exact(len_bytes.as_mut_slice())
        .await
        .context(ReadSnafu)?;

    let len = u32::from_be_bytes(len_bytes);
    if limit < len {
        return MessageTooLargeSnafu { len, limit }.fail();
    }

    let mut body = vec![0u8; len.cast_into()];
    read.read_exact(body.as_mut_slice())
        .await
        .context(ReadSnafu)?;
    Ok(body)
}

/// The wire size of the frame this event would be sent in.
pub fn event_frame_len(event: &Event) -> u32 {
    let body: u32 = encode_message(event).len().expect_into();
    body + 4
}

pub async fn write_event_frame(
    write: &mut (impl AsyncWrite + Unpin),
    event: &Event,
) -> RpcResult<()> {
    let body = encode_message(event);
    write_length_prefixed(write, &body).await?;
    write.flush().await.context(WriteSnafu)?;
    Ok(())
}

/// Reads one event frame; `Ok(None)` on a clean end of stream.
pub async fn read_event_frame(read: &mut (impl AsyncRead + Unpin)) -> RpcResult<Option<Event>> {
    match read_length_prefixed(read, MAX_RESPONSE_SIZE).await {
        Ok(body) => Ok(Some(decode_message(&body)?)),
        Err(RpcError::Read { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

pub struct Connection(TcpStream);

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Self(stream)
    }
}

impl Connection {
    pub async fn connect(addr: &str) -> RpcResult<Self> {
        Ok(Self(
            TcpStream::connect(addr).await.context(ConnectSnafu)?,
        ))
    }

    pub fn into_inner(self) -> TcpStream {
        self.0
    }

    /// One request/response round trip. A typed rejection from the other
    /// side surfaces as [`RpcError::Rejected`].
    pub async fn make_rpc<R: RpcRequest>(&mut self, request: &R) -> RpcResult<R::Okay> {
        self.0
            .write_all(&R::RPC_ID.to_u16().to_be_bytes())
            .await
            .context(WriteSnafu)?;
        let body = encode_message(request);
        write_length_prefixed(&mut self.0, &body).await?;
        self.0.flush().await.context(WriteSnafu)?;

        let reply_body = read_length_prefixed(&mut self.0, MAX_RESPONSE_SIZE).await?;
        let reply: WireResult<R::Okay> = decode_message(&reply_body)?;
        reply.map_err(|reply| RpcError::Rejected { reply })
    }

    /// Server side: next request frame, or `None` once the peer closed.
    pub async fn read_request_raw(&mut self) -> RpcResult<Option<(RpcId, Vec<u8>)>> {
        let mut id_bytes = [0u8; 2];
        match self.0.read_exact(id_bytes.as_mut_slice()).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(RpcError::Read { source: err }),
        }
        let id = RpcId::from_u16(u16::from_be_bytes(id_bytes))?;
        let body = read_length_prefixed(&mut self.0, MAX_REQUEST_SIZE).await?;
        Ok(Some((id, body)))
    }

    /// Server side: send the response body for the request just read.
    pub async fn write_reply<T: Encode>(&mut self, reply: &WireResult<T>) -> RpcResult<()> {
        let body = encode_message(reply);
        write_length_prefixed(&mut self.0, &body).await?;
        self.0.flush().await.context(WriteSnafu)?;
        Ok(())
    }

    /// Client side of a listen stream, after the `ListenStarted` ack.
    pub async fn read_event(&mut self) -> RpcResult<Option<Event>> {
        read_event_frame(&mut self.0).await
    }
}
