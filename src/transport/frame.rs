//! Reliable-channel framing.
//!
//! Every message on the TCP channel is a 16-byte header followed by an
//! opaque payload: opcode `u32`, correlation id `u32`, payload length `u64`,
//! all big-endian. Responses echo the request's correlation id. The reader
//! tolerates partial reads and never buffers more than one payload.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 16;

/// Envelope slack on top of one block: names, ids and bincode overhead.
pub const FRAME_SLACK: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("payload of {got} bytes exceeds the {max} byte limit")]
    Oversized { got: u64, max: u64 },

    #[error("malformed payload: {0}")]
    BadPayload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    Hello = 1,
    Welcome = 2,
    PeerList = 3,
    MetaSync = 4,
    BlockPut = 5,
    BlockGet = 6,
    BlockGetReply = 7,
    BlockDelete = 8,
    FileAnnounce = 9,
    FileDelete = 10,
    CapacityUpdate = 11,
    /// Generic response carrier for requests without a dedicated reply shape.
    Ack = 12,
}

impl OpCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Hello,
            2 => Self::Welcome,
            3 => Self::PeerList,
            4 => Self::MetaSync,
            5 => Self::BlockPut,
            6 => Self::BlockGet,
            7 => Self::BlockGetReply,
            8 => Self::BlockDelete,
            9 => Self::FileAnnounce,
            10 => Self::FileDelete,
            11 => Self::CapacityUpdate,
            12 => Self::Ack,
            _ => return None,
        })
    }
}

#[derive(Debug)]
pub struct Frame {
    pub op: OpCode,
    pub correlation: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(op: OpCode, correlation: u32, payload: Vec<u8>) -> Self {
        Self {
            op,
            correlation,
            payload,
        }
    }
}

/// Reads one frame. `max_payload` is one group block plus [`FRAME_SLACK`];
/// anything larger is a protocol violation and the caller closes the
/// connection.
pub async fn read_frame<R>(reader: &mut R, max_payload: u64) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }

    let raw_op = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let correlation = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let len = u64::from_be_bytes(header[8..16].try_into().unwrap());

    let op = OpCode::from_u32(raw_op).ok_or(FrameError::UnknownOpcode(raw_op))?;
    if len > max_payload {
        return Err(FrameError::Oversized {
            got: len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        op,
        correlation,
        payload,
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(frame.op as u32).to_be_bytes());
    header[4..8].copy_from_slice(&frame.correlation.to_be_bytes());
    header[8..16].copy_from_slice(&(frame.payload.len() as u64).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}
