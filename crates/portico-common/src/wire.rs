use bson::Document;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, WireError};

/// OP_MSG opcode, the only one issued or accepted here.
pub const OP_MSG: i32 = 2013;

/// Standard message header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Server-side maximum message size; anything larger is a broken peer.
const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Flag bit signalling a trailing CRC-32C checksum on the message.
const FLAG_CHECKSUM_PRESENT: u32 = 1;

/// Wire message header, little-endian on the wire.
///
/// ```text
/// [message_length:i32] [request_id:i32] [response_to:i32] [op_code:i32]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            message_length: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            request_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            op_code: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        buf
    }
}

/// Writes one OP_MSG carrying a single kind-0 document section.
pub async fn write_message<W>(
    stream: &mut W,
    request_id: i32,
    response_to: i32,
    document: &Document,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&0u32.to_le_bytes()); // flag bits
    body.push(0); // section kind 0: single document
    document.to_writer(&mut body)?;

    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to,
        op_code: OP_MSG,
    };
    stream.write_all(&header.to_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one OP_MSG and returns its header and kind-0 body document.
pub async fn read_message<R>(stream: &mut R) -> Result<(MsgHeader, Document)>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await?;
    let header = MsgHeader::parse(&header_buf);

    if header.op_code != OP_MSG {
        return Err(WireError::InvalidReply(format!(
            "unsupported opcode {}",
            header.op_code
        )));
    }
    let total = header.message_length as usize;
    if total < HEADER_LEN + 5 || total > MAX_MESSAGE_SIZE {
        return Err(WireError::InvalidReply(format!(
            "message length {} out of range",
            header.message_length
        )));
    }

    let mut body = vec![0u8; total - HEADER_LEN];
    stream.read_exact(&mut body).await?;

    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let doc_end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
        body.len().saturating_sub(4)
    } else {
        body.len()
    };
    if body[4] != 0 {
        return Err(WireError::InvalidReply(format!(
            "unsupported section kind {}",
            body[4]
        )));
    }

    let document = Document::from_reader(Cursor::new(&body[5..doc_end]))?;
    Ok((header, document))
}
