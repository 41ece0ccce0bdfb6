//! Wire framing for the socket transports.
//!
//! Every frame is length-prefixed (4 bytes, big-endian) followed by a one
//! byte tag and a tag-specific body:
//!
//! ```text
//! [len: u32][tag: u8][body ...]
//! ```
//!
//! Strings and byte fields are themselves `u32`-length-prefixed. An encoded
//! message is its payload field, a part count, then one field per part.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::driver::TransportError;
use crate::envelope::EncodedMessage;

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TAG_SUBSCRIBE: u8 = 1;
const TAG_CONNECT: u8 = 2;
const TAG_ACCEPT: u8 = 3;
const TAG_REJECT: u8 = 4;
const TAG_PUBLISH: u8 = 5;
const TAG_REQUEST: u8 = 6;
const TAG_RESPONSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame of a subscriber connection.
    Subscribe { topic: String },
    /// First frame of a client connection.
    Connect { service: String },
    /// Hub accepted a client connection.
    Accept,
    /// Hub refused a client connection.
    Reject { reason: String },
    Publish { topic: String, message: EncodedMessage },
    Request { seq: u64, message: EncodedMessage },
    Response { seq: u64, message: EncodedMessage },
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        match self {
            Frame::Subscribe { topic } => {
                body.put_u8(TAG_SUBSCRIBE);
                put_field(&mut body, topic.as_bytes());
            }
            Frame::Connect { service } => {
                body.put_u8(TAG_CONNECT);
                put_field(&mut body, service.as_bytes());
            }
            Frame::Accept => body.put_u8(TAG_ACCEPT),
            Frame::Reject { reason } => {
                body.put_u8(TAG_REJECT);
                put_field(&mut body, reason.as_bytes());
            }
            Frame::Publish { topic, message } => {
                body.put_u8(TAG_PUBLISH);
                put_field(&mut body, topic.as_bytes());
                put_message(&mut body, message);
            }
            Frame::Request { seq, message } => {
                body.put_u8(TAG_REQUEST);
                body.put_u64(*seq);
                put_message(&mut body, message);
            }
            Frame::Response { seq, message } => {
                body.put_u8(TAG_RESPONSE);
                body.put_u64(*seq);
                put_message(&mut body, message);
            }
        }

        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::Frame(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32(body.len() as u32);
        framed.extend_from_slice(&body);
        Ok(framed.freeze())
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(mut body: Bytes) -> Result<Self, TransportError> {
        if !body.has_remaining() {
            return Err(truncated());
        }
        let frame = match body.get_u8() {
            TAG_SUBSCRIBE => Frame::Subscribe {
                topic: take_string(&mut body)?,
            },
            TAG_CONNECT => Frame::Connect {
                service: take_string(&mut body)?,
            },
            TAG_ACCEPT => Frame::Accept,
            TAG_REJECT => Frame::Reject {
                reason: take_string(&mut body)?,
            },
            TAG_PUBLISH => Frame::Publish {
                topic: take_string(&mut body)?,
                message: take_message(&mut body)?,
            },
            TAG_REQUEST => Frame::Request {
                seq: take_u64(&mut body)?,
                message: take_message(&mut body)?,
            },
            TAG_RESPONSE => Frame::Response {
                seq: take_u64(&mut body)?,
                message: take_message(&mut body)?,
            },
            tag => return Err(TransportError::Frame(format!("unknown tag {}", tag))),
        };

        if body.has_remaining() {
            return Err(TransportError::Frame(format!(
                "{} trailing bytes",
                body.remaining()
            )));
        }
        Ok(frame)
    }
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Frame(format!("frame too large: {} bytes", len)));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::decode(Bytes::from(buf)).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn put_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}

fn put_message(buf: &mut BytesMut, message: &EncodedMessage) {
    put_field(buf, &message.payload);
    buf.put_u32(message.parts.len() as u32);
    for part in &message.parts {
        put_field(buf, part);
    }
}

fn truncated() -> TransportError {
    TransportError::Frame("truncated frame".to_string())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, TransportError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, TransportError> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn take_field(buf: &mut Bytes) -> Result<Bytes, TransportError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn take_string(buf: &mut Bytes) -> Result<String, TransportError> {
    let field = take_field(buf)?;
    String::from_utf8(field.to_vec())
        .map_err(|e| TransportError::Frame(format!("invalid UTF-8 in frame: {}", e)))
}

fn take_message(buf: &mut Bytes) -> Result<EncodedMessage, TransportError> {
    let payload = take_field(buf)?;
    let count = take_u32(buf)? as usize;
    // Each part needs at least its length prefix.
    if count > buf.remaining() / 4 {
        return Err(truncated());
    }
    let parts = (0..count)
        .map(|_| take_field(buf))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EncodedMessage { payload, parts })
}
