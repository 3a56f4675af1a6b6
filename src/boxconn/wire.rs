//! BOX wire protocol framing (§6.2): a 4-byte big-endian length prefix
//! around a packed [`Message`].
//!
//! Shaped after `crate::connection::Connection` (`BufWriter<TcpStream>` plus
//! a `BytesMut` accumulation buffer, read-until-enough-data), but framing
//! [`Message`] instead of an SMPP `Frame` — the two envelopes don't share a
//! type, so this is a parallel reader/writer rather than a reuse of
//! `Connection` itself.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::message::{Message, MessageError};

const LENGTH_PREFIX_BYTES: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u32),
    #[error("malformed message: {0}")]
    Malformed(#[from] MessageError),
    #[error("connection reset mid-frame")]
    ResetMidFrame,
}

/// A length-prefixed [`Message`] reader/writer over one `TcpStream`.
pub struct MessageConn {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl MessageConn {
    pub fn new(socket: TcpStream) -> MessageConn {
        MessageConn { stream: BufWriter::new(socket), buffer: BytesMut::with_capacity(4 * 1024) }
    }

    /// Reads one length-prefixed `Message`. Returns `Ok(None)` on a clean
    /// peer shutdown between frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            if let Some(msg) = self.parse_message()? {
                return Ok(Some(msg));
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() { Ok(None) } else { Err(WireError::ResetMidFrame) };
            }
        }
    }

    fn parse_message(&mut self) -> Result<Option<Message>, WireError> {
        parse_message(&mut self.buffer)
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<(), WireError> {
        let body = msg.pack();
        self.stream.write_u32(body.len() as u32).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.get_ref().peer_addr()
    }

    /// Splits into independent halves so the receiver and sender fibers
    /// (§4.6's `boxc_receiver`/`boxc_sender` pair) can run concurrently —
    /// `crate::connection::Connection` doesn't need this since the SMPP
    /// client drives one `DefaultClient` sequentially instead.
    pub fn into_split(self) -> (MessageReader, MessageWriter) {
        let (read_half, write_half) = self.stream.into_inner().into_split();
        (MessageReader { stream: read_half, buffer: self.buffer }, MessageWriter { stream: BufWriter::new(write_half) })
    }
}

pub struct MessageReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

impl MessageReader {
    pub async fn read_message(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            if let Some(msg) = parse_message(&mut self.buffer)? {
                return Ok(Some(msg));
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() { Ok(None) } else { Err(WireError::ResetMidFrame) };
            }
        }
    }
}

pub struct MessageWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl MessageWriter {
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), WireError> {
        let body = msg.pack();
        self.stream.write_u32(body.len() as u32).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn parse_message(buffer: &mut BytesMut) -> Result<Option<Message>, WireError> {
    if buffer.len() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buffer[..LENGTH_PREFIX_BYTES].try_into().unwrap());
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    let total = LENGTH_PREFIX_BYTES + len as usize;
    if buffer.len() < total {
        buffer.reserve(total - buffer.len());
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX_BYTES);
    let body = buffer.split_to(len as usize);
    let msg = Message::unpack(&body)?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Coding, MessageClass, SmsFields, SmsType};
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    fn sample() -> Message {
        Message::new_sms(SmsFields {
            sender: "1000".into(),
            receiver: "+491761234".into(),
            msgdata: Bytes::from_static(b"hello"),
            udhdata: None,
            coding: Coding::Default7Bit,
            message_class: MessageClass::Undef,
            mwi: false,
            compress: false,
            dlr_mask: 0,
            dlr_url: None,
            validity: None,
            deferred: None,
            service_name: None,
            account: None,
            billing_info: None,
            priority: 0,
            protocol_id: 0,
            boxc_id: None,
            sms_type: SmsType::MtPush,
            split_parts: None,
        })
    }

    async fn pair() -> (MessageConn, MessageConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (MessageConn::new(client), MessageConn::new(server))
    }

    #[tokio::test]
    async fn round_trips_a_message_over_a_real_socket() {
        let (mut a, mut b) = pair().await;
        let msg = sample();
        a.write_message(&msg).await.unwrap();
        let received = b.read_message().await.unwrap().unwrap();
        assert_eq!(received.sms().unwrap().receiver, "+491761234");
    }

    #[tokio::test]
    async fn read_returns_none_on_clean_shutdown_between_frames() {
        let (a, mut b) = pair().await;
        drop(a);
        assert!(b.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multiple_messages_pipeline_over_one_connection() {
        let (mut a, mut b) = pair().await;
        a.write_message(&sample()).await.unwrap();
        a.write_message(&sample()).await.unwrap();
        b.read_message().await.unwrap().unwrap();
        b.read_message().await.unwrap().unwrap();
    }
}
