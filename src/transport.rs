//! Length-framed packet transport over a connected Unix domain socket
//! (spec §4.1, §6.1).
//!
//! [`Transport`] exposes exactly two operations, `send` and `receive`, over
//! a full-duplex stream; it does not interpret payload bytes beyond the
//! type byte needed to decode a [`Packet`]. The socket is exclusively owned
//! by the `Transport` — callers must not read or write it directly, and
//! concurrent calls to `send` or `receive` on the same `Transport` race on
//! the same socket (callers serialize access themselves, e.g. via the
//! command mutex in [`crate::command`]).
//!
//! The event transport needs a genuinely concurrent reader (the listener
//! loop) and writer (subscribe/unsubscribe), which a single `&mut self`
//! struct can't give two independent tasks at once. [`read_frame`] and
//! [`write_frame`] are the split-half building blocks [`crate::event`] uses
//! directly on `OwnedReadHalf`/`OwnedWriteHalf` for that case.

use crate::error::{Error, Result};
use crate::packet::Packet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

/// Maximum frame length (spec §4.1): a peer advertising more is a fatal
/// protocol error.
pub const MAX_PACKET_LEN: usize = 512 * 1024;

/// Encodes `packet` and writes the length-prefixed frame to `writer`.
/// `AsyncWriteExt::write_all` already loops until every byte is delivered
/// or the socket errors.
pub(crate) async fn write_frame<W>(writer: &mut W, packet: &Packet, max_packet_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = packet.encode()?;
    if body.is_empty() || body.len() > max_packet_len {
        return Err(Error::Encode(format!(
            "packet of {} bytes exceeds the {max_packet_len}-byte frame limit",
            body.len(),
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);

    trace!(bytes = frame.len(), "sending frame");
    writer.write_all(&frame).await.map_err(Error::transport)?;
    writer.flush().await.map_err(Error::transport)?;
    Ok(())
}

/// Reads exactly one frame from `reader` and decodes it into a [`Packet`].
/// `AsyncReadExt::read_exact` loops on short reads and turns a mid-frame
/// EOF into an error, matching spec §4.1.
pub(crate) async fn read_frame<R>(reader: &mut R, max_packet_len: usize) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(Error::transport)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len == 0 {
        return Err(Error::Protocol(
            "frame length must cover at least the type byte".into(),
        ));
    }
    if len > max_packet_len {
        return Err(Error::Protocol(format!(
            "peer advertised a {len}-byte frame, exceeds the {max_packet_len}-byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(Error::transport)?;

    trace!(bytes = len + 4, "received frame");
    Packet::decode(body[0], &body[1..])
}

pub struct Transport {
    stream: UnixStream,
    max_packet_len: usize,
}

impl Transport {
    pub fn new(stream: UnixStream) -> Self {
        Self::with_max_packet_len(stream, MAX_PACKET_LEN)
    }

    pub fn with_max_packet_len(stream: UnixStream, max_packet_len: usize) -> Self {
        Self {
            stream,
            max_packet_len,
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        write_frame(&mut self.stream, packet, self.max_packet_len).await
    }

    pub async fn receive(&mut self) -> Result<Packet> {
        read_frame(&mut self.stream, self.max_packet_len).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn framing_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Transport::new(a);
        let mut server = Transport::new(b);

        let mut msg = Message::new();
        msg.insert_scalar("ike", b"home".to_vec()).unwrap();
        let sent = Packet::cmd_request("initiate", msg);

        client.send(&sent).await.unwrap();
        let received = server.receive().await.unwrap();

        assert_eq!(received.packet_type, sent.packet_type);
        assert_eq!(received.name, sent.name);
        assert_eq!(received.message, sent.message);
    }

    #[tokio::test]
    async fn oversized_frame_is_a_protocol_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut server = Transport::new(b);

        // Write a bogus 0x00FFFFFF length prefix directly, bypassing
        // `send`'s own size guard, to simulate a misbehaving peer (scenario S6).
        a.write_all(&0x00FF_FFFFu32.to_be_bytes()).await.unwrap();

        let err = server.receive().await;
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_protocol_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut server = Transport::new(b);

        a.write_all(&0u32.to_be_bytes()).await.unwrap();

        let err = server.receive().await;
        assert!(matches!(err, Err(Error::Protocol(_))));
    }
}
