//! Per-connection state.
//!
//! A connection is split in two. The router keeps a [`Session`] holding the
//! username and the outbound handle; the connection task keeps the
//! [`FrameReader`] holding the receive buffer. Only the connection task ever
//! touches the buffer.

use std::{io, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::{envelope::ServerEnvelope, frame::FrameCodec};

pub type SessionId = u64;

/// Encoded frames waiting to be written to one connection. Unbounded: a slow
/// reader is not pushed back on.
pub type Outbox = mpsc::UnboundedSender<Bytes>;

/// Router-side view of one live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    username: Option<String>,
    outbox: Outbox,
}

impl Session {
    pub fn new(id: SessionId, peer: Option<SocketAddr>, outbox: Outbox) -> Self {
        Self {
            id,
            peer,
            username: None,
            outbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Empty until the session registers.
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    pub fn is_registered(&self) -> bool {
        self.username.is_some()
    }

    pub(crate) fn set_username(&mut self, username: String) {
        self.username = Some(username);
    }

    /// Queues an already-encoded frame. Returns false once the connection
    /// task has gone away.
    pub fn deliver(&self, frame: Bytes) -> bool {
        if self.outbox.send(frame).is_err() {
            debug!(session = self.id, "dropping frame for closed connection");
            return false;
        }
        true
    }

    pub fn send(&self, envelope: &ServerEnvelope) -> bool {
        match envelope.to_frame() {
            Ok(frame) => self.deliver(frame),
            Err(error) => {
                warn!(session = self.id, %error, "failed to encode envelope");
                false
            }
        }
    }
}

/// Reads raw bytes from a connection and cuts them into frames.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R> FrameReader<R>
where
    R: tokio::io::AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            codec: FrameCodec,
        }
    }

    /// Performs one read and returns every frame that is now complete, in
    /// arrival order. The list is empty when only part of a frame arrived.
    /// `None` means the peer closed the stream.
    ///
    /// Cancel safe: bytes that were read stay in the buffer.
    pub async fn read_frames(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        if self.reader.read_buf(&mut self.buffer).await? == 0 {
            if !self.buffer.is_empty() {
                debug!(
                    pending = self.buffer.len(),
                    "peer closed with a partial frame buffered"
                );
            }
            return Ok(None);
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(Some(frames))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::frame;

    #[test]
    fn session_starts_unregistered() {
        let (outbox, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(1, None, outbox);
        assert!(!session.is_registered());
        assert_eq!(session.username(), "");

        session.set_username("alice".into());
        assert!(session.is_registered());
        assert_eq!(session.username(), "alice");
    }

    #[test]
    fn deliver_reports_closed_connection() {
        let (outbox, rx) = mpsc::unbounded_channel();
        let session = Session::new(7, None, outbox);
        assert!(session.send(&ServerEnvelope::error("x")));
        drop(rx);
        assert!(!session.send(&ServerEnvelope::error("y")));
    }

    #[tokio::test]
    async fn reader_buffers_partial_frames_and_drains_batches() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        let first = frame::encode(b"first").expect("encode");
        client.write_all(&first[..6]).await.expect("write");
        let frames = reader.read_frames().await.expect("read").expect("open");
        assert!(frames.is_empty());

        let mut rest = first[6..].to_vec();
        rest.extend_from_slice(&frame::encode(b"second").expect("encode"));
        rest.extend_from_slice(&frame::encode(b"third").expect("encode"));
        client.write_all(&rest).await.expect("write");

        let frames = reader.read_frames().await.expect("read").expect("open");
        assert_eq!(frames, vec![&b"first"[..], &b"second"[..], &b"third"[..]]);

        drop(client);
        assert!(reader.read_frames().await.expect("read").is_none());
    }
}
