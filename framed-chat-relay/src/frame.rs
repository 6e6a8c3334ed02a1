//! Length-prefixed framing over a byte stream.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes: `[u32 length][payload]`. A frame only exists once both the
//! prefix and the whole payload have arrived; anything shorter stays buffered.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Prepends the payload length to `payload`.
///
/// Fails with `InvalidInput` when the payload does not fit a `u32` prefix.
pub fn encode(payload: &[u8]) -> io::Result<Bytes> {
    let len = prefix_for(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

fn prefix_for(len: usize) -> io::Result<u32> {
    u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large"))
}

/// Splits the first complete frame off `buffer`.
///
/// Returns `(None, buffer)` untouched when the prefix or the payload is still
/// incomplete; otherwise the payload and whatever follows it.
pub fn decode(buffer: &[u8]) -> (Option<&[u8]>, &[u8]) {
    match frame_len(buffer) {
        Some(len) => {
            let (frame, rest) = buffer.split_at(HEADER_LEN + len);
            (Some(&frame[HEADER_LEN..]), rest)
        }
        None => (None, buffer),
    }
}

/// Payload length of the first frame in `buffer`, if all of it is present.
fn frame_len(buffer: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = buffer.get(..HEADER_LEN)?.try_into().ok()?;
    let len = u32::from_be_bytes(header) as usize;
    (buffer.len() - HEADER_LEN >= len).then_some(len)
}

/// [`tokio_util`] codec applying the same framing rules to a `BytesMut`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        let Some(len) = frame_len(&src[..]) else {
            return Ok(None);
        };
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = prefix_for(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = encode(b"hi").expect("encode");
        assert_eq!(&frame[..], &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn length_prefix_refuses_what_u32_cannot_hold() {
        assert_eq!(prefix_for(u32::MAX as usize).expect("fits"), u32::MAX);
        if let Some(too_long) = (u32::MAX as usize).checked_add(1) {
            let error = prefix_for(too_long).expect_err("too large");
            assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn decode_returns_payload_and_empty_remainder() {
        let frame = encode(b"{\"USERNAME\":\"alice\"}").expect("encode");
        let (payload, rest) = decode(&frame);
        assert_eq!(payload, Some(&b"{\"USERNAME\":\"alice\"}"[..]));
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_handles_empty_payload() {
        let frame = encode(b"").expect("encode");
        assert_eq!(decode(&frame), (Some(&b""[..]), &b""[..]));
    }

    #[test]
    fn decode_waits_for_complete_prefix_and_payload() {
        let frame = encode(b"hello").expect("encode");
        assert_eq!(decode(&frame[..3]), (None, &frame[..3]));
        assert_eq!(decode(&frame[..4]), (None, &frame[..4]));
        assert_eq!(decode(&frame[..8]), (None, &frame[..8]));
    }

    #[test]
    fn decode_leaves_following_frames_in_remainder() {
        let mut stream = encode(b"one").expect("encode").to_vec();
        stream.extend_from_slice(&encode(b"two").expect("encode"));
        stream.extend_from_slice(&encode(b"three").expect("encode")[..5]);

        let (first, rest) = decode(&stream);
        assert_eq!(first, Some(&b"one"[..]));
        let (second, rest) = decode(rest);
        assert_eq!(second, Some(&b"two"[..]));
        let (third, rest) = decode(rest);
        assert_eq!(third, None);
        assert_eq!(rest.len(), 5);
    }

    #[test]
    fn codec_emits_one_frame_for_every_split_point() {
        let payload = b"{\"MESSAGES\":[[\"alice\",\"ALL\",1,\"hi\"]]}";
        let frame = encode(payload).expect("encode");

        for split in 0..=frame.len() {
            let mut codec = FrameCodec;
            let mut buffer = BytesMut::new();
            let mut emitted = Vec::new();

            for chunk in [&frame[..split], &frame[split..]] {
                buffer.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut buffer).expect("decode never fails") {
                    emitted.push(frame);
                }
            }

            assert_eq!(emitted.len(), 1, "split at {split}");
            assert_eq!(&emitted[0][..], &payload[..]);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn codec_drains_back_to_back_frames_in_order() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        for payload in [&b"a"[..], &b"bb"[..], &b"ccc"[..]] {
            codec
                .encode(Bytes::copy_from_slice(payload), &mut buffer)
                .expect("encode");
        }

        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buffer).expect("decode") {
            frames.push(frame);
        }

        assert_eq!(frames, vec![&b"a"[..], &b"bb"[..], &b"ccc"[..]]);
    }
}
