//! Byte-level framing: `[id: u32][type: u16][length: u32][payload]`, all
//! integers big-endian (§4.3). This module turns a [`Packet`] into bytes
//! ready to hand to a transport and back; it knows nothing about sockets.

use crate::packet::{Packet, PacketKind};
use bytes::{Buf, BufMut, BytesMut};
use neo_base::{err, Error};

pub const HEADER_LEN: usize = 4 + 2 + 4;

/// Maximum payload length accepted from the wire. Guards against a
/// corrupt or malicious length field causing an unbounded allocation.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// A decoded frame: the request id chosen by the sender (echoed by the
/// matching answer; fresh for notifications) and the packet it carries.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u32,
    pub packet: Packet,
}

impl Frame {
    pub fn new(id: u32, packet: Packet) -> Frame {
        Frame { id, packet }
    }

    pub fn encode(&self) -> Result<BytesMut, Error> {
        let payload = self.packet.encode_payload()?;
        if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(err("payload exceeds maximum frame length"));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(self.id);
        buf.put_u16(self.packet.kind().as_u16());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf)
    }
}

/// The three header fields, once enough bytes have arrived to read them.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    pub id: u32,
    pub kind: u16,
    pub length: u32,
}

/// Attempts to parse one frame header from the front of `buf` without
/// consuming anything. Returns `None` if fewer than `HEADER_LEN` bytes are
/// buffered yet.
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut cursor = buf;
    let id = cursor.get_u32();
    let kind = cursor.get_u16();
    let length = cursor.get_u32();
    Some(FrameHeader { id, kind, length })
}

/// Attempts to parse one complete frame from the front of `buf`, advancing
/// past it on success. Returns `Ok(None)` if the frame isn't fully buffered
/// yet; the caller should wait for more bytes and retry.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
    let header = match peek_header(buf) {
        Some(h) => h,
        None => return Ok(None),
    };
    if header.length > MAX_PAYLOAD_LEN {
        return Err(err("frame length exceeds maximum"));
    }
    let total = HEADER_LEN + header.length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let kind = PacketKind::from_u16(header.kind).ok_or_else(|| err("unknown packet type"))?;
    buf.advance(HEADER_LEN);
    let payload = buf.split_to(header.length as usize);
    let packet = Packet::decode_payload(kind, &payload)?;
    Ok(Some(Frame::new(header.id, packet)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{AskPrimary, Packet};
    use test_log::test;

    #[test]
    fn encode_then_decode_one_frame() {
        let frame = Frame::new(42, Packet::AskPrimary(AskPrimary));
        let mut bytes = frame.encode().unwrap();
        let decoded = try_decode_frame(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.packet.kind(), PacketKind::AskPrimary);
        assert!(bytes.is_empty());
    }

    #[test]
    fn partial_frame_yields_none_without_consuming() {
        let frame = Frame::new(1, Packet::AskPrimary(AskPrimary));
        let full = frame.encode().unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        let result = try_decode_frame(&mut partial).unwrap();
        assert!(result.is_none());
        assert_eq!(partial.len(), full.len() - 1);
    }

    #[test]
    fn two_frames_back_to_back_decode_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(1, Packet::AskPrimary(AskPrimary)).encode().unwrap());
        buf.extend_from_slice(
            &Frame::new(2, Packet::ReelectPrimaryMaster(crate::packet::ReelectPrimaryMaster))
                .encode()
                .unwrap(),
        );
        let first = try_decode_frame(&mut buf).unwrap().unwrap();
        let second = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(0xbeef);
        buf.put_u32(0);
        assert!(try_decode_frame(&mut buf).is_err());
    }
}
