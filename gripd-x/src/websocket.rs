//! WebSocket frame encoding and incremental parsing (RFC 6455).
//!
//! Only the framing layer lives here; the handshake belongs to the edge web
//! server. Lengths are encoded with the 7 / 7+16 / 7+64 bit scheme. A close
//! frame's payload begins with a 2-byte big-endian status code.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Published messages larger than this are fragmented into continuation
/// frames at this boundary.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Close status used when none is supplied.
pub const CLOSE_STATUS_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl Opcode {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Continuation),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// A close frame carrying a status code and optional reason text.
    pub fn close(status: u16, reason: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(status);
        payload.put_slice(reason);
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: payload.freeze(),
        }
    }

    /// Status code of a close frame. Empty payload means the default 1000.
    pub fn close_status(&self) -> u16 {
        if self.payload.len() >= 2 {
            u16::from_be_bytes([self.payload[0], self.payload[1]])
        } else {
            CLOSE_STATUS_NORMAL
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved opcode {0}")]
    ReservedOpcode(u8),

    #[error("control frame fragmented or oversized")]
    BadControlFrame,

    #[error("frame payload of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Encode a server-to-client frame (unmasked) into `out`.
pub fn encode_frame(frame: &Frame, out: &mut BytesMut) {
    let b0 = (if frame.fin { 0x80 } else { 0 }) | frame.opcode as u8;
    out.put_u8(b0);

    let len = frame.payload.len();
    if len <= 125 {
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(127);
        out.put_u64(len as u64);
    }

    out.put_slice(&frame.payload);
}

/// Fragment a message into frames no larger than [`MAX_FRAME_PAYLOAD`],
/// encoding each into `out`.
pub fn encode_message(opcode: Opcode, payload: &Bytes, out: &mut BytesMut) {
    if payload.len() <= MAX_FRAME_PAYLOAD {
        encode_frame(
            &Frame {
                fin: true,
                opcode,
                payload: payload.clone(),
            },
            out,
        );
        return;
    }

    let mut offset = 0;
    let mut first = true;
    while offset < payload.len() {
        let end = (offset + MAX_FRAME_PAYLOAD).min(payload.len());
        encode_frame(
            &Frame {
                fin: end == payload.len(),
                opcode: if first { opcode } else { Opcode::Continuation },
                payload: payload.slice(offset..end),
            },
            out,
        );
        first = false;
        offset = end;
    }
}

/// Try to parse one frame from the front of `buf`, consuming it on success.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
/// `max_payload` bounds a single frame's declared length.
pub fn parse_frame(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let raw_op = b0 & 0x0f;
    let masked = b1 & 0x80 != 0;
    let len7 = (b1 & 0x7f) as usize;

    let opcode = Opcode::from_raw(raw_op).ok_or(FrameError::ReservedOpcode(raw_op))?;

    let mut pos = 2;
    let payload_len = match len7 {
        126 => {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            len
        }
        127 => {
            if buf.len() < pos + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(raw) as usize
        }
        n => n,
    };

    if payload_len > max_payload {
        return Err(FrameError::TooLarge(payload_len));
    }

    if opcode.is_control() && (!fin || payload_len > 125) {
        return Err(FrameError::BadControlFrame);
    }

    let mask_key = if masked {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < pos + payload_len {
        return Ok(None);
    }

    buf.advance(pos);
    let mut payload = buf.split_to(payload_len);
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        parse_frame(&mut buf, usize::MAX).unwrap().unwrap()
    }

    #[test]
    fn text_frame_roundtrip() {
        let parsed = roundtrip(Frame::text("hello"));
        assert_eq!(parsed.opcode, Opcode::Text);
        assert!(parsed.fin);
        assert_eq!(parsed.payload.as_ref(), b"hello");
    }

    #[test]
    fn sixteen_bit_length() {
        let payload = Bytes::from(vec![7u8; 300]);
        let mut buf = BytesMut::new();
        encode_frame(&Frame::binary(payload.clone()), &mut buf);
        assert_eq!(buf[1], 126);
        let parsed = parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(parsed.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn sixty_four_bit_length() {
        let payload = Bytes::from(vec![1u8; 70_000]);
        let mut buf = BytesMut::new();
        encode_frame(&Frame::binary(payload.clone()), &mut buf);
        assert_eq!(buf[1], 127);
        let parsed = parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(parsed.payload.len(), 70_000);
    }

    #[test]
    fn close_frame_carries_status() {
        let frame = Frame::close(1001, b"going away");
        assert_eq!(frame.close_status(), 1001);
        let parsed = roundtrip(frame);
        assert_eq!(parsed.opcode, Opcode::Close);
        assert_eq!(parsed.close_status(), 1001);
        assert_eq!(&parsed.payload[2..], b"going away");
    }

    #[test]
    fn empty_close_defaults_to_1000() {
        let frame = Frame {
            fin: true,
            opcode: Opcode::Close,
            payload: Bytes::new(),
        };
        assert_eq!(frame.close_status(), CLOSE_STATUS_NORMAL);
    }

    #[test]
    fn incomplete_input_returns_none() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::text("hello world"), &mut buf);
        let full = buf.clone();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(parse_frame(&mut partial, usize::MAX).unwrap(), None);
        }
    }

    #[test]
    fn masked_client_frame_is_unmasked() {
        // hand-built masked text frame "hi"
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x80 | 2);
        buf.put_slice(&key);
        buf.put_u8(b'h' ^ key[0]);
        buf.put_u8(b'i' ^ key[1]);

        let parsed = parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(parsed.payload.as_ref(), b"hi");
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x09); // ping without fin
        buf.put_u8(0);
        assert_eq!(
            parse_frame(&mut buf, usize::MAX),
            Err(FrameError::BadControlFrame)
        );
    }

    #[test]
    fn message_fragmentation_at_boundary() {
        let payload = Bytes::from(vec![9u8; MAX_FRAME_PAYLOAD + 1]);
        let mut buf = BytesMut::new();
        encode_message(Opcode::Binary, &payload, &mut buf);

        let first = parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(first.opcode, Opcode::Binary);
        assert!(!first.fin);
        assert_eq!(first.payload.len(), MAX_FRAME_PAYLOAD);

        let second = parse_frame(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(second.opcode, Opcode::Continuation);
        assert!(second.fin);
        assert_eq!(second.payload.len(), 1);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::binary(Bytes::from(vec![0u8; 200])), &mut buf);
        assert!(matches!(
            parse_frame(&mut buf, 100),
            Err(FrameError::TooLarge(200))
        ));
    }
}
