//! The wire segment: a 24-byte fixed little-endian header optionally
//! followed by a payload. See spec.md §3/§6.

use std::collections::VecDeque;

/// Size in bytes of the fixed segment header.
pub const HEADER_SIZE: usize = 24;

/// `cmd` values a segment may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    WindowAsk = 83,
    WindowInsist = 84,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowAsk),
            84 => Some(Command::WindowInsist),
            _ => None,
        }
    }
}

/// A single segment, in flight or buffered, plus the bookkeeping fields the
/// sender tracks per in-flight segment (`resendts`, `rto`, `xmit`, `skip`)
/// that never go on the wire.
#[derive(Debug, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: Vec<u8>,

    /// Time the segment should be retransmitted if unacknowledged.
    pub resendts: u32,
    /// Per-segment retransmission timeout.
    pub rto: u32,
    /// Count of "later sn acked" observations since this segment was sent;
    /// the fast-retransmit signal.
    pub skip: u32,
    /// Number of times this segment has been transmitted.
    pub xmit: u32,
}

impl Segment {
    pub fn new(conv: u32, cmd: Command, data: Vec<u8>) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            data,
            resendts: 0,
            rto: 0,
            skip: 0,
            xmit: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Appends this segment's wire encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd as u8);
        out.push(self.frg);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Decodes one segment from the front of `buf`, returning the segment
    /// and the number of bytes consumed. Returns `None` if `buf` does not
    /// hold a complete, well-formed segment.
    pub fn decode(buf: &[u8]) -> Option<(Segment, usize)> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let conv = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let cmd = Command::from_u8(buf[4])?;
        let frg = buf[5];
        let wnd = u16::from_le_bytes(buf[6..8].try_into().ok()?);
        let ts = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let sn = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let una = u32::from_le_bytes(buf[16..20].try_into().ok()?);
        let len = u32::from_le_bytes(buf[20..24].try_into().ok()?) as usize;

        if buf.len() < HEADER_SIZE + len {
            return None;
        }

        let data = buf[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        Some((
            Segment {
                conv,
                cmd,
                frg,
                wnd,
                ts,
                sn,
                una,
                data,
                resendts: 0,
                rto: 0,
                skip: 0,
                xmit: 0,
            },
            HEADER_SIZE + len,
        ))
    }
}

/// Parses a buffer holding a back-to-back concatenation of segments (never
/// spanning datagrams; a single datagram may hold several).
pub fn decode_all(mut buf: &[u8]) -> VecDeque<Segment> {
    let mut out = VecDeque::new();
    while let Some((segment, used)) = Segment::decode(buf) {
        buf = &buf[used..];
        out.push_back(segment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_push_segment() {
        let mut seg = Segment::new(42, Command::Push, b"hello".to_vec());
        seg.frg = 2;
        seg.wnd = 128;
        seg.ts = 1000;
        seg.sn = 7;
        seg.una = 3;

        let mut buf = Vec::new();
        seg.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        let (decoded, used) = Segment::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.conv, 42);
        assert_eq!(decoded.cmd, Command::Push);
        assert_eq!(decoded.frg, 2);
        assert_eq!(decoded.wnd, 128);
        assert_eq!(decoded.ts, 1000);
        assert_eq!(decoded.sn, 7);
        assert_eq!(decoded.una, 3);
        assert_eq!(decoded.data, b"hello");
    }

    #[test]
    fn decodes_multiple_segments_from_one_buffer() {
        let a = Segment::new(1, Command::Ack, Vec::new());
        let b = Segment::new(1, Command::Push, b"xy".to_vec());

        let mut buf = Vec::new();
        a.encode(&mut buf);
        b.encode(&mut buf);

        let segments = decode_all(&buf);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].cmd, Command::Ack);
        assert_eq!(segments[1].data, b"xy");
    }

    #[test]
    fn truncated_buffer_yields_no_segment() {
        let seg = Segment::new(1, Command::Push, b"payload".to_vec());
        let mut buf = Vec::new();
        seg.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Segment::decode(&buf).is_none());
    }
}
