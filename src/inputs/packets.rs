//! Synthetic packetised input (`packets:`).
//!
//! Produces frames whose stream payloads carry byte offsets, lengths and
//! key-frame flags, laid out as fixed GOPs. The index generator drives one
//! of these to build a position → offset index without a real bitstream.

use crate::error::Result;
use crate::frame::{Frame, Stream};
use crate::node::{Node, NodeBase, NodeKind};
use crate::property::{PropertyBag, PropertyValue};
use bytes::Bytes;

const KEY_PACKET_LEN: i64 = 256;
const DELTA_PACKET_LEN: i64 = 64;

/// A packetised source with deterministic offsets.
///
/// Properties: `frames` (default 100), `gop` (key-frame spacing, default
/// 10). Packet `p` is a key frame when `p % gop == 0`; key packets are 256
/// bytes and delta packets 64, so every offset is computable in closed
/// form and index contents can be asserted exactly.
#[derive(Debug)]
pub struct PacketInput {
    base: NodeBase,
    uri: String,
}

impl PacketInput {
    /// Create a packet input for the given URI (normally `packets:`).
    pub fn new(uri: impl Into<String>) -> Self {
        let node = Self {
            base: NodeBase::new(),
            uri: uri.into(),
        };
        let props = node.base.properties();
        props.append("frames", PropertyValue::Int(100));
        props.append("gop", PropertyValue::Int(10));
        node
    }

    fn gop(&self) -> i64 {
        self.base.properties().get_i64("gop").unwrap_or(10).max(1)
    }

    /// Byte offset of packet `position`.
    pub fn offset_of(&self, position: i64) -> i64 {
        let gop = self.gop();
        let gop_len = KEY_PACKET_LEN + (gop - 1) * DELTA_PACKET_LEN;
        let within = position % gop;
        let mut offset = (position / gop) * gop_len;
        if within > 0 {
            offset += KEY_PACKET_LEN + (within - 1) * DELTA_PACKET_LEN;
        }
        offset
    }

    /// Total byte size of the whole stream.
    pub fn total_bytes(&self) -> i64 {
        self.offset_of(self.frames() as i64)
    }
}

impl Node for PacketInput {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    fn frames(&self) -> i32 {
        self.base.properties().get_i64("frames").unwrap_or(0) as i32
    }

    fn seek(&self, position: i32, relative: bool) {
        self.base.seek(position, relative, self.frames());
    }

    fn position(&self) -> i32 {
        self.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        let position = self.base.position();
        let gop = self.gop();
        let key = (position as i64) % gop == 0;
        let length = if key { KEY_PACKET_LEN } else { DELTA_PACKET_LEN };

        let mut frame = Frame::new(position);
        frame.set_stream(Stream::new(
            self.offset_of(position as i64),
            key,
            Bytes::from(vec![position as u8; length as usize]),
        ));
        Ok(frame)
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_contiguous() {
        let input = PacketInput::new("packets:");
        let mut expected = 0;
        for p in 0..25 {
            input.seek(p, false);
            let frame = input.fetch().unwrap();
            let stream = frame.stream().unwrap();
            assert_eq!(stream.offset, expected, "offset mismatch at {p}");
            assert_eq!(stream.key, p % 10 == 0);
            expected += stream.length as i64;
        }
    }

    #[test]
    fn test_total_bytes_matches_walk() {
        let input = PacketInput::new("packets:");
        input.properties().assign("frames", "23").unwrap();
        let mut total = 0;
        for p in 0..23 {
            input.seek(p, false);
            total += input.fetch().unwrap().stream().unwrap().length as i64;
        }
        assert_eq!(input.total_bytes(), total);
    }
}
