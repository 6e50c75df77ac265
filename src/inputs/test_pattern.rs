//! Synthetic A/V test input (`test:`).

use crate::error::Result;
use crate::frame::{Audio, Frame, Image, ImageSlot};
use crate::node::{Node, NodeBase, NodeKind};
use crate::property::{PropertyBag, PropertyValue};

const DEFAULT_FRAMES: i64 = 250;

/// Audio sample frames generated per media frame.
pub const SAMPLES_PER_FRAME: usize = 8;

/// A deterministic test source producing a small gradient image and a
/// recognisable audio ramp per position.
///
/// Properties:
/// - `frames` - reported frame count (default 250)
/// - `width` / `height` - image dimensions (default 64x36)
/// - `threadsafe` - set to 0 to simulate a source that must not be fetched
///   concurrently (exercises the distributor's fallback path)
///
/// The audio samples for position `p` are `p*8 .. p*8+7` on every channel,
/// so sample order (and therefore reversal) is observable in tests. The
/// image payload is deferred until materialised.
#[derive(Debug)]
pub struct TestPatternInput {
    base: NodeBase,
    uri: String,
}

impl TestPatternInput {
    /// Create a test input for the given URI (normally `test:`).
    pub fn new(uri: impl Into<String>) -> Self {
        let node = Self {
            base: NodeBase::new(),
            uri: uri.into(),
        };
        let props = node.base.properties();
        props.append("frames", PropertyValue::Int(DEFAULT_FRAMES));
        props.append("width", PropertyValue::Int(64));
        props.append("height", PropertyValue::Int(36));
        props.append("threadsafe", PropertyValue::Int(1));
        node
    }
}

impl Node for TestPatternInput {
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
        let props = self.base.properties();
        let width = props.get_i64("width").unwrap_or(64) as u32;
        let height = props.get_i64("height").unwrap_or(36) as u32;

        let mut frame = Frame::new(position);
        frame.set_image(ImageSlot::deferred(move || {
            let mut data = vec![0u8; (width * height) as usize];
            for (row, line) in data.chunks_mut(width as usize).enumerate() {
                let shade = (position as usize + row) as u8;
                line.fill(shade);
            }
            Image::new(width, height, data)
        }));

        let mut samples = Vec::with_capacity(SAMPLES_PER_FRAME * 2);
        for i in 0..SAMPLES_PER_FRAME {
            let value = (position as usize * SAMPLES_PER_FRAME + i) as i16;
            samples.push(value);
            samples.push(value);
        }
        frame.set_audio(Audio::new(48000, 2, samples));

        Ok(frame)
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }

    fn is_thread_safe(&self) -> bool {
        self.base.properties().get_i64("threadsafe").unwrap_or(1) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_encodes_position() {
        let input = TestPatternInput::new("test:");
        input.seek(3, false);
        let frame = input.fetch().unwrap();
        let audio = frame.audio().unwrap();
        assert_eq!(audio.samples()[0], 24);
        assert_eq!(audio.sample_frames(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_image_is_deferred() {
        let input = TestPatternInput::new("test:");
        let frame = input.fetch().unwrap();
        let image = frame.image().unwrap();
        assert!(!image.is_materialized());
        assert_eq!(image.materialize().width, 64);
    }

    #[test]
    fn test_frames_follow_property() {
        let input = TestPatternInput::new("test:");
        assert_eq!(input.frames(), 250);
        input.properties().assign("frames", "10").unwrap();
        assert_eq!(input.frames(), 10);
        input.seek(50, false);
        assert_eq!(input.position(), 9);
    }
}
