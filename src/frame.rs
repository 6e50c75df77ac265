//! Frames: the unit of data flowing through a graph.
//!
//! A [`Frame`] is produced once per (node, position) pair and shared
//! read-mostly by every consumer that requests that position. Payloads are
//! Arc-backed so a shallow copy is cheap; a downstream stage that needs to
//! mutate (say, reverse audio) replaces the one payload on its copy and
//! leaves the shared structures alone.

use crate::property::PropertyBag;
use bytes::Bytes;
use std::sync::{Arc, Mutex, OnceLock};

/// A decoded raster payload.
#[derive(Debug, Clone)]
pub struct Image {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    data: Arc<Vec<u8>>,
}

impl Image {
    /// Create an image over the given pixel data.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: Arc::new(data),
        }
    }

    /// An empty 0x0 image.
    pub fn empty() -> Self {
        Self::new(0, 0, Vec::new())
    }

    /// Pixel data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

type ImageThunk = Box<dyn FnOnce() -> Image + Send>;

/// An image payload that may not have been decoded yet.
///
/// Deferred payloads let a worker thread pay the decode cost ahead of the
/// calling thread (the lock filter's `image` property and the
/// distributor's `trigger` mask both force them).
#[derive(Clone)]
pub struct ImageSlot {
    inner: Arc<ImageCell>,
}

struct ImageCell {
    cell: OnceLock<Image>,
    thunk: Mutex<Option<ImageThunk>>,
}

impl ImageSlot {
    /// Wrap an already decoded image.
    pub fn ready(image: Image) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(image);
        Self {
            inner: Arc::new(ImageCell {
                cell,
                thunk: Mutex::new(None),
            }),
        }
    }

    /// Wrap a decode thunk, evaluated at most once on first access.
    pub fn deferred(thunk: impl FnOnce() -> Image + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ImageCell {
                cell: OnceLock::new(),
                thunk: Mutex::new(Some(Box::new(thunk))),
            }),
        }
    }

    /// Whether the image has been evaluated.
    pub fn is_materialized(&self) -> bool {
        self.inner.cell.get().is_some()
    }

    /// Force evaluation and return the image.
    pub fn materialize(&self) -> &Image {
        self.inner.cell.get_or_init(|| {
            match self.inner.thunk.lock().unwrap().take() {
                Some(thunk) => thunk(),
                None => Image::empty(),
            }
        })
    }
}

impl std::fmt::Debug for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSlot")
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// An interleaved PCM audio payload.
#[derive(Debug, Clone)]
pub struct Audio {
    /// Sample frequency in Hz.
    pub frequency: u32,
    /// Channel count.
    pub channels: u16,
    samples: Arc<Vec<i16>>,
}

impl Audio {
    /// Create an audio payload over interleaved samples.
    pub fn new(frequency: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            frequency,
            channels,
            samples: Arc::new(samples),
        }
    }

    /// The interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of sample frames (samples per channel).
    pub fn sample_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// A copy with the sample-frame order reversed (channel interleave
    /// preserved).
    pub fn reversed(&self) -> Audio {
        let channels = self.channels.max(1) as usize;
        let mut samples = Vec::with_capacity(self.samples.len());
        for chunk in self.samples.chunks_exact(channels).rev() {
            samples.extend_from_slice(chunk);
        }
        Audio {
            frequency: self.frequency,
            channels: self.channels,
            samples: Arc::new(samples),
        }
    }
}

/// A raw byte-stream payload (an undecoded packet).
#[derive(Debug, Clone)]
pub struct Stream {
    /// Byte offset of this packet within its resource.
    pub offset: i64,
    /// Packet length in bytes.
    pub length: i32,
    /// Whether the packet starts a key frame / GOP.
    pub key: bool,
    bytes: Bytes,
}

impl Stream {
    /// Create a stream payload.
    pub fn new(offset: i64, key: bool, bytes: Bytes) -> Self {
        let length = bytes.len() as i32;
        Self {
            offset,
            length,
            key,
            bytes,
        }
    }

    /// The packet bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// A recoverable error captured during a fetch.
#[derive(Debug, Clone)]
pub struct FrameError {
    /// Human-readable description.
    pub message: String,
    /// URI of the node that raised it.
    pub source: String,
}

/// The value bundle produced for one position of one node.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    position: i32,
    image: Option<ImageSlot>,
    audio: Option<Audio>,
    stream: Option<Stream>,
    properties: PropertyBag,
    errors: Vec<FrameError>,
}

impl Frame {
    /// Create an empty frame at the given position.
    pub fn new(position: i32) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// The position this frame was produced for.
    pub fn position(&self) -> i32 {
        self.position
    }

    /// Reposition the frame (used by trimming filters).
    pub fn set_position(&mut self, position: i32) {
        self.position = position;
    }

    /// The image payload, if any.
    pub fn image(&self) -> Option<&ImageSlot> {
        self.image.as_ref()
    }

    /// Replace the image payload.
    pub fn set_image(&mut self, image: ImageSlot) {
        self.image = Some(image);
    }

    /// The audio payload, if any.
    pub fn audio(&self) -> Option<&Audio> {
        self.audio.as_ref()
    }

    /// Replace the audio payload.
    pub fn set_audio(&mut self, audio: Audio) {
        self.audio = Some(audio);
    }

    /// The stream payload, if any.
    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    /// Replace the stream payload.
    pub fn set_stream(&mut self, stream: Stream) {
        self.stream = Some(stream);
    }

    /// The frame's property bag.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Record a recoverable error against this frame.
    pub fn push_error(&mut self, message: impl Into<String>, source: impl Into<String>) {
        self.errors.push(FrameError {
            message: message.into(),
            source: source.into(),
        });
    }

    /// The captured error list.
    pub fn errors(&self) -> &[FrameError] {
        &self.errors
    }

    /// Whether any recoverable errors were captured.
    pub fn in_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drop all captured errors.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Shallow copy: payloads stay shared, the property bag becomes
    /// independent so per-delivery markers don't leak between consumers.
    pub fn shallow(&self) -> Frame {
        Frame {
            position: self.position,
            image: self.image.clone(),
            audio: self.audio.clone(),
            stream: self.stream.clone(),
            properties: self.properties.deep_clone(),
            errors: self.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_deferred_image_materializes_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let slot = ImageSlot::deferred(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Image::new(2, 2, vec![0; 16])
        });

        assert!(!slot.is_materialized());
        assert_eq!(slot.materialize().width, 2);
        assert_eq!(slot.materialize().width, 2);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_audio_reverse_preserves_interleave() {
        let audio = Audio::new(48000, 2, vec![1, -1, 2, -2, 3, -3]);
        let reversed = audio.reversed();
        assert_eq!(reversed.samples(), &[3, -3, 2, -2, 1, -1]);
        assert_eq!(reversed.sample_frames(), 3);
    }

    #[test]
    fn test_shallow_copy_shares_payloads_not_properties() {
        let mut frame = Frame::new(7);
        frame.set_audio(Audio::new(48000, 1, vec![1, 2, 3]));
        frame.properties().append("flag", PropertyValue::Int(0));

        let copy = frame.shallow();
        copy.properties().set("flag", PropertyValue::Int(1));

        assert_eq!(frame.properties().get_i64("flag"), Some(0));
        assert_eq!(copy.properties().get_i64("flag"), Some(1));
        assert_eq!(copy.audio().unwrap().samples(), frame.audio().unwrap().samples());
    }

    #[test]
    fn test_error_capture() {
        let mut frame = Frame::new(0);
        assert!(!frame.in_error());
        frame.push_error("decode glitch", "test:");
        assert!(frame.in_error());
        assert_eq!(frame.errors()[0].source, "test:");
        frame.clear_errors();
        assert!(!frame.in_error());
    }
}
