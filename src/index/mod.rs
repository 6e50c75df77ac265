//! Byte-position indexing: the AWI record format and the background
//! indexer registry.

pub mod awi;
mod indexer;

pub use indexer::{IndexItem, IndexKey, Indexer, POLL_RETRIES};

/// An ordered mapping from frame position to byte offset, possibly still
/// growing.
///
/// Until the terminating record appears, `frames` reports an approximation
/// that is always at least the truly decodable count; consumers must
/// tolerate an index running ahead of (or behind) the actual data file.
pub trait Index: Send + Sync {
    /// Whether the terminating record has been seen.
    fn finished(&self) -> bool;

    /// Byte offset of the GOP holding `position` (-1 when nothing is
    /// indexed yet).
    fn find(&self, position: i32) -> i64;

    /// Approximate frame count, never below `current`.
    fn frames(&self, current: i32) -> i32;

    /// Total bytes the index knows about.
    fn bytes(&self) -> i64;

    /// Frame count derivable from a data file of `size` bytes (-1 when
    /// unknown).
    fn calculate(&self, size: i64) -> i32;

    /// Whether consumers should trust this index for frame counts.
    fn usable(&self) -> bool;

    /// See [`Index::usable`].
    fn set_usable(&self, value: bool);

    /// The key frame opening the GOP that holds `position`.
    fn key_frame_of(&self, position: i32) -> i32;

    /// The key frame of the GOP containing the byte `offset`.
    fn key_frame_from(&self, offset: i64) -> i32;

    /// Packet length for `position` (0 without detail records).
    fn length(&self, position: i32) -> i32;

    /// Packet offset for `position` (-1 without detail records).
    fn offset(&self, position: i32) -> i64;

    /// Frames registered so far (ignores the growing-file approximation).
    fn total_frames(&self) -> i32;

    /// False once parsing has hit malformed data.
    fn valid(&self) -> bool;

    /// Which stream this index describes (AWI v4; 0 otherwise).
    fn entry_type(&self) -> u16 {
        0
    }
}
