//! AWI: versioned big-endian index records.
//!
//! Three wire versions are supported, probed newest-first by the indexer:
//!
//! - **v2** - 8 byte header (`AWI2` + created), 20 byte items whose first
//!   i16 is zero, 16 byte footer
//! - **v3** - 64 byte header carrying an A/V description, 20 byte
//!   items/footer discriminated by `type & 0xfffc`
//! - **v4** - uniform 20 byte records led by an entry type: 0 header,
//!   0xffff footer, 1 video, 2..=17 audio; one parser instance reads a
//!   single entry type and skips the rest
//!
//! Parsers accept arbitrarily sized contiguous chunks (the reader owns the
//! actual I/O), so an index file that is still being written simply parses
//! further on the next read. Generators are the mirror image: enroll key
//! frames as they are seen, flush pending bytes whenever convenient, close
//! with the final position and size.

use crate::index::Index;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// v4 entry type of the header record.
pub const ENTRY_TYPE_HEADER: u16 = 0;
/// v4 entry type of the footer record.
pub const ENTRY_TYPE_FOOTER: u16 = 0xffff;
/// v4 entry type of the video stream.
pub const ENTRY_TYPE_VIDEO: u16 = 1;
/// First v4 audio stream entry type (audio streams count up from here).
pub const ENTRY_TYPE_AUDIO_FIRST: u16 = 2;

const V2_HEADER_SIZE: usize = 8;
const V2_ITEM_SIZE: usize = 20;
const V2_FOOTER_SIZE: usize = 16;
const V3_HEADER_SIZE: usize = 64;
const V3_RECORD_SIZE: usize = 20;
const V4_RECORD_SIZE: usize = 20;

// The growing-file approximation stays this many frames behind the
// indexed head until the footer appears.
const APPROXIMATION_MARGIN: i32 = 100;

/// One index item: a key frame, the GOP length it opens, and its bytes.
#[derive(Debug, Clone, Copy)]
pub struct Item {
    /// Key frame position.
    pub frame: i32,
    /// Frames in the GOP this item opens.
    pub frames: i16,
    /// Byte offset of the GOP.
    pub offset: i64,
    /// Byte length of the GOP.
    pub length: i32,
}

#[derive(Debug, Clone, Copy)]
struct Detail {
    offset: i64,
    length: i32,
}

/// Media description carried by a v3 header.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaInfo {
    /// Frame rate numerator / denominator.
    pub fps: (u16, u16),
    /// Picture dimensions.
    pub size: (u16, u16),
    /// GOP length.
    pub gop: u16,
    /// Audio channel count.
    pub audio_channels: u16,
    /// Audio sample frequency.
    pub audio_frequency: u32,
}

#[derive(Debug, Default)]
struct Core {
    items: BTreeMap<i32, Item>,
    offsets: BTreeMap<i64, Item>,
    details: BTreeMap<i32, Detail>,
    frames: i32,
    eof: bool,
    broken: bool,
    unusable: bool,
    media: Option<MediaInfo>,
}

impl Core {
    fn set_item(&mut self, item: Item) {
        if item.length != 0 {
            if !self.items.contains_key(&item.frame) {
                self.frames += item.frames as i32;
            }
            self.items.insert(item.frame, item);
            self.offsets.entry(item.offset).or_insert(item);
        }
    }

    fn set_footer(&mut self) {
        self.eof = true;
    }

    /// Greatest item at or before `position`; the first item when
    /// everything indexed is later.
    fn item_for(&self, position: i32) -> Option<&Item> {
        self.items
            .range(..=position)
            .next_back()
            .map(|(_, item)| item)
            .or_else(|| self.items.values().next())
    }

    fn item_for_offset(&self, offset: i64) -> Option<&Item> {
        self.offsets
            .range(..=offset)
            .next_back()
            .map(|(_, item)| item)
            .or_else(|| self.offsets.values().next())
    }
}

/// Shared handle on parsed/generated index state. Cloning shares.
#[derive(Debug, Clone, Default)]
pub struct AwiIndex {
    core: Arc<Mutex<Core>>,
    entry_type: u16,
}

impl AwiIndex {
    fn with_entry_type(entry_type: u16) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core::default())),
            entry_type,
        }
    }
}

impl Index for AwiIndex {
    fn finished(&self) -> bool {
        self.core.lock().unwrap().eof
    }

    fn find(&self, position: i32) -> i64 {
        let core = self.core.lock().unwrap();
        core.item_for(position).map(|item| item.offset).unwrap_or(-1)
    }

    fn frames(&self, current: i32) -> i32 {
        let core = self.core.lock().unwrap();
        // While the file can still grow, report a count that stays ahead
        // of the caller but well behind the indexed head.
        if !core.eof && current < core.frames {
            let anchor = core.item_for(core.frames - APPROXIMATION_MARGIN);
            return match anchor {
                Some(item) if item.frame >= current => item.frame + 1,
                _ => current + 1,
            };
        }
        core.frames
    }

    fn bytes(&self) -> i64 {
        let core = self.core.lock().unwrap();
        core.items
            .values()
            .next_back()
            .map(|item| item.offset)
            .unwrap_or(0)
    }

    fn calculate(&self, size: i64) -> i32 {
        let core = self.core.lock().unwrap();
        let total_bytes = core
            .items
            .values()
            .next_back()
            .map(|item| item.offset)
            .unwrap_or(0);
        if core.eof && size == total_bytes {
            core.frames
        } else {
            match core.item_for_offset(size) {
                Some(item) => item.frame + item.frames as i32 - 1,
                None => -1,
            }
        }
    }

    fn usable(&self) -> bool {
        !self.core.lock().unwrap().unusable
    }

    fn set_usable(&self, value: bool) {
        self.core.lock().unwrap().unusable = !value;
    }

    fn key_frame_of(&self, position: i32) -> i32 {
        let core = self.core.lock().unwrap();
        core.item_for(position).map(|item| item.frame).unwrap_or(-1)
    }

    fn key_frame_from(&self, offset: i64) -> i32 {
        let core = self.core.lock().unwrap();
        core.item_for_offset(offset)
            .map(|item| item.frame)
            .unwrap_or(-1)
    }

    fn length(&self, position: i32) -> i32 {
        let core = self.core.lock().unwrap();
        core.details.get(&position).map(|d| d.length).unwrap_or(0)
    }

    fn offset(&self, position: i32) -> i64 {
        let core = self.core.lock().unwrap();
        core.details.get(&position).map(|d| d.offset).unwrap_or(-1)
    }

    fn total_frames(&self) -> i32 {
        self.core.lock().unwrap().frames
    }

    fn valid(&self) -> bool {
        !self.core.lock().unwrap().broken
    }

    fn entry_type(&self) -> u16 {
        self.entry_type
    }
}

impl AwiIndex {
    /// The media description from a v3 header, when present.
    pub fn media(&self) -> Option<MediaInfo> {
        self.core.lock().unwrap().media
    }
}

/// Wire version of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// 8 byte header, reserved-discriminated records.
    V2,
    /// 64 byte A/V header, type-discriminated records.
    V3,
    /// Uniform typed 20 byte records, multi-stream.
    V4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    Item,
    Footer,
    Error,
}

/// Incremental parser for one index version.
pub struct AwiParser {
    version: Version,
    entry_type: u16,
    buffer: BytesMut,
    state: ParseState,
    index: AwiIndex,
}

impl AwiParser {
    /// Parser for v2 data.
    pub fn v2() -> Self {
        Self::with_version(Version::V2, 0)
    }

    /// Parser for v3 data.
    pub fn v3() -> Self {
        Self::with_version(Version::V3, 0)
    }

    /// Parser for v4 data, reading the records of one entry type.
    pub fn v4(entry_type: u16) -> Self {
        Self::with_version(Version::V4, entry_type)
    }

    fn with_version(version: Version, entry_type: u16) -> Self {
        Self {
            version,
            entry_type,
            buffer: BytesMut::new(),
            state: ParseState::Header,
            index: AwiIndex::with_entry_type(entry_type),
        }
    }

    /// Shared handle on the index being built.
    pub fn index(&self) -> AwiIndex {
        self.index.clone()
    }

    /// Feed a contiguous chunk. Returns false once the data is known to be
    /// malformed; further calls are rejected.
    pub fn parse(&mut self, data: &[u8]) -> bool {
        if !matches!(self.state, ParseState::Header | ParseState::Item) {
            return self.state == ParseState::Footer;
        }
        self.buffer.extend_from_slice(data);

        let ok = match self.version {
            Version::V2 => self.parse_v2(),
            Version::V3 => self.parse_v3(),
            Version::V4 => self.parse_v4(),
        };
        if !ok {
            self.state = ParseState::Error;
            self.index.core.lock().unwrap().broken = true;
        }
        ok
    }

    fn peek_u16(&self) -> Option<u16> {
        if self.buffer.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.buffer[0], self.buffer[1]]))
    }

    fn parse_v2(&mut self) -> bool {
        loop {
            match self.state {
                ParseState::Header => {
                    if self.buffer.len() < V2_HEADER_SIZE {
                        return true;
                    }
                    let mut record = self.buffer.split_to(V2_HEADER_SIZE);
                    let mut magic = [0u8; 4];
                    record.copy_to_slice(&mut magic);
                    let _created = record.get_i32();
                    if &magic != b"AWI2" {
                        return false;
                    }
                    self.state = ParseState::Item;
                }
                ParseState::Item => {
                    let Some(first) = self.peek_u16() else { return true };
                    if first == 0 {
                        if self.buffer.len() < V2_ITEM_SIZE {
                            return true;
                        }
                        let mut record = self.buffer.split_to(V2_ITEM_SIZE);
                        let _reserved = record.get_i16();
                        let frames = record.get_i16();
                        let frame = record.get_i32();
                        let offset = record.get_i64();
                        let length = record.get_i32();
                        self.index.core.lock().unwrap().set_item(Item {
                            frame,
                            frames,
                            offset,
                            length,
                        });
                    } else {
                        if self.buffer.len() < V2_FOOTER_SIZE {
                            return true;
                        }
                        let mut record = self.buffer.split_to(V2_FOOTER_SIZE);
                        let _reserved = record.get_i64();
                        let _closed = record.get_i32();
                        let mut magic = [0u8; 4];
                        record.copy_to_slice(&mut magic);
                        if &magic != b"AWI2" {
                            return false;
                        }
                        self.index.core.lock().unwrap().set_footer();
                        self.state = ParseState::Footer;
                    }
                }
                _ => return true,
            }
        }
    }

    fn parse_v3(&mut self) -> bool {
        loop {
            match self.state {
                ParseState::Header => {
                    if self.buffer.len() < V3_HEADER_SIZE {
                        return true;
                    }
                    let mut record = self.buffer.split_to(V3_HEADER_SIZE);
                    let mut magic = [0u8; 4];
                    record.copy_to_slice(&mut magic);
                    if &magic != b"AWI3" {
                        return false;
                    }
                    let _created = record.get_i32();
                    record.advance(4); // wrapper fourcc
                    let _video_type = record.get_u16();
                    record.advance(2); // progressive + flags
                    let fps_num = record.get_u16();
                    let fps_den = record.get_u16();
                    let _bitrate = record.get_u32();
                    let width = record.get_u16();
                    let height = record.get_u16();
                    let _chroma = record.get_u32();
                    let gop = record.get_u16();
                    record.advance(8); // rpp + aspect ratios
                    record.advance(6); // reserved
                    let _audio_type = record.get_u16();
                    let audio_channels = record.get_u16();
                    record.advance(4); // bits + store bits
                    let audio_frequency = record.get_u32();
                    // 4 reserved bytes remain in the record

                    self.index.core.lock().unwrap().media = Some(MediaInfo {
                        fps: (fps_num, fps_den),
                        size: (width, height),
                        gop,
                        audio_channels,
                        audio_frequency,
                    });
                    self.state = ParseState::Item;
                }
                ParseState::Item => {
                    let Some(first) = self.peek_u16() else { return true };
                    if self.buffer.len() < V3_RECORD_SIZE {
                        return true;
                    }
                    if first & 0xfffc == 0 {
                        let mut record = self.buffer.split_to(V3_RECORD_SIZE);
                        let _entry_type = record.get_i16();
                        let frames = record.get_i16();
                        let frame = record.get_i32();
                        let offset = record.get_i64();
                        let length = record.get_i32();
                        self.index.core.lock().unwrap().set_item(Item {
                            frame,
                            frames,
                            offset,
                            length,
                        });
                    } else {
                        let mut record = self.buffer.split_to(V3_RECORD_SIZE);
                        let _entry_type = record.get_i16();
                        record.advance(6);
                        let _closed = record.get_i32();
                        let _max_gop = record.get_i16();
                        let _flags = record.get_i16();
                        let mut magic = [0u8; 4];
                        record.copy_to_slice(&mut magic);
                        if &magic != b"AWI3" {
                            return false;
                        }
                        self.index.core.lock().unwrap().set_footer();
                        self.state = ParseState::Footer;
                    }
                }
                _ => return true,
            }
        }
    }

    fn parse_v4(&mut self) -> bool {
        loop {
            if self.buffer.len() < V4_RECORD_SIZE {
                return true;
            }
            let Some(entry) = self.peek_u16() else { return true };
            match self.state {
                ParseState::Header => {
                    if entry != ENTRY_TYPE_HEADER {
                        return false;
                    }
                    let mut record = self.buffer.split_to(V4_RECORD_SIZE);
                    let _entry = record.get_u16();
                    let mut magic = [0u8; 4];
                    record.copy_to_slice(&mut magic);
                    let _created = record.get_i32();
                    if &magic != b"AWI4" {
                        return false;
                    }
                    self.state = ParseState::Item;
                }
                ParseState::Item => {
                    if entry == ENTRY_TYPE_FOOTER {
                        let mut record = self.buffer.split_to(V4_RECORD_SIZE);
                        let _entry = record.get_u16();
                        let _closed = record.get_i32();
                        let mut magic = [0u8; 4];
                        record.copy_to_slice(&mut magic);
                        if &magic != b"AWI4" {
                            return false;
                        }
                        self.index.core.lock().unwrap().set_footer();
                        self.state = ParseState::Footer;
                    } else if entry == self.entry_type {
                        let mut record = self.buffer.split_to(V4_RECORD_SIZE);
                        let _entry = record.get_u16();
                        let frames = record.get_i16();
                        let frame = record.get_i32();
                        let offset = record.get_i64();
                        let length = record.get_i32();
                        self.index.core.lock().unwrap().set_item(Item {
                            frame,
                            frames,
                            offset,
                            length,
                        });
                    } else {
                        // Another stream's records: skip.
                        self.buffer.advance(V4_RECORD_SIZE);
                    }
                }
                _ => return true,
            }
        }
    }
}

/// Incremental generator for v2 or v4 output.
///
/// Items are emitted one key frame behind: enrolling key frame `k`
/// completes (and stages for flush) the item describing the GOP that
/// started at the previously enrolled key frame.
pub struct AwiGenerator {
    version: Version,
    entry_type: u16,
    index: AwiIndex,
    pending: Vec<Item>,
    wrote_header: bool,
    footer_due: bool,
    wrote_footer: bool,
    position: i32,
    offset: i64,
    broken: bool,
}

impl AwiGenerator {
    /// Generator for v2 output.
    pub fn v2() -> Self {
        Self::with_version(Version::V2, 0)
    }

    /// Generator for v4 output writing one entry type.
    pub fn v4(entry_type: u16) -> Self {
        Self::with_version(Version::V4, entry_type)
    }

    fn with_version(version: Version, entry_type: u16) -> Self {
        Self {
            version,
            entry_type,
            index: AwiIndex::with_entry_type(entry_type),
            pending: Vec::new(),
            wrote_header: false,
            footer_due: false,
            wrote_footer: false,
            position: -1,
            offset: 0,
            broken: false,
        }
    }

    /// Shared handle on the index being generated.
    pub fn index(&self) -> AwiIndex {
        self.index.clone()
    }

    /// Enroll a key frame and its byte offset. Positions and offsets must
    /// be monotonic; a violation poisons the generator.
    pub fn enroll(&mut self, position: i32, offset: i64) -> bool {
        if self.broken || position <= self.position || offset < self.offset {
            self.broken = true;
            return false;
        }
        if self.position == -1 {
            self.position = position;
            self.offset = offset;
        } else if offset != self.offset {
            let item = Item {
                frame: self.position,
                frames: (position - self.position) as i16,
                offset: self.offset,
                length: (offset - self.offset) as i32,
            };
            self.index.core.lock().unwrap().set_item(item);
            self.pending.push(item);
            self.position = position;
            self.offset = offset;
        }
        true
    }

    /// Record per-frame offset/length detail.
    pub fn detail(&mut self, position: i32, offset: i64, length: i32) -> bool {
        if self.broken {
            return false;
        }
        self.index
            .core
            .lock()
            .unwrap()
            .details
            .insert(position, Detail { offset, length });
        true
    }

    /// Complete the index with the final frame count and byte size.
    pub fn close(&mut self, position: i32, offset: i64) -> bool {
        if self.broken || position <= self.position || offset < self.offset {
            self.broken = true;
            return false;
        }
        if !self.enroll(position, offset) {
            return false;
        }
        self.index.core.lock().unwrap().set_footer();
        self.footer_due = true;
        true
    }

    /// Append the pending bytes (header once, new items, footer once
    /// closed) to `out`.
    pub fn flush(&mut self, out: &mut Vec<u8>) -> bool {
        if self.broken {
            return false;
        }
        let mut buffer = BytesMut::new();
        if !self.wrote_header {
            self.write_header(&mut buffer);
            self.wrote_header = true;
        }
        for item in self.pending.drain(..) {
            match self.version {
                Version::V2 => {
                    buffer.put_i16(0);
                    buffer.put_i16(item.frames);
                    buffer.put_i32(item.frame);
                    buffer.put_i64(item.offset);
                    buffer.put_i32(item.length);
                }
                Version::V4 => {
                    buffer.put_u16(self.entry_type);
                    buffer.put_i16(item.frames);
                    buffer.put_i32(item.frame);
                    buffer.put_i64(item.offset);
                    buffer.put_i32(item.length);
                }
                Version::V3 => unreachable!("no v3 generator"),
            }
        }
        if self.footer_due && !self.wrote_footer {
            self.write_footer(&mut buffer);
            self.wrote_footer = true;
        }
        out.extend_from_slice(&buffer);
        true
    }

    fn write_header(&self, buffer: &mut BytesMut) {
        match self.version {
            Version::V2 => {
                buffer.put_slice(b"AWI2");
                buffer.put_i32(0);
            }
            Version::V4 => {
                buffer.put_u16(ENTRY_TYPE_HEADER);
                buffer.put_slice(b"AWI4");
                buffer.put_i32(0);
                buffer.put_bytes(0, 10);
            }
            Version::V3 => unreachable!("no v3 generator"),
        }
    }

    fn write_footer(&self, buffer: &mut BytesMut) {
        match self.version {
            Version::V2 => {
                buffer.put_i64(-1);
                buffer.put_i32(0);
                buffer.put_slice(b"AWI2");
            }
            Version::V4 => {
                buffer.put_u16(ENTRY_TYPE_FOOTER);
                buffer.put_i32(0);
                buffer.put_slice(b"AWI4");
                buffer.put_bytes(0, 10);
            }
            Version::V3 => unreachable!("no v3 generator"),
        }
    }
}
