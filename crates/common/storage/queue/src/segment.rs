// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One segment file per cycle.
//!
//! ## Segment File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Header (64 bytes)                            │
//! ├────────┬─────────┬───────────┬─────────────┬───────────────┬─────────┤
//! │ magic  │ version │ cycle     │ index_count │ index_spacing │ ...     │
//! │ (4B)   │ (4B)    │ (8B)      │ (4B)        │ (4B)          │         │
//! ├────────┴─────────┴───────────┴─────────────┴───────────────┴─────────┤
//! │ data_start (8B) │ complete (4B) │ reserved                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │               Primary index (index_count × 8 bytes)                  │
//! │  slot p = offset of index array p                                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   Frames from data_start (64-byte aligned) to the end of the file:   │
//! │   records, and index arrays of index_count × 8 bytes written in line │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entry j of index array p holds the offset of the record with sequence
//! `(p * index_count + j) * index_spacing`. The writer allocates array p
//! right before the first record it covers. A zero slot or entry means
//! "not yet written"; both levels fill in sequence order, so the populated
//! slots form a prefix and can be binary searched. Records past
//! `index_count² × index_spacing` are reached by scanning from the last
//! entry.
//!
//! ## Lookup
//!
//! To find sequence 150 with 8 entries per array and a spacing of 4:
//! 1. Each array covers 32 sequences, so binary search the primary slots
//!    at or below `150 / 32 = 4`
//! 2. Binary search array 4 for the entry at or below `(150 % 32) / 4 = 5`
//! 3. Jump to the offset of sequence 148 and walk 2 frames forward
//!
//! ## Growth
//!
//! A segment starts at `block_size` bytes and the writer extends it by
//! whole blocks when a frame does not fit. Readers remap when they reach an
//! offset past their mapping.
//!
//! ## Creation
//!
//! A segment is written to a uniquely named temporary file and published
//! with a hard link. Exactly one creator wins; the others open the winner's
//! file. Readers never observe a half-initialized header.

use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{Ordering, fence},
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::{
    FlushMode, Result, RollCycle,
    crc::{frame_crc, verify_frame_crc},
    error::{
        AlreadyExistsSnafu, ConcurrentWriterSnafu, CorruptedFrameSnafu, CorruptedSegmentSnafu,
        InvalidArgumentSnafu, OutOfRangeSnafu,
    },
    file::SegmentFile,
    frame::{FRAME_HEADER_SIZE, FrameHeader, MAX_PAYLOAD_LEN, frame_size},
    path::temp_segment_path,
};

const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"RSCQ");
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_SIZE: u64 = 64;
const INDEX_ENTRY_SIZE: u64 = 8;
const DATA_ALIGNMENT: u64 = 64;

const MAGIC_OFFSET: u64 = 0;
const VERSION_OFFSET: u64 = 4;
const CYCLE_OFFSET: u64 = 8;
const INDEX_COUNT_OFFSET: u64 = 16;
const INDEX_SPACING_OFFSET: u64 = 20;
const DATA_START_OFFSET: u64 = 24;
const COMPLETE_OFFSET: u64 = 32;

/// Offset of the first frame in a segment of `roll_cycle`.
pub(crate) const fn data_start_for(roll_cycle: &RollCycle) -> u64 {
    let index_bytes = roll_cycle.index_count() as u64 * INDEX_ENTRY_SIZE;
    (SEGMENT_HEADER_SIZE + index_bytes).next_multiple_of(DATA_ALIGNMENT)
}

/// Payload length of one index array frame.
#[allow(clippy::cast_possible_truncation)]
const fn index_array_len(roll_cycle: &RollCycle) -> u32 {
    (roll_cycle.index_count() as u64 * INDEX_ENTRY_SIZE) as u32
}

/// A published record located inside a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence:    u64,
    /// Offset of the frame header.
    pub offset:      u64,
    /// Offset of the frame that follows this one.
    pub next_offset: u64,
    pub payload:     Bytes,
}

impl Frame {
    /// Position of the frame that follows this one.
    pub const fn next_position(&self) -> FramePosition {
        FramePosition {
            sequence: self.sequence + 1,
            offset:   self.next_offset,
        }
    }
}

/// Outcome of looking up one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    Ready(Frame),
    /// The frame at this sequence is being written.
    Busy,
    NotFound,
}

/// Where the frame with `sequence` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePosition {
    pub sequence: u64,
    pub offset:   u64,
}

/// End of the published frames of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontier {
    /// Sequence the next frame will carry.
    pub next_sequence:  u64,
    /// Offset the next frame will be written at.
    pub write_position: u64,
    /// A writer has reserved the frame at `write_position` but not
    /// published it.
    pub in_progress:    bool,
}

/// Kind of a published frame met while walking a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Record,
    IndexArray,
}

/// A mapped segment file.
///
/// Shared between appenders and tailers via `Arc`; every method takes
/// `&self`.
pub struct Segment {
    file:       SegmentFile,
    cycle:      i64,
    roll_cycle: RollCycle,
    data_start: u64,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.file.path())
            .field("cycle", &self.cycle)
            .field("size", &self.file.size())
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Open the segment at `path`, creating it with `block_size` bytes if it
    /// does not exist yet.
    pub fn create_or_open(
        path: &Path,
        roll_cycle: &RollCycle,
        cycle: i64,
        block_size: u64,
    ) -> Result<Self> {
        if path.exists() {
            return Self::open(path, roll_cycle, cycle);
        }

        let temp_path = temp_segment_path(path);
        let initialized = Self::initialize(&temp_path, roll_cycle, cycle, block_size);
        let linked = initialized.and_then(|()| Ok(std::fs::hard_link(&temp_path, path)?));

        if let Err(e) = std::fs::remove_file(&temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?temp_path, error = ?e, "Failed to remove temporary segment file");
            }
        }

        match linked {
            Ok(()) => debug!(path = ?path, cycle, block_size, "Created segment"),
            Err(crate::QueueError::Io { source }) if source.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = ?path, cycle, "Segment created concurrently, opening existing");
            }
            Err(e) => return Err(e),
        }

        Self::open(path, roll_cycle, cycle)
    }

    fn initialize(path: &Path, roll_cycle: &RollCycle, cycle: i64, block_size: u64) -> Result<()> {
        let data_start = data_start_for(roll_cycle);
        ensure!(
            block_size >= data_start,
            InvalidArgumentSnafu {
                reason: format!("block size {block_size} is below the data start {data_start}"),
            }
        );

        let file = SegmentFile::create(path, block_size)?;
        let mut header = BytesMut::with_capacity(SEGMENT_HEADER_SIZE as usize);
        header.put_u32_le(SEGMENT_MAGIC);
        header.put_u32_le(SEGMENT_VERSION);
        header.put_i64_le(cycle);
        header.put_u32_le(roll_cycle.index_count());
        header.put_u32_le(roll_cycle.index_spacing());
        header.put_u64_le(data_start);
        header.put_u32_le(0);
        header.resize(SEGMENT_HEADER_SIZE as usize, 0);
        file.write_at(0, &header)?;
        file.flush()
    }

    /// Open an existing segment and check that it belongs to `cycle` of
    /// `roll_cycle`.
    pub fn open(path: &Path, roll_cycle: &RollCycle, cycle: i64) -> Result<Self> {
        let file = SegmentFile::open(path)?;
        let corrupted = |reason: String| CorruptedSegmentSnafu {
            path: path.to_path_buf(),
            reason,
        };

        ensure!(
            file.size() >= SEGMENT_HEADER_SIZE,
            corrupted(format!("file is only {} bytes", file.size()))
        );

        let magic = file.read_u32(MAGIC_OFFSET)?;
        ensure!(
            magic == SEGMENT_MAGIC,
            corrupted(format!("bad magic {magic:#010x}"))
        );

        let version = file.read_u32(VERSION_OFFSET)?;
        ensure!(
            version == SEGMENT_VERSION,
            corrupted(format!("unsupported version {version}"))
        );

        #[allow(clippy::cast_possible_wrap)]
        let stored_cycle = file.read_u64(CYCLE_OFFSET)? as i64;
        ensure!(
            stored_cycle == cycle,
            corrupted(format!("holds cycle {stored_cycle}, expected {cycle}"))
        );

        let index_count = file.read_u32(INDEX_COUNT_OFFSET)?;
        let index_spacing = file.read_u32(INDEX_SPACING_OFFSET)?;
        ensure!(
            index_count == roll_cycle.index_count() && index_spacing == roll_cycle.index_spacing(),
            corrupted(format!(
                "index {index_count}x{index_spacing} does not match roll cycle {}",
                roll_cycle.name()
            ))
        );

        let data_start = file.read_u64(DATA_START_OFFSET)?;
        ensure!(
            data_start == data_start_for(roll_cycle) && data_start <= file.size(),
            corrupted(format!("invalid data start {data_start}"))
        );

        trace!(path = ?path, cycle, size = file.size(), "Opened segment");

        Ok(Self {
            file,
            cycle,
            roll_cycle: *roll_cycle,
            data_start,
        })
    }

    pub const fn cycle(&self) -> i64 { self.cycle }

    pub fn path(&self) -> &Path { self.file.path() }

    /// Mapped length; grows as the writer extends the file.
    pub fn size(&self) -> u64 { self.file.size() }

    pub const fn data_start(&self) -> u64 { self.data_start }

    /// Whether a writer sealed this segment after moving to a later cycle.
    pub fn is_complete(&self) -> Result<bool> { Ok(self.file.read_u32(COMPLETE_OFFSET)? != 0) }

    pub fn mark_complete(&self) -> Result<()> {
        self.file.write_u32(COMPLETE_OFFSET, 1)?;
        self.file.flush_range(0, SEGMENT_HEADER_SIZE)
    }

    /// Whether at least one record has been published.
    pub fn has_data(&self) -> Result<bool> {
        let mut position = self.origin();
        loop {
            match self.header_at(position.offset)? {
                FrameHeader::Ready { .. } => return Ok(true),
                FrameHeader::IndexArray { len } => {
                    position.offset += self.published_size(position, len)?;
                }
                _ => return Ok(false),
            }
        }
    }

    /// Highest published sequence, `None` for an empty segment.
    pub fn last_complete_sequence(&self) -> Result<Option<u64>> {
        Ok(self.frontier()?.next_sequence.checked_sub(1))
    }

    /// Scan for the end of the published frames.
    pub fn frontier(&self) -> Result<Frontier> {
        let start = self.nearest_indexed(u64::MAX)?;
        self.walk(start, |_, _| Ok(()))
    }

    /// Look up `sequence`.
    pub fn read(&self, sequence: u64) -> Result<FrameRead> {
        if sequence > self.roll_cycle.max_sequence() {
            return Ok(FrameRead::NotFound);
        }
        let start = self.nearest_indexed(sequence)?;
        self.scan_to(sequence, start)
    }

    /// Look up `sequence`, starting from `hint` when it lies less than one
    /// index spacing behind.
    pub fn read_from(&self, sequence: u64, hint: Option<FramePosition>) -> Result<FrameRead> {
        let spacing = u64::from(self.roll_cycle.index_spacing());
        match hint {
            Some(hint)
                if hint.sequence <= sequence
                    && sequence - hint.sequence < spacing
                    && hint.offset >= self.data_start =>
            {
                self.scan_to(sequence, hint)
            }
            _ => self.read(sequence),
        }
    }

    const fn origin(&self) -> FramePosition {
        FramePosition {
            sequence: 0,
            offset:   self.data_start,
        }
    }

    /// Sequences covered by one index array.
    fn array_span(&self) -> u64 {
        u64::from(self.roll_cycle.index_count()) * u64::from(self.roll_cycle.index_spacing())
    }

    /// Closest indexed frame at or before `sequence`.
    fn nearest_indexed(&self, sequence: u64) -> Result<FramePosition> {
        let spacing = u64::from(self.roll_cycle.index_spacing());
        let count = u64::from(self.roll_cycle.index_count());

        let mut highest_array = (sequence / self.array_span()).min(count - 1);
        let mut highest_slot = sequence / spacing;
        loop {
            let Some(array_slot) = last_populated(highest_array, |p| self.primary_entry(p))? else {
                return Ok(self.origin());
            };
            let array = self.primary_entry(array_slot)?;
            let first_slot = array_slot * count;
            let highest_entry = (highest_slot - first_slot).min(count - 1);
            if let Some(entry) = last_populated(highest_entry, |j| self.array_entry(array, j))? {
                return Ok(FramePosition {
                    sequence: (first_slot + entry) * spacing,
                    offset:   self.array_entry(array, entry)?,
                });
            }

            // Allocated, but its first record is not published yet.
            if array_slot == 0 {
                return Ok(self.origin());
            }
            highest_array = array_slot - 1;
            highest_slot = first_slot - 1;
        }
    }

    /// Offset of index array `slot`, 0 if not allocated.
    fn primary_entry(&self, slot: u64) -> Result<u64> {
        let offset = self
            .file
            .read_u64(SEGMENT_HEADER_SIZE + slot * INDEX_ENTRY_SIZE)?;
        if offset != 0 {
            let end = offset + frame_size(index_array_len(&self.roll_cycle));
            ensure!(
                offset >= self.data_start && self.file.ensure_mapped(end)?,
                CorruptedSegmentSnafu {
                    path:   self.file.path().to_path_buf(),
                    reason: format!("index slot {slot} points at {offset}"),
                }
            );
        }
        Ok(offset)
    }

    /// Entry `slot` of the index array at `array`, 0 if not written.
    fn array_entry(&self, array: u64, slot: u64) -> Result<u64> {
        let offset = self
            .file
            .read_u64(array + FRAME_HEADER_SIZE + slot * INDEX_ENTRY_SIZE)?;
        if offset != 0 {
            ensure!(
                offset > array && self.file.ensure_mapped(offset + FRAME_HEADER_SIZE)?,
                CorruptedSegmentSnafu {
                    path:   self.file.path().to_path_buf(),
                    reason: format!(
                        "entry {slot} of the index array at {array} points at {offset}"
                    ),
                }
            );
        }
        Ok(offset)
    }

    /// Fill whichever index slot `position` owns if it is still empty.
    fn ensure_indexed(&self, position: FramePosition, kind: FrameKind) -> Result<()> {
        let count = u64::from(self.roll_cycle.index_count());
        match kind {
            FrameKind::IndexArray => {
                let array_slot = position.sequence / self.array_span();
                if position.sequence % self.array_span() != 0 || array_slot >= count {
                    return Ok(());
                }
                let slot_offset = SEGMENT_HEADER_SIZE + array_slot * INDEX_ENTRY_SIZE;
                if self.file.read_u64(slot_offset)? == 0 {
                    self.file.write_u64(slot_offset, position.offset)?;
                }
            }
            FrameKind::Record => {
                let spacing = u64::from(self.roll_cycle.index_spacing());
                let slot = position.sequence / spacing;
                if position.sequence % spacing != 0 || slot / count >= count {
                    return Ok(());
                }
                let array = self.primary_entry(slot / count)?;
                if array == 0 {
                    return Ok(());
                }
                let entry_offset = array + FRAME_HEADER_SIZE + (slot % count) * INDEX_ENTRY_SIZE;
                if self.file.read_u64(entry_offset)? == 0 {
                    self.file.write_u64(entry_offset, position.offset)?;
                }
            }
        }
        Ok(())
    }

    fn header_at(&self, offset: u64) -> Result<FrameHeader> {
        if !self.file.ensure_mapped(offset + FRAME_HEADER_SIZE)? {
            return Ok(FrameHeader::Empty);
        }
        Ok(FrameHeader::decode(self.file.read_u32(offset)?))
    }

    /// Size of the published frame at `position`, checked against the file.
    fn published_size(&self, position: FramePosition, len: u32) -> Result<u64> {
        let size = frame_size(len);
        ensure!(
            self.file.ensure_mapped(position.offset + size)?,
            CorruptedFrameSnafu {
                cycle:    self.cycle,
                sequence: position.sequence,
            }
        );
        Ok(size)
    }

    fn scan_to(&self, sequence: u64, from: FramePosition) -> Result<FrameRead> {
        let mut position = from;
        loop {
            match self.header_at(position.offset)? {
                FrameHeader::Empty => return Ok(FrameRead::NotFound),
                FrameHeader::InProgress { .. } if position.sequence == sequence => {
                    return Ok(FrameRead::Busy);
                }
                FrameHeader::InProgress { .. } => return Ok(FrameRead::NotFound),
                FrameHeader::Ready { len } => {
                    let size = self.published_size(position, len)?;
                    if position.sequence == sequence {
                        return self.read_frame(position, len, size).map(FrameRead::Ready);
                    }
                    position = FramePosition {
                        sequence: position.sequence + 1,
                        offset:   position.offset + size,
                    };
                }
                FrameHeader::IndexArray { len } => {
                    position.offset += self.published_size(position, len)?;
                }
                FrameHeader::Corrupt(_) => {
                    return CorruptedFrameSnafu {
                        cycle:    self.cycle,
                        sequence: position.sequence,
                    }
                    .fail();
                }
            }
        }
    }

    /// Copy out and verify the frame at `position`.
    ///
    /// Frame bytes are plain copies through the mapping, so on a weakly
    /// ordered CPU a reader in another process can see the READY header
    /// before the payload it publishes. A CRC mismatch is re-read once
    /// after a fence and reported as `CorruptedFrame` only if the second
    /// read fails too. A frame still in flight after that looks corrupt.
    fn read_frame(&self, position: FramePosition, len: u32, size: u64) -> Result<Frame> {
        fence(Ordering::Acquire);
        let payload = match self.verified_payload(position.offset, len)? {
            Some(payload) => payload,
            None => {
                fence(Ordering::SeqCst);
                let reread = match self.header_at(position.offset)? {
                    FrameHeader::Ready { len: current } if current == len => {
                        self.verified_payload(position.offset, len)?
                    }
                    _ => None,
                };
                let Some(payload) = reread else {
                    return CorruptedFrameSnafu {
                        cycle:    self.cycle,
                        sequence: position.sequence,
                    }
                    .fail();
                };
                debug!(
                    cycle = self.cycle,
                    sequence = position.sequence,
                    "Frame verified on second read"
                );
                payload
            }
        };

        Ok(Frame {
            sequence:    position.sequence,
            offset:      position.offset,
            next_offset: position.offset + size,
            payload:     Bytes::from(payload),
        })
    }

    fn verified_payload(&self, offset: u64, len: u32) -> Result<Option<Vec<u8>>> {
        let payload_offset = offset + FRAME_HEADER_SIZE;
        let mut payload = vec![0u8; len as usize];
        self.file.read_at(payload_offset, &mut payload)?;
        let stored_crc = self.file.read_u32(payload_offset + u64::from(len))?;
        Ok(verify_frame_crc(len, &payload, stored_crc).then_some(payload))
    }

    /// Follow published frames from `from`, calling `visit` on each, until
    /// the first frame that is not published.
    fn walk(
        &self,
        from: FramePosition,
        mut visit: impl FnMut(FramePosition, FrameKind) -> Result<()>,
    ) -> Result<Frontier> {
        let mut position = from;
        loop {
            match self.header_at(position.offset)? {
                FrameHeader::Empty => {
                    return Ok(Frontier {
                        next_sequence:  position.sequence,
                        write_position: position.offset,
                        in_progress:    false,
                    });
                }
                FrameHeader::InProgress { .. } => {
                    return Ok(Frontier {
                        next_sequence:  position.sequence,
                        write_position: position.offset,
                        in_progress:    true,
                    });
                }
                FrameHeader::Ready { len } => {
                    let size = self.published_size(position, len)?;
                    visit(position, FrameKind::Record)?;
                    position = FramePosition {
                        sequence: position.sequence + 1,
                        offset:   position.offset + size,
                    };
                }
                FrameHeader::IndexArray { len } => {
                    let size = self.published_size(position, len)?;
                    visit(position, FrameKind::IndexArray)?;
                    position.offset += size;
                }
                FrameHeader::Corrupt(_) => {
                    return CorruptedFrameSnafu {
                        cycle:    self.cycle,
                        sequence: position.sequence,
                    }
                    .fail();
                }
            }
        }
    }

    fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.file.flush_range(offset, len)
    }
}

/// Highest slot in `0..=highest` with a non-zero entry, given that the
/// populated slots form a prefix.
fn last_populated(highest: u64, entry: impl Fn(u64) -> Result<u64>) -> Result<Option<u64>> {
    if entry(0)? == 0 {
        return Ok(None);
    }
    let (mut lo, mut hi) = (0, highest);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if entry(mid)? != 0 {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(Some(lo))
}

/// Appends frames to one segment.
///
/// Callers serialize writers to the same queue; the writer re-reads the
/// frontier before every append so several appenders in one process can
/// take turns.
pub(crate) struct SegmentWriter {
    segment:        Arc<Segment>,
    flush_mode:     FlushMode,
    /// The file grows in multiples of this many bytes.
    growth_step:    u64,
    next_sequence:  u64,
    write_position: u64,
    /// Start of the bytes not yet flushed.
    unflushed_from: u64,
}

impl SegmentWriter {
    /// Take over the end of `segment`.
    ///
    /// Fills index slots a crashed writer left empty and reclaims a frame it
    /// reserved but never published.
    pub(crate) fn attach(
        segment: Arc<Segment>,
        flush_mode: FlushMode,
        growth_step: u64,
    ) -> Result<Self> {
        let start = segment.nearest_indexed(u64::MAX)?;
        let frontier =
            segment.walk(start, |position, kind| segment.ensure_indexed(position, kind))?;

        if frontier.in_progress {
            Self::reclaim_torn_frame(&segment, frontier.write_position)?;
        }

        debug!(
            path = ?segment.path(),
            cycle = segment.cycle(),
            next_sequence = frontier.next_sequence,
            write_position = frontier.write_position,
            "Writer attached to segment"
        );

        Ok(Self {
            segment,
            flush_mode,
            growth_step,
            next_sequence: frontier.next_sequence,
            write_position: frontier.write_position,
            unflushed_from: frontier.write_position,
        })
    }

    fn reclaim_torn_frame(segment: &Segment, offset: u64) -> Result<()> {
        let len = match segment.header_at(offset)? {
            FrameHeader::InProgress { len } => len,
            _ => return Ok(()),
        };
        segment.file.ensure_mapped(offset + frame_size(len))?;
        let span = frame_size(len).min(segment.size() - offset);
        warn!(
            path = ?segment.path(),
            cycle = segment.cycle(),
            offset,
            len,
            "Reclaiming frame left in progress by a previous writer"
        );
        #[allow(clippy::cast_possible_truncation)]
        segment.file.write_at(offset, &vec![0u8; span as usize])?;
        segment.flush_range(offset, span)
    }

    pub(crate) fn cycle(&self) -> i64 { self.segment.cycle() }

    /// Whether the segment was sealed, by this process or another, after a
    /// writer moved on to a later cycle.
    pub(crate) fn is_sealed(&self) -> Result<bool> { self.segment.is_complete() }

    /// Catch up with frames another writer published since our last append.
    fn sync_frontier(&mut self) -> Result<()> {
        match self.segment.header_at(self.write_position)? {
            FrameHeader::Empty => Ok(()),
            FrameHeader::Ready { .. } | FrameHeader::IndexArray { .. } => {
                let from = FramePosition {
                    sequence: self.next_sequence,
                    offset:   self.write_position,
                };
                let segment = &self.segment;
                let frontier =
                    segment.walk(from, |position, kind| segment.ensure_indexed(position, kind))?;
                ensure!(
                    !frontier.in_progress,
                    ConcurrentWriterSnafu {
                        cycle:  segment.cycle(),
                        offset: frontier.write_position,
                    }
                );
                self.next_sequence = frontier.next_sequence;
                self.write_position = frontier.write_position;
                self.unflushed_from = self.unflushed_from.min(frontier.write_position);
                Ok(())
            }
            FrameHeader::InProgress { .. } => ConcurrentWriterSnafu {
                cycle:  self.segment.cycle(),
                offset: self.write_position,
            }
            .fail(),
            FrameHeader::Corrupt(_) => CorruptedFrameSnafu {
                cycle:    self.segment.cycle(),
                sequence: self.next_sequence,
            }
            .fail(),
        }
    }

    /// Append `payload` at the end of the segment and return its sequence.
    pub(crate) fn append(&mut self, payload: &[u8], scratch: &mut BytesMut) -> Result<u64> {
        self.sync_frontier()?;
        self.append_frame(payload, scratch)
    }

    /// Append `payload` only if `sequence` is the next one to write.
    pub(crate) fn append_at_sequence(
        &mut self,
        sequence: u64,
        payload: &[u8],
        scratch: &mut BytesMut,
    ) -> Result<u64> {
        self.sync_frontier()?;

        if sequence != self.next_sequence {
            let roll_cycle = &self.segment.roll_cycle;
            let index = roll_cycle.to_index(self.segment.cycle(), sequence)?;
            ensure!(sequence > self.next_sequence, AlreadyExistsSnafu { index });
            return OutOfRangeSnafu {
                index,
                reason: "beyond the end of the queue",
            }
            .fail();
        }

        self.append_frame(payload, scratch)
    }

    fn append_frame(&mut self, payload: &[u8], scratch: &mut BytesMut) -> Result<u64> {
        ensure!(
            payload.len() <= MAX_PAYLOAD_LEN,
            InvalidArgumentSnafu {
                reason: format!(
                    "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit",
                    payload.len()
                ),
            }
        );

        let sequence = self.next_sequence;
        let cycle = self.segment.cycle();
        ensure!(
            sequence <= self.segment.roll_cycle.max_sequence(),
            InvalidArgumentSnafu {
                reason: format!("cycle {cycle} has no sequence numbers left"),
            }
        );

        self.allocate_index_array(sequence)?;

        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        let size = frame_size(len);
        let offset = self.write_position;
        self.segment.file.grow(offset + size, self.growth_step)?;

        #[allow(clippy::cast_possible_truncation)]
        let body_len = (size - FRAME_HEADER_SIZE) as usize;
        scratch.clear();
        scratch.reserve(body_len);
        scratch.put_slice(payload);
        scratch.put_u32_le(frame_crc(len, payload));
        scratch.resize(body_len, 0);

        let file = &self.segment.file;
        file.write_u32(offset, FrameHeader::InProgress { len }.encode())?;
        file.write_at(offset + FRAME_HEADER_SIZE, &scratch[..])?;
        self.segment
            .ensure_indexed(FramePosition { sequence, offset }, FrameKind::Record)?;
        fence(Ordering::Release);
        file.write_u32(offset, FrameHeader::Ready { len }.encode())?;

        self.next_sequence = sequence + 1;
        self.write_position = offset + size;

        trace!(cycle, sequence, offset, len, "Appended frame");

        self.after_append()?;
        Ok(sequence)
    }

    /// Write the index array covering `sequence` if it starts there and has
    /// not been written yet.
    fn allocate_index_array(&mut self, sequence: u64) -> Result<()> {
        let segment = &self.segment;
        let span = segment.array_span();
        let array_slot = sequence / span;
        if sequence % span != 0
            || array_slot >= u64::from(segment.roll_cycle.index_count())
            || segment.primary_entry(array_slot)? != 0
        {
            return Ok(());
        }

        let len = index_array_len(&segment.roll_cycle);
        let size = frame_size(len);
        let offset = self.write_position;
        segment.file.grow(offset + size, self.growth_step)?;

        let file = &segment.file;
        file.write_u32(offset, FrameHeader::InProgress { len }.encode())?;
        #[allow(clippy::cast_possible_truncation)]
        file.write_at(
            offset + FRAME_HEADER_SIZE,
            &vec![0u8; (size - FRAME_HEADER_SIZE) as usize],
        )?;
        fence(Ordering::Release);
        file.write_u32(offset, FrameHeader::IndexArray { len }.encode())?;
        segment.ensure_indexed(FramePosition { sequence, offset }, FrameKind::IndexArray)?;

        debug!(cycle = segment.cycle(), array_slot, offset, "Allocated index array");
        self.write_position = offset + size;
        Ok(())
    }

    fn after_append(&mut self) -> Result<()> {
        match self.flush_mode {
            FlushMode::Async => Ok(()),
            FlushMode::Sync => self.flush(),
            FlushMode::Batch { bytes } => {
                if self.write_position - self.unflushed_from >= bytes {
                    self.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Flush everything appended since the last flush.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.write_position > self.unflushed_from {
            self.segment
                .flush_range(self.unflushed_from, self.write_position - self.unflushed_from)?;
            self.unflushed_from = self.write_position;
        }
        Ok(())
    }

    /// Flush and seal the segment; called when the writer moves on to a
    /// later cycle.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.flush()?;
        self.segment.mark_complete()?;
        debug!(
            path = ?self.segment.path(),
            cycle = self.segment.cycle(),
            records = self.next_sequence,
            "Sealed segment"
        );
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(cycle = self.segment.cycle(), error = ?e, "Failed to flush segment on drop");
        }
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("cycle", &self.segment.cycle())
            .field("next_sequence", &self.next_sequence)
            .field("write_position", &self.write_position)
            .finish_non_exhaustive()
    }
}
