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

//! Record types and the on-disk frame format.
//!
//! - [`Excerpt`]: what a tailer hands back for every record it reads
//! - `FrameHeader`: the 4-byte word that prefixes every frame
//!
//! ## On-Disk Frame Format
//!
//! ```text
//! ┌─────────────────────┬──────────────────────┬─────────────────┬─────────┐
//! │  Header (4B)        │   Payload (variable) │   CRC32 (4B)    │ padding │
//! │  state | length     │   raw bytes          │   little-endian │ to 4B   │
//! └─────────────────────┴──────────────────────┴─────────────────┴─────────┘
//! ```
//!
//! The header word doubles as the publish fence between the writer and
//! readers:
//!
//! - `0`: nothing written here yet
//! - `BUSY | len`: the writer reserved the frame and is still copying
//! - `READY | len`: payload and CRC are in place
//! - `READY | INDEX | len`: a second-level index array, not a record
//!
//! The writer stores the `READY` word last, after payload and checksum. On a
//! strongly ordered CPU a reader that sees `READY` sees the whole frame; on
//! a weakly ordered one the reader re-reads a frame whose CRC does not match
//! before treating it as corrupt. An empty payload is a valid frame
//! (`READY | 0`), distinct from "no frame" (`0`).

use bytes::Bytes;

/// Size of the frame header word.
pub(crate) const FRAME_HEADER_SIZE: u64 = 4;

/// Size of the trailing CRC32.
pub(crate) const FRAME_CRC_SIZE: u64 = 4;

/// Frames start on this boundary so header words are never split.
pub(crate) const FRAME_ALIGNMENT: u64 = 4;

const BUSY_BIT: u32 = 1 << 31;
const READY_BIT: u32 = 1 << 30;
const INDEX_BIT: u32 = 1 << 29;
const LENGTH_MASK: u32 = INDEX_BIT - 1;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = LENGTH_MASK as usize;

/// A record read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excerpt {
    /// Index the record was written at.
    pub index:   i64,
    /// Record bytes, opaque to the queue.
    pub payload: Bytes,
}

/// Decoded frame header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameHeader {
    Empty,
    InProgress { len: u32 },
    Ready { len: u32 },
    /// Published index array; carries no sequence.
    IndexArray { len: u32 },
    /// Both state bits, or neither with a non-zero length.
    Corrupt(u32),
}

impl FrameHeader {
    pub(crate) const fn decode(word: u32) -> Self {
        let len = word & LENGTH_MASK;
        match (word & BUSY_BIT != 0, word & READY_BIT != 0) {
            (false, false) if word == 0 => Self::Empty,
            (true, false) => Self::InProgress { len },
            (false, true) if word & INDEX_BIT != 0 => Self::IndexArray { len },
            (false, true) => Self::Ready { len },
            _ => Self::Corrupt(word),
        }
    }

    pub(crate) const fn encode(self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::InProgress { len } => BUSY_BIT | (len & LENGTH_MASK),
            Self::Ready { len } => READY_BIT | (len & LENGTH_MASK),
            Self::IndexArray { len } => READY_BIT | INDEX_BIT | (len & LENGTH_MASK),
            Self::Corrupt(word) => word,
        }
    }
}

/// Bytes a frame with a `payload_len` payload occupies, padding included.
#[inline]
pub(crate) const fn frame_size(payload_len: u32) -> u64 {
    let raw = FRAME_HEADER_SIZE + payload_len as u64 + FRAME_CRC_SIZE;
    raw.next_multiple_of(FRAME_ALIGNMENT)
}
