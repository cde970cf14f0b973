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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
///
/// `Busy` and end-of-stream are not represented here: they are ordinary
/// read outcomes, see [`ReadStatus`](crate::ReadStatus) and
/// [`FrameRead`](crate::FrameRead).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error: {source}"), context(false))]
    Io { source: io::Error },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed: {message}"))]
    Mmap { message: String },

    /// Explicit placement targeted a slot that is already written.
    #[snafu(display("Unable to move to index {index:x} as the index already exists"))]
    AlreadyExists { index: i64 },

    /// Explicit placement would leave a gap or targets a cycle that can no
    /// longer be extended.
    #[snafu(display("Unable to move to index {index:x} {reason}"))]
    OutOfRange { index: i64, reason: String },

    /// Index codec overflow or malformed configuration.
    #[snafu(display("Invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Segment header does not describe a valid segment.
    #[snafu(display("Corrupted segment {}: {reason}", path.display()))]
    CorruptedSegment { path: PathBuf, reason: String },

    /// Published frame failed its CRC check or overruns the segment.
    #[snafu(display("Corrupted frame in cycle {cycle} at sequence {sequence}"))]
    CorruptedFrame { cycle: i64, sequence: u64 },

    /// An in-progress frame appeared at the write frontier while appending.
    #[snafu(display("Another writer is appending to cycle {cycle} at offset {offset}"))]
    ConcurrentWriter { cycle: i64, offset: u64 },
}

impl QueueError {
    /// Returns `true` for failures of the underlying storage.
    ///
    /// These abort the operation that hit them and are never retried
    /// internally.
    #[must_use]
    pub const fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Mmap { .. }
                | Self::CorruptedSegment { .. }
                | Self::CorruptedFrame { .. }
                | Self::ConcurrentWriter { .. }
        )
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
