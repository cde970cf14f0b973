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

//! Record writer (appender) for extending the queue.
//!
//! The [`Appender`] writes each record into the segment of the current
//! cycle:
//! - [`write`](Appender::write) picks the cycle from the clock, rolling to a
//!   new segment when the clock moves into a later cycle
//! - [`write_at`](Appender::write_at) places a record at a caller-chosen
//!   index, refusing overwrites and gaps
//!
//! ## Concurrency
//!
//! Appenders created from the same [`Queue`](crate::Queue) share a write
//! lock, so at most one append runs at a time. An appender picks up records
//! written by its siblings before every append.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, info};

use crate::{
    QueueConfig, Result,
    cycle_store::CycleStore,
    error::{AlreadyExistsSnafu, InvalidArgumentSnafu, OutOfRangeSnafu},
    roll_cycle::NO_INDEX,
    segment::{FrameRead, SegmentWriter},
};

/// Writes records to the queue.
///
/// Not `Clone`: each appender owns its writer cursor and scratch buffer.
/// Create one per thread from the queue.
pub struct Appender {
    store:               Arc<CycleStore>,
    config:              Arc<QueueConfig>,
    /// Shared with every appender of the same queue.
    write_lock:          Arc<Mutex<()>>,
    writer:              Option<SegmentWriter>,
    last_index_appended: i64,
    /// Frame body assembled here before it is copied into the segment.
    scratch:             BytesMut,
}

impl Appender {
    pub(crate) fn new(
        store: Arc<CycleStore>,
        config: Arc<QueueConfig>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            config,
            write_lock,
            writer: None,
            last_index_appended: NO_INDEX,
            scratch: BytesMut::new(),
        }
    }

    /// Append `payload` to the current cycle and return its index.
    ///
    /// The cycle is the later of the clock's cycle and the highest cycle
    /// already written, so indexes never go backwards even if the clock
    /// does. The directory is re-read before the first write and whenever
    /// the current segment has been sealed, since another queue instance
    /// may have moved on to a later cycle.
    pub fn write(&mut self, payload: impl AsRef<[u8]>) -> Result<i64> {
        let payload = payload.as_ref();
        let write_lock = Arc::clone(&self.write_lock);
        let _guard = write_lock.lock();

        let stale = match self.writer.as_ref() {
            Some(writer) => writer.is_sealed()?,
            None => true,
        };
        if stale {
            self.store.refresh()?;
        }

        let roll_cycle = self.config.roll_cycle;
        let now = self.config.time_provider.current_time_millis();
        let target = [
            Some(roll_cycle.cycle_for_time(now)),
            self.writer.as_ref().map(SegmentWriter::cycle),
            self.store.highest_known_cycle(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_default();
        // Rejects a clock that reads before the epoch.
        roll_cycle.to_index(target, 0)?;

        let writer = writer_for(&mut self.writer, &self.store, &self.config, target)?;
        let sequence = writer.append(payload, &mut self.scratch)?;
        let index = roll_cycle.to_index(target, sequence)?;

        self.last_index_appended = index;
        Ok(index)
    }

    /// Append `payload` at exactly `index`.
    ///
    /// The slot must be the next free one of the highest cycle, or sequence
    /// 0 of a later cycle. Errors name the requested index:
    /// - `AlreadyExists` if the slot holds a record
    /// - `OutOfRange` if writing it would leave a gap, or it lies in a cycle
    ///   before the highest one
    pub fn write_at(&mut self, index: i64, payload: impl AsRef<[u8]>) -> Result<i64> {
        let payload = payload.as_ref();
        ensure!(
            index >= 0,
            InvalidArgumentSnafu {
                reason: format!("index {index} is negative"),
            }
        );

        let write_lock = Arc::clone(&self.write_lock);
        let _guard = write_lock.lock();

        let roll_cycle = self.config.roll_cycle;
        let cycle = roll_cycle.to_cycle(index);
        let sequence = roll_cycle.to_sequence(index);

        self.store.refresh()?;
        let highest = self.store.highest_known_cycle();

        match highest {
            Some(highest) if cycle < highest => {
                let exists = match self.store.segment_for(cycle, false)? {
                    Some(segment) => segment.read(sequence)? != FrameRead::NotFound,
                    None => false,
                };
                ensure!(!exists, AlreadyExistsSnafu { index });
                OutOfRangeSnafu {
                    index,
                    reason: "precedes the last written cycle",
                }
                .fail()
            }
            Some(highest) if cycle == highest => {
                let writer = writer_for(&mut self.writer, &self.store, &self.config, cycle)?;
                writer.append_at_sequence(sequence, payload, &mut self.scratch)?;
                self.last_index_appended = index;
                Ok(index)
            }
            _ => {
                ensure!(
                    sequence == 0,
                    OutOfRangeSnafu {
                        index,
                        reason: "beyond the end of the queue",
                    }
                );
                let writer = writer_for(&mut self.writer, &self.store, &self.config, cycle)?;
                writer.append_at_sequence(0, payload, &mut self.scratch)?;
                self.last_index_appended = index;
                Ok(index)
            }
        }
    }

    /// Index of the last record this appender wrote, `NO_INDEX` before the
    /// first write.
    pub const fn last_index_appended(&self) -> i64 { self.last_index_appended }

    /// Cycle the appender is writing to, if it has written anything.
    pub fn cycle(&self) -> Option<i64> { self.writer.as_ref().map(SegmentWriter::cycle) }

    /// Flush records this appender wrote that the flush mode has not flushed
    /// yet.
    pub fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("writer", &self.writer)
            .field("last_index_appended", &self.last_index_appended)
            .finish_non_exhaustive()
    }
}

/// Writer for `cycle`, attaching to (and if needed creating) its segment.
///
/// Moving to a later cycle seals the segment being left, and the previous
/// highest segment when this appender never wrote to it.
fn writer_for<'a>(
    slot: &'a mut Option<SegmentWriter>,
    store: &CycleStore,
    config: &QueueConfig,
    cycle: i64,
) -> Result<&'a mut SegmentWriter> {
    let writer = match slot.take() {
        Some(writer) if writer.cycle() == cycle => writer,
        previous => {
            let highest = store.highest_known_cycle();
            let Some(segment) = store.segment_for(cycle, true)? else {
                return InvalidArgumentSnafu {
                    reason: format!("no segment for cycle {cycle}"),
                }
                .fail();
            };
            let writer = SegmentWriter::attach(segment, config.flush_mode, config.block_size)?;

            if let Some(previous) = previous {
                if previous.cycle() < cycle {
                    previous.finish()?;
                }
            }
            if let Some(highest) = highest.filter(|highest| *highest < cycle) {
                if let Some(segment) = store.segment_for(highest, false)? {
                    segment.mark_complete()?;
                }
                info!(from = highest, to = cycle, "Rolled to new cycle");
            } else {
                debug!(cycle, "Appender attached to cycle");
            }
            writer
        }
    };
    Ok(slot.insert(writer))
}
