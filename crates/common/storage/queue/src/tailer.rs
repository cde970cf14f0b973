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

//! Record reader (tailer) for consuming the queue.
//!
//! The [`Tailer`] keeps its own cursor and walks the queue in either
//! direction:
//! - Sequential reads via [`read_next`](Tailer::read_next) or the `Iterator`
//!   trait
//! - Positioning via [`to_start`](Tailer::to_start),
//!   [`to_end`](Tailer::to_end) and [`move_to_index`](Tailer::move_to_index)
//! - Crossing into the adjacent cycle with data, skipping empty cycles
//! - CRC verification on every read
//!
//! ## Cursor
//!
//! The cursor is the index the next read returns in the current direction.
//! A forward read leaves it one past the record it returned; a backward read
//! leaves it on the preceding record. When a read finds nothing, the cursor
//! does not move, so reversing direction resumes exactly where reading
//! stopped.

use std::sync::Arc;

use crate::{
    Result, RollCycle,
    cycle_store::CycleStore,
    frame::Excerpt,
    roll_cycle::UNPOSITIONED_INDEX,
    segment::{FramePosition, FrameRead, Segment},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TailerDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    /// No cursor yet; the first read picks the start for the direction.
    Unpositioned,
    Positioned,
    /// Ran off the start of the queue reading in this direction.
    Exhausted(TailerDirection),
}

/// Outcome of [`Tailer::read_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Excerpt(Excerpt),
    /// The next record is being written; try again.
    Busy,
    /// Nothing further in this direction right now.
    EndOfStream,
}

/// A reader for consuming records from the queue.
///
/// Multiple tailers can read from the same queue concurrently, each with its
/// own cursor. Tailers are not thread-safe; use one per thread.
pub struct Tailer {
    store:      Arc<CycleStore>,
    roll_cycle: RollCycle,
    direction:  TailerDirection,
    state:      TailerState,
    cycle:      i64,
    sequence:   u64,
    /// Segment of `cycle`, once opened.
    segment:    Option<Arc<Segment>>,
    /// Position of the record under a forward cursor, when known.
    hint:       Option<FramePosition>,
}

impl Tailer {
    pub(crate) fn new(store: Arc<CycleStore>) -> Self {
        let roll_cycle = *store.roll_cycle();
        Self {
            store,
            roll_cycle,
            direction: TailerDirection::Forward,
            state: TailerState::Unpositioned,
            cycle: 0,
            sequence: 0,
            segment: None,
            hint: None,
        }
    }

    /// Set the direction of subsequent reads. Does not move the cursor.
    pub const fn direction(&mut self, direction: TailerDirection) -> &mut Self {
        self.direction = direction;
        self
    }

    pub const fn current_direction(&self) -> TailerDirection { self.direction }

    pub const fn state(&self) -> TailerState { self.state }

    /// The cursor, or [`UNPOSITIONED_INDEX`] before the tailer is positioned.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn index(&self) -> i64 {
        match self.state {
            TailerState::Unpositioned => UNPOSITIONED_INDEX,
            // Sequence one past the last representable rolls into the next
            // cycle's sequence 0, which is where the next record would be.
            _ => (self.cycle << self.roll_cycle.sequence_bits()) + self.sequence as i64,
        }
    }

    /// Cycle of the cursor.
    pub const fn cycle(&self) -> Option<i64> {
        match self.state {
            TailerState::Unpositioned => None,
            _ => Some(self.cycle),
        }
    }

    /// Move to the first record of the queue. An empty queue leaves the
    /// tailer unpositioned.
    pub fn to_start(&mut self) -> Result<&mut Self> {
        match self.store.lowest_cycle_with_data()? {
            Some(cycle) => self.position(cycle, 0),
            None => self.unposition(),
        }
        Ok(self)
    }

    /// Move to the end of the queue: onto the last record when reading
    /// backward, one past it when reading forward. An empty queue leaves the
    /// tailer unpositioned.
    pub fn to_end(&mut self) -> Result<&mut Self> {
        match self.last_record()? {
            Some((cycle, last)) => match self.direction {
                TailerDirection::Forward => self.position(cycle, last + 1),
                TailerDirection::Backward => self.position(cycle, last),
            },
            None => self.unposition(),
        }
        Ok(self)
    }

    /// Move the cursor to `index`.
    ///
    /// Returns `false`, leaving the cursor where it was, unless `index` is a
    /// record or the next free slot of an existing cycle.
    pub fn move_to_index(&mut self, index: i64) -> Result<bool> {
        if index < 0 {
            return Ok(false);
        }
        let cycle = self.roll_cycle.to_cycle(index);
        let sequence = self.roll_cycle.to_sequence(index);

        let Some(segment) = self.store.segment_for(cycle, false)? else {
            return Ok(false);
        };
        let reachable = match segment.read(sequence)? {
            FrameRead::Ready(_) | FrameRead::Busy => true,
            FrameRead::NotFound => segment.frontier()?.next_sequence == sequence,
        };
        if reachable {
            self.position(cycle, sequence);
            self.segment = Some(segment);
        }
        Ok(reachable)
    }

    /// Read the record under the cursor and step in the current direction.
    pub fn read_next(&mut self) -> Result<ReadStatus> {
        match self.state {
            TailerState::Unpositioned => {
                if !self.position_for_first_read()? {
                    return Ok(ReadStatus::EndOfStream);
                }
            }
            TailerState::Exhausted(exhausted) => {
                if exhausted != self.direction {
                    self.state = TailerState::Positioned;
                }
                return Ok(ReadStatus::EndOfStream);
            }
            TailerState::Positioned => {}
        }

        match self.direction {
            TailerDirection::Forward => self.read_forward(),
            TailerDirection::Backward => self.read_backward(),
        }
    }

    fn read_forward(&mut self) -> Result<ReadStatus> {
        loop {
            let read = match self.current_segment()? {
                Some(segment) => segment.read_from(self.sequence, self.hint)?,
                None => FrameRead::NotFound,
            };

            match read {
                FrameRead::Ready(frame) => {
                    let index = self.index();
                    self.sequence += 1;
                    self.hint = Some(frame.next_position());
                    return Ok(ReadStatus::Excerpt(Excerpt {
                        index,
                        payload: frame.payload,
                    }));
                }
                status @ (FrameRead::Busy | FrameRead::NotFound) => {
                    match self.store.next_cycle_with_data(self.cycle)? {
                        Some(next) => self.position(next, 0),
                        None if status == FrameRead::Busy => return Ok(ReadStatus::Busy),
                        None => return Ok(ReadStatus::EndOfStream),
                    }
                }
            }
        }
    }

    fn read_backward(&mut self) -> Result<ReadStatus> {
        loop {
            let Some(segment) = self.current_segment()? else {
                match self.last_record_before(self.cycle)? {
                    Some((cycle, last)) => {
                        self.position(cycle, last);
                        continue;
                    }
                    None => return Ok(ReadStatus::EndOfStream),
                }
            };

            match segment.read(self.sequence)? {
                FrameRead::Ready(frame) => {
                    let index = self.index();
                    if self.sequence > 0 {
                        self.sequence -= 1;
                    } else if let Some((cycle, last)) = self.last_record_before(self.cycle)? {
                        self.position(cycle, last);
                    } else {
                        self.state = TailerState::Exhausted(TailerDirection::Backward);
                    }
                    self.hint = None;
                    return Ok(ReadStatus::Excerpt(Excerpt {
                        index,
                        payload: frame.payload,
                    }));
                }
                FrameRead::Busy | FrameRead::NotFound => {
                    match segment.last_complete_sequence()? {
                        Some(last) if last < self.sequence => {
                            self.sequence = last;
                            self.hint = None;
                        }
                        _ => match self.last_record_before(self.cycle)? {
                            Some((cycle, last)) => self.position(cycle, last),
                            None => return Ok(ReadStatus::EndOfStream),
                        },
                    }
                }
            }
        }
    }

    /// Pick the starting point of an unpositioned tailer. Returns `false`
    /// when the queue has no records.
    fn position_for_first_read(&mut self) -> Result<bool> {
        let start = match self.direction {
            TailerDirection::Forward => self
                .store
                .lowest_cycle_with_data()?
                .map(|cycle| (cycle, 0)),
            TailerDirection::Backward => self.last_record()?,
        };
        match start {
            Some((cycle, sequence)) => {
                self.position(cycle, sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Last record of the highest cycle that has one.
    fn last_record(&self) -> Result<Option<(i64, u64)>> {
        let Some(highest) = self.store.highest_cycle_with_data()? else {
            return Ok(None);
        };
        if let Some(last) = self.last_sequence_of(highest)? {
            return Ok(Some((highest, last)));
        }
        self.last_record_before(highest)
    }

    /// Last record of the closest cycle before `cycle` that has one.
    fn last_record_before(&self, cycle: i64) -> Result<Option<(i64, u64)>> {
        let mut before = cycle;
        while let Some(previous) = self.store.previous_cycle_with_data(before)? {
            if let Some(last) = self.last_sequence_of(previous)? {
                return Ok(Some((previous, last)));
            }
            before = previous;
        }
        Ok(None)
    }

    fn last_sequence_of(&self, cycle: i64) -> Result<Option<u64>> {
        match self.store.segment_for(cycle, false)? {
            Some(segment) => segment.last_complete_sequence(),
            None => Ok(None),
        }
    }

    fn current_segment(&mut self) -> Result<Option<Arc<Segment>>> {
        if let Some(segment) = &self.segment {
            if segment.cycle() == self.cycle {
                return Ok(Some(Arc::clone(segment)));
            }
        }
        self.segment = self.store.segment_for(self.cycle, false)?;
        Ok(self.segment.clone())
    }

    fn position(&mut self, cycle: i64, sequence: u64) {
        self.state = TailerState::Positioned;
        self.cycle = cycle;
        self.sequence = sequence;
        self.hint = None;
    }

    fn unposition(&mut self) {
        self.state = TailerState::Unpositioned;
        self.cycle = 0;
        self.sequence = 0;
        self.segment = None;
        self.hint = None;
    }
}

impl std::fmt::Debug for Tailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("index", &format_args!("{:x}", self.index()))
            .finish_non_exhaustive()
    }
}

impl Iterator for Tailer {
    type Item = Result<Excerpt>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(ReadStatus::Excerpt(excerpt)) => Some(Ok(excerpt)),
            Ok(ReadStatus::Busy | ReadStatus::EndOfStream) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
