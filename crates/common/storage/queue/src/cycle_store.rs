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

//! Directory of segments, one per cycle.
//!
//! The store knows which cycles have a file on disk and caches the segments
//! it has mapped. Cycles written by other processes show up after a
//! [`refresh`](CycleStore::refresh). When the cached view has no later
//! cycle, [`next_cycle_with_data`](CycleStore::next_cycle_with_data)
//! re-reads the directory only if the cycle it is leaving is sealed or
//! missing, or the last scan is older than [`REFRESH_INTERVAL`]. A tailer
//! polling the end of a live cycle therefore does not list the directory
//! on every poll.
//!
//! At most [`MAX_MAPPED_SEGMENTS`] segments stay mapped once nothing else
//! holds them; the least recent cycles are unmapped first.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{
    Result, RollCycle,
    path::{scan_cycles, segment_file_path},
    segment::Segment,
};

/// Idle segments kept mapped; segments still held by an appender or tailer
/// are never unmapped.
pub const MAX_MAPPED_SEGMENTS: usize = 32;

/// How stale the directory listing may get before a miss rescans it.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

struct StoreState {
    /// Cycles with a segment file on disk, as of the last refresh.
    known:        BTreeSet<i64>,
    /// Segments currently mapped.
    segments:     BTreeMap<i64, Arc<Segment>>,
    last_refresh: Instant,
}

impl StoreState {
    /// Unmap segments nobody else holds, lowest cycle first, until at most
    /// `MAX_MAPPED_SEGMENTS` remain. `keep` and the highest mapped cycle
    /// stay.
    fn evict_idle(&mut self, keep: i64) {
        if self.segments.len() <= MAX_MAPPED_SEGMENTS {
            return;
        }
        let highest = self.segments.keys().next_back().copied();
        let excess = self.segments.len() - MAX_MAPPED_SEGMENTS;
        let idle: Vec<i64> = self
            .segments
            .iter()
            .filter(|(cycle, segment)| {
                **cycle != keep && Some(**cycle) != highest && Arc::strong_count(*segment) == 1
            })
            .map(|(cycle, _)| *cycle)
            .take(excess)
            .collect();
        for cycle in &idle {
            self.segments.remove(cycle);
        }
        trace!(unmapped = idle.len(), mapped = self.segments.len(), "Unmapped idle segments");
    }
}

/// Owns the `cycle -> segment` mapping of one queue directory.
pub struct CycleStore {
    base_path:        PathBuf,
    roll_cycle:       RollCycle,
    block_size:       u64,
    /// Minimum age of the directory listing before a miss on an open cycle
    /// rescans it.
    refresh_interval: Duration,
    state:            RwLock<StoreState>,
}

impl std::fmt::Debug for CycleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleStore")
            .field("base_path", &self.base_path)
            .field("roll_cycle", &self.roll_cycle.name())
            .field("cycles", &self.state.read().known.len())
            .finish_non_exhaustive()
    }
}

impl CycleStore {
    /// Open the store at `base_path`, creating the directory if needed.
    pub fn open<P: Into<PathBuf>>(
        base_path: P,
        roll_cycle: RollCycle,
        block_size: u64,
    ) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        let known = scan_cycles(&base_path, &roll_cycle)?;

        debug!(
            path = ?base_path,
            roll_cycle = roll_cycle.name(),
            cycles = known.len(),
            "Opened cycle store"
        );

        Ok(Self {
            base_path,
            roll_cycle,
            block_size,
            refresh_interval: REFRESH_INTERVAL,
            state: RwLock::new(StoreState {
                known,
                segments: BTreeMap::new(),
                last_refresh: Instant::now(),
            }),
        })
    }

    pub fn base_path(&self) -> &Path { &self.base_path }

    pub const fn roll_cycle(&self) -> &RollCycle { &self.roll_cycle }

    pub const fn block_size(&self) -> u64 { self.block_size }

    /// Re-read the directory listing to pick up cycles created elsewhere.
    pub fn refresh(&self) -> Result<()> {
        let found = scan_cycles(&self.base_path, &self.roll_cycle)?;
        let mut state = self.state.write();
        let before = state.known.len();
        state.known = found;
        state.last_refresh = Instant::now();
        let mapped: Vec<i64> = state.segments.keys().copied().collect();
        state.known.extend(mapped);
        trace!(before, after = state.known.len(), "Refreshed cycle store");
        Ok(())
    }

    /// Cycles known to have a segment, ascending.
    pub fn cycles(&self) -> Vec<i64> { self.state.read().known.iter().copied().collect() }

    /// Highest cycle with a segment in the cached view.
    pub fn highest_known_cycle(&self) -> Option<i64> { self.state.read().known.last().copied() }

    /// Number of segments currently mapped.
    pub fn mapped_segments(&self) -> usize { self.state.read().segments.len() }

    /// Segment of `cycle`.
    ///
    /// Returns `None` when the cycle has no segment and `create_if_absent`
    /// is false. Creation is first-writer-wins across threads and processes.
    pub fn segment_for(&self, cycle: i64, create_if_absent: bool) -> Result<Option<Arc<Segment>>> {
        if let Some(segment) = self.state.read().segments.get(&cycle) {
            return Ok(Some(Arc::clone(segment)));
        }

        let path = segment_file_path(&self.base_path, &self.roll_cycle, cycle)?;
        let segment = if path.exists() {
            Segment::open(&path, &self.roll_cycle, cycle)?
        } else if create_if_absent {
            Segment::create_or_open(&path, &self.roll_cycle, cycle, self.block_size)?
        } else {
            return Ok(None);
        };

        let mut state = self.state.write();
        state.known.insert(cycle);
        let segment = Arc::clone(
            state
                .segments
                .entry(cycle)
                .or_insert_with(|| Arc::new(segment)),
        );
        state.evict_idle(cycle);
        Ok(Some(segment))
    }

    /// Lowest cycle holding at least one record.
    pub fn lowest_cycle_with_data(&self) -> Result<Option<i64>> {
        self.refresh()?;
        let candidates = self.candidates(|known| known.iter().copied().collect());
        self.first_with_data(candidates)
    }

    /// Highest cycle holding at least one record.
    pub fn highest_cycle_with_data(&self) -> Result<Option<i64>> {
        self.refresh()?;
        let candidates = self.candidates(|known| known.iter().rev().copied().collect());
        self.first_with_data(candidates)
    }

    /// Closest cycle after `after` holding at least one record. Empty cycles
    /// in between are skipped.
    pub fn next_cycle_with_data(&self, after: i64) -> Result<Option<i64>> {
        let after_range = |known: &BTreeSet<i64>| -> Vec<i64> {
            known
                .range((Bound::Excluded(after), Bound::Unbounded))
                .copied()
                .collect()
        };

        if let Some(cycle) = self.first_with_data(self.candidates(&after_range))? {
            return Ok(Some(cycle));
        }
        let leaving_finished = match self.segment_for(after, false)? {
            Some(segment) => segment.is_complete()?,
            None => true,
        };
        if !leaving_finished && !self.refresh_due() {
            return Ok(None);
        }
        self.refresh()?;
        self.first_with_data(self.candidates(&after_range))
    }

    /// Closest cycle before `before` holding at least one record.
    pub fn previous_cycle_with_data(&self, before: i64) -> Result<Option<i64>> {
        let before_range =
            |known: &BTreeSet<i64>| -> Vec<i64> { known.range(..before).rev().copied().collect() };

        if let Some(cycle) = self.first_with_data(self.candidates(&before_range))? {
            return Ok(Some(cycle));
        }
        if !self.refresh_due() {
            return Ok(None);
        }
        self.refresh()?;
        self.first_with_data(self.candidates(&before_range))
    }

    fn refresh_due(&self) -> bool {
        self.state.read().last_refresh.elapsed() >= self.refresh_interval
    }

    // The lock is released before any segment is opened.
    fn candidates(&self, select: impl Fn(&BTreeSet<i64>) -> Vec<i64>) -> Vec<i64> {
        select(&self.state.read().known)
    }

    fn first_with_data(&self, candidates: Vec<i64>) -> Result<Option<i64>> {
        for cycle in candidates {
            if let Some(segment) = self.segment_for(cycle, false)? {
                if segment.has_data()? {
                    return Ok(Some(cycle));
                }
            }
        }
        Ok(None)
    }
}
