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

//! Main queue struct.
//!
//! The [`Queue`] is the entry point of the library. It owns the directory of
//! cycle segments and hands out:
//! - [`Appender`]s, which share one write lock
//! - [`Tailer`]s, each with an independent cursor
//!
//! ## Usage
//!
//! ```ignore
//! // Create or open a queue
//! let queue = QueueBuilder::new("/path/to/queue")
//!     .roll_cycle(RollCycle::HOURLY)
//!     .build()?;
//!
//! // Write records
//! let mut appender = queue.create_appender();
//! let index = appender.write(b"hello")?;
//!
//! // Read records
//! let mut tailer = queue.create_tailer();
//! while let ReadStatus::Excerpt(excerpt) = tailer.read_next()? {
//!     println!("{:x}: {:?}", excerpt.index, excerpt.payload);
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{
    QueueConfig, Result, RollCycle, appender::Appender, cycle_store::CycleStore,
    roll_cycle::NO_INDEX, tailer::Tailer,
};

/// A persistent queue partitioned into time-based cycles.
///
/// Thread-safe; appenders and tailers can be created from any thread.
pub struct Queue {
    config:     Arc<QueueConfig>,
    store:      Arc<CycleStore>,
    /// Serializes appends from every appender of this queue.
    write_lock: Arc<Mutex<()>>,
}

impl Queue {
    /// Open the queue described by `config`, creating its directory if it
    /// does not exist.
    pub(crate) fn open(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = Arc::new(CycleStore::open(
            config.base_path.clone(),
            config.roll_cycle,
            config.block_size,
        )?);

        info!(
            path = ?config.base_path,
            roll_cycle = config.roll_cycle.name(),
            block_size = config.block_size,
            cycles = store.cycles().len(),
            "Queue opened"
        );

        Ok(Self {
            config,
            store,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn create_appender(&self) -> Appender {
        Appender::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.write_lock),
        )
    }

    /// Create an unpositioned forward tailer.
    #[must_use]
    pub fn create_tailer(&self) -> Tailer { Tailer::new(Arc::clone(&self.store)) }

    /// Index of the first record, or `NO_INDEX` when the queue is empty.
    pub fn first_index(&self) -> Result<i64> {
        match self.store.lowest_cycle_with_data()? {
            Some(cycle) => self.config.roll_cycle.to_index(cycle, 0),
            None => Ok(NO_INDEX),
        }
    }

    /// Index of the last published record, or `NO_INDEX` when the queue is
    /// empty.
    pub fn last_index(&self) -> Result<i64> {
        let mut candidate = self.store.highest_cycle_with_data()?;
        while let Some(cycle) = candidate {
            if let Some(segment) = self.store.segment_for(cycle, false)? {
                if let Some(last) = segment.last_complete_sequence()? {
                    return self.config.roll_cycle.to_index(cycle, last);
                }
            }
            candidate = self.store.previous_cycle_with_data(cycle)?;
        }
        Ok(NO_INDEX)
    }

    /// Index the next [`Appender::write`] would return if the clock does not
    /// move.
    pub fn next_index_to_write(&self) -> Result<i64> {
        let roll_cycle = self.config.roll_cycle;
        let now_cycle =
            roll_cycle.cycle_for_time(self.config.time_provider.current_time_millis());

        self.store.refresh()?;
        match self.store.highest_known_cycle() {
            Some(highest) if highest >= now_cycle => {
                let next = match self.store.segment_for(highest, false)? {
                    Some(segment) => segment.frontier()?.next_sequence,
                    None => 0,
                };
                roll_cycle.to_index(highest, next)
            }
            _ => roll_cycle.to_index(now_cycle, 0),
        }
    }

    /// Lowest cycle holding a record.
    pub fn first_cycle(&self) -> Result<Option<i64>> { self.store.lowest_cycle_with_data() }

    /// Highest cycle holding a record.
    pub fn last_cycle(&self) -> Result<Option<i64>> { self.store.highest_cycle_with_data() }

    #[must_use]
    pub fn roll_cycle(&self) -> &RollCycle { &self.config.roll_cycle }

    #[must_use]
    pub fn config(&self) -> &QueueConfig { &self.config }

    #[must_use]
    pub const fn store(&self) -> &Arc<CycleStore> { &self.store }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
