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

use std::{path::PathBuf, sync::Arc};

use snafu::ensure;

use crate::{
    Result, RollCycle,
    error::InvalidArgumentSnafu,
    frame::frame_size,
    segment::data_start_for,
    time::{SystemTimeProvider, TimeProvider},
};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding one segment file per cycle.
    pub base_path:     PathBuf,
    /// Cycle length, index split and file naming. Fixed for the queue's
    /// lifetime.
    pub roll_cycle:    RollCycle,
    /// Size a segment file is pre-allocated to, and the step it grows by
    /// when a record does not fit.
    pub block_size:    u64,
    pub flush_mode:    FlushMode,
    /// Clock the appender consults to pick its cycle.
    pub time_provider: Arc<dyn TimeProvider>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_path:     PathBuf::from("./queue_data"),
            roll_cycle:    RollCycle::DAILY,
            block_size:    64 * 1024 * 1024,
            flush_mode:    FlushMode::Async,
            time_provider: Arc::new(SystemTimeProvider),
        }
    }
}

impl QueueConfig {
    /// Reject configurations whose segments could not hold a single record.
    pub fn validate(&self) -> Result<()> {
        let data_start = data_start_for(&self.roll_cycle);
        let smallest_segment = data_start + frame_size(0);
        ensure!(
            self.block_size >= smallest_segment,
            InvalidArgumentSnafu {
                reason: format!(
                    "block size {} cannot hold the {} roll cycle's header and index ({} bytes)",
                    self.block_size,
                    self.roll_cycle.name(),
                    smallest_segment
                ),
            }
        );
        ensure!(
            self.roll_cycle.epoch_millis() >= 0,
            InvalidArgumentSnafu {
                reason: format!(
                    "epoch {} must not precede the Unix epoch",
                    self.roll_cycle.epoch_millis()
                ),
            }
        );
        if let FlushMode::Batch { bytes } = self.flush_mode {
            ensure!(
                bytes > 0,
                InvalidArgumentSnafu {
                    reason: "batch flush threshold must be positive",
                }
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Leave write-back to the OS; segments are flushed on roll and drop.
    Async,
    /// Flush each frame's byte range right after it is published.
    Sync,
    /// Flush once this many bytes have been appended since the last flush.
    Batch { bytes: u64 },
}
