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

use crate::{FlushMode, Queue, QueueConfig, Result, RollCycle, time::TimeProvider};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            config: QueueConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.config.roll_cycle = roll_cycle;
        self
    }

    /// Start cycle 0 at `epoch_millis` rather than the Unix epoch.
    #[must_use]
    pub fn epoch(mut self, epoch_millis: i64) -> Self {
        self.config.roll_cycle = self.config.roll_cycle.with_epoch(epoch_millis);
        self
    }

    #[must_use]
    pub fn block_size(mut self, size: u64) -> Self {
        self.config.block_size = size;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn time_provider(mut self, provider: Arc<dyn TimeProvider>) -> Self {
        self.config.time_provider = provider;
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::open(self.config) }
}
