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

//! Clock sources used by the appender to pick the cycle to write into.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use chrono::Utc;

/// Source of "now" for cycle selection.
pub trait TimeProvider: Send + Sync + fmt::Debug {
    /// Current time in Unix milliseconds.
    fn current_time_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> i64 { Utc::now().timestamp_millis() }
}

/// Manually driven clock, for replaying or simulating the passage of time.
#[derive(Debug)]
pub struct SetTimeProvider {
    millis: AtomicI64,
}

impl SetTimeProvider {
    pub const fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Starts at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self { Self::new(Utc::now().timestamp_millis()) }

    pub fn set_current_time_millis(&self, millis: i64) { self.millis.store(millis, Ordering::SeqCst); }

    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl TimeProvider for SetTimeProvider {
    fn current_time_millis(&self) -> i64 { self.millis.load(Ordering::SeqCst) }
}
