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

//! Persistent, memory-mapped queue partitioned into time-based cycles.
//!
//! Every record is addressed by a 64-bit index packing the cycle it was
//! written in and its sequence within that cycle. Each cycle lives in its own
//! segment file, grown block by block and shared through the page cache
//! between an appender and any number of tailers, in this process or others.

mod appender;
mod builder;
mod config;
mod crc;
mod cycle_store;
pub mod error;
mod file;
mod frame;
pub mod path;
mod queue;
mod roll_cycle;
pub mod segment;
mod tailer;
pub mod time;

pub use appender::Appender;
pub use builder::QueueBuilder;
pub use config::{FlushMode, QueueConfig};
pub use cycle_store::{CycleStore, MAX_MAPPED_SEGMENTS, REFRESH_INTERVAL};
pub use error::{QueueError, Result};
pub use frame::{Excerpt, MAX_PAYLOAD_LEN};
pub use queue::Queue;
pub use roll_cycle::{NO_INDEX, RollCycle, UNPOSITIONED_INDEX};
pub use segment::{Frame, FramePosition, FrameRead, Frontier, Segment};
pub use tailer::{ReadStatus, Tailer, TailerDirection, TailerState};
pub use time::{SetTimeProvider, SystemTimeProvider, TimeProvider};
