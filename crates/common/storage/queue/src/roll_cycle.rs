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

//! Roll cycle policy and the index codec built on it.
//!
//! ## Index Layout
//!
//! Every record is addressed by a single signed 64-bit index:
//!
//! ```text
//! ┌───────────────────────────────┬───────────────────────────────────┐
//! │  cycle (high bits)            │  sequence (low `sequence_bits`)   │
//! └───────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! - **cycle**: number of whole `period`s elapsed since the policy's epoch
//! - **sequence**: zero-based position of the record inside its cycle
//!
//! The split is fixed for the lifetime of a queue. Reopening a queue with a
//! policy that uses a different split is undefined behaviour.
//!
//! ## Sequence Width
//!
//! A policy also sizes the two-level index every segment carries
//! (`index_count` arrays of `index_count` entries, one entry per
//! `index_spacing` records). The sequence width is derived from those the
//! same way for every policy:
//! `max(32, 2 * log2(index_count) + log2(index_spacing))`.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use snafu::{OptionExt, ensure};

use crate::{Result, error::InvalidArgumentSnafu};

/// No data, or the position before the first record.
pub const NO_INDEX: i64 = -1;

/// Index reported by a tailer that has not been positioned yet.
pub const UNPOSITIONED_INDEX: i64 = i64::MIN;

const MINUTE_MILLIS: i64 = 60 * 1000;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// Time-bounded partitioning policy of a queue.
///
/// Maps wall-clock time to cycle numbers and packs `(cycle, sequence)` pairs
/// into indexes. Pure and `Copy`; safe to share between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollCycle {
    /// Human readable policy name.
    name:          &'static str,
    /// `chrono` format of the cycle's file label.
    format:        &'static str,
    /// Length of one cycle in milliseconds.
    period_millis: i64,
    /// Unix millis at which cycle 0 starts.
    epoch_millis:  i64,
    /// Slots in each level of a segment's index.
    index_count:   u32,
    /// Records between two index entries.
    index_spacing: u32,
    /// Low bits of an index reserved for the sequence.
    sequence_bits: u32,
}

const fn sequence_bits_for(index_count: u32, index_spacing: u32) -> u32 {
    let bits = index_count.ilog2() * 2 + index_spacing.ilog2();
    if bits > 32 { bits } else { 32 }
}

impl RollCycle {
    pub const DAILY: Self = Self::predefined("DAILY", "%Y%m%d", DAY_MILLIS, 8 << 10, 64);
    pub const HOURLY: Self = Self::predefined("HOURLY", "%Y%m%d-%H", HOUR_MILLIS, 4 << 10, 16);
    pub const HUGE_DAILY: Self =
        Self::predefined("HUGE_DAILY", "%Y%m%d", DAY_MILLIS, 512 << 10, 4096);
    pub const LARGE_DAILY: Self =
        Self::predefined("LARGE_DAILY", "%Y%m%d", DAY_MILLIS, 128 << 10, 256);
    pub const MINUTELY: Self =
        Self::predefined("MINUTELY", "%Y%m%d-%H%M", MINUTE_MILLIS, 2 << 10, 16);
    pub const SMALL_DAILY: Self = Self::predefined("SMALL_DAILY", "%Y%m%d", DAY_MILLIS, 8 << 10, 8);
    pub const TEST_DAILY: Self = Self::predefined("TEST_DAILY", "%Y%m%d", DAY_MILLIS, 8, 1);
    pub const XLARGE_DAILY: Self =
        Self::predefined("XLARGE_DAILY", "%Y%m%d", DAY_MILLIS, 256 << 10, 1024);

    const fn predefined(
        name: &'static str,
        format: &'static str,
        period_millis: i64,
        index_count: u32,
        index_spacing: u32,
    ) -> Self {
        Self {
            name,
            format,
            period_millis,
            epoch_millis: 0,
            index_count,
            index_spacing,
            sequence_bits: sequence_bits_for(index_count, index_spacing),
        }
    }

    /// Define a custom policy.
    ///
    /// `format` must render the start of a cycle uniquely at `period`
    /// granularity (it names the cycle's file). `index_count` and
    /// `index_spacing` must be powers of two.
    pub fn new(
        name: &'static str,
        format: &'static str,
        period: Duration,
        index_count: u32,
        index_spacing: u32,
    ) -> Result<Self> {
        let period_millis = i64::try_from(period.as_millis())
            .ok()
            .filter(|millis| *millis > 0)
            .context(InvalidArgumentSnafu {
                reason: format!("roll cycle period {period:?} must be at least one millisecond"),
            })?;
        ensure!(
            index_count.is_power_of_two() && index_spacing.is_power_of_two(),
            InvalidArgumentSnafu {
                reason: format!(
                    "index count {index_count} and spacing {index_spacing} must be powers of two"
                ),
            }
        );
        let sequence_bits = sequence_bits_for(index_count, index_spacing);
        ensure!(
            sequence_bits <= 62,
            InvalidArgumentSnafu {
                reason: format!("{sequence_bits} sequence bits leave no room for the cycle"),
            }
        );
        ensure!(
            !format.is_empty(),
            InvalidArgumentSnafu {
                reason: "file label format must not be empty",
            }
        );

        Ok(Self {
            name,
            format,
            period_millis,
            epoch_millis: 0,
            index_count,
            index_spacing,
            sequence_bits,
        })
    }

    /// Same policy with cycle 0 starting at `epoch_millis` instead of the
    /// Unix epoch.
    #[must_use]
    pub const fn with_epoch(mut self, epoch_millis: i64) -> Self {
        self.epoch_millis = epoch_millis;
        self
    }

    pub const fn name(&self) -> &'static str { self.name }

    pub const fn format(&self) -> &'static str { self.format }

    pub const fn period_millis(&self) -> i64 { self.period_millis }

    pub const fn epoch_millis(&self) -> i64 { self.epoch_millis }

    pub const fn index_count(&self) -> u32 { self.index_count }

    pub const fn index_spacing(&self) -> u32 { self.index_spacing }

    pub const fn sequence_bits(&self) -> u32 { self.sequence_bits }

    /// Largest sequence a single cycle can hold.
    pub const fn max_sequence(&self) -> u64 { (1u64 << self.sequence_bits) - 1 }

    /// Largest cycle an index can carry.
    pub const fn max_cycle(&self) -> i64 { i64::MAX >> self.sequence_bits }

    /// Pack `(cycle, sequence)` into an index.
    pub fn to_index(&self, cycle: i64, sequence: u64) -> Result<i64> {
        ensure!(
            (0..=self.max_cycle()).contains(&cycle),
            InvalidArgumentSnafu {
                reason: format!(
                    "cycle {cycle} outside 0..={} for {}",
                    self.max_cycle(),
                    self.name
                ),
            }
        );
        ensure!(
            sequence <= self.max_sequence(),
            InvalidArgumentSnafu {
                reason: format!(
                    "sequence {sequence} exceeds the {} bits reserved by {}",
                    self.sequence_bits, self.name
                ),
            }
        );
        #[allow(clippy::cast_possible_wrap)]
        let sequence = sequence as i64;
        Ok((cycle << self.sequence_bits) | sequence)
    }

    /// Cycle half of a non-sentinel index.
    pub const fn to_cycle(&self, index: i64) -> i64 { index >> self.sequence_bits }

    /// Sequence half of a non-sentinel index.
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_sequence(&self, index: i64) -> u64 {
        (index as u64) & self.max_sequence()
    }

    /// Cycle that `timestamp_millis` falls into. Floor division, so times
    /// before the epoch map to negative cycles.
    pub const fn cycle_for_time(&self, timestamp_millis: i64) -> i64 {
        (timestamp_millis - self.epoch_millis).div_euclid(self.period_millis)
    }

    /// Unix millis at which `cycle` begins.
    pub const fn cycle_start_millis(&self, cycle: i64) -> i64 {
        self.epoch_millis + cycle * self.period_millis
    }

    /// File label of `cycle`.
    ///
    /// The label renders `cycle * period` since the Unix epoch in UTC,
    /// independent of the policy's epoch, so that it parses back to exactly
    /// the same cycle.
    pub fn file_label(&self, cycle: i64) -> Result<String> {
        let start = cycle
            .checked_mul(self.period_millis)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .context(InvalidArgumentSnafu {
                reason: format!("cycle {cycle} cannot be rendered as a date"),
            })?;
        Ok(start.format(self.format).to_string())
    }

    /// Inverse of [`file_label`](Self::file_label). Returns `None` for labels
    /// this policy did not produce.
    pub fn parse_file_label(&self, label: &str) -> Option<i64> {
        let naive = if self.format.contains("%M") {
            NaiveDateTime::parse_from_str(label, self.format).ok()?
        } else if self.format.contains("%H") {
            let padded = format!("{label}00");
            let format = format!("{}%M", self.format);
            NaiveDateTime::parse_from_str(&padded, &format).ok()?
        } else {
            NaiveDate::parse_from_str(label, self.format)
                .ok()?
                .and_hms_opt(0, 0, 0)?
        };
        let millis = naive.and_utc().timestamp_millis();
        if millis.rem_euclid(self.period_millis) != 0 {
            return None;
        }
        let cycle = millis.div_euclid(self.period_millis);
        (cycle >= 0 && self.file_label(cycle).ok()? == label).then_some(cycle)
    }
}

impl Default for RollCycle {
    fn default() -> Self { Self::DAILY }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    #[test_case(RollCycle::MINUTELY, 32 ; "minutely")]
    #[test_case(RollCycle::HOURLY, 32 ; "hourly")]
    #[test_case(RollCycle::DAILY, 32 ; "daily")]
    #[test_case(RollCycle::TEST_DAILY, 32 ; "test daily")]
    #[test_case(RollCycle::SMALL_DAILY, 32 ; "small daily")]
    #[test_case(RollCycle::LARGE_DAILY, 42 ; "large daily")]
    #[test_case(RollCycle::XLARGE_DAILY, 46 ; "xlarge daily")]
    #[test_case(RollCycle::HUGE_DAILY, 50 ; "huge daily")]
    fn test_sequence_bits(roll_cycle: RollCycle, expected: u32) {
        assert_eq!(roll_cycle.sequence_bits(), expected);
    }

    #[test]
    fn test_index_round_trip_at_the_edges() {
        for roll_cycle in [
            RollCycle::DAILY,
            RollCycle::HOURLY,
            RollCycle::LARGE_DAILY,
            RollCycle::HUGE_DAILY,
        ] {
            let max_cycle = roll_cycle.max_cycle();
            let max_sequence = roll_cycle.max_sequence();
            for (cycle, sequence) in [
                (0, 0),
                (0, max_sequence),
                (1, 0),
                (17_000, 42),
                (max_cycle, 0),
                (max_cycle, max_sequence),
            ] {
                let index = roll_cycle.to_index(cycle, sequence).unwrap();
                assert!(index >= 0);
                assert_eq!(roll_cycle.to_cycle(index), cycle);
                assert_eq!(roll_cycle.to_sequence(index), sequence);
            }
        }
    }

    #[test]
    fn test_index_is_ordered_by_cycle_then_sequence() {
        let roll_cycle = RollCycle::DAILY;
        let a = roll_cycle.to_index(10, roll_cycle.max_sequence()).unwrap();
        let b = roll_cycle.to_index(11, 0).unwrap();
        let c = roll_cycle.to_index(11, 1).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_to_index_rejects_out_of_range() {
        let roll_cycle = RollCycle::DAILY;
        assert!(roll_cycle.to_index(-1, 0).is_err());
        assert!(roll_cycle.to_index(0, roll_cycle.max_sequence() + 1).is_err());
        assert!(roll_cycle.to_index(roll_cycle.max_cycle() + 1, 0).is_err());
    }

    #[test]
    fn test_daily_index_matches_known_layout() {
        let index = RollCycle::DAILY.to_index(0x421d, 1).unwrap();
        assert_eq!(index, 0x421d_0000_0001);
    }

    #[test]
    fn test_cycle_for_time_floors() {
        let roll_cycle = RollCycle::DAILY;
        assert_eq!(roll_cycle.cycle_for_time(0), 0);
        assert_eq!(roll_cycle.cycle_for_time(DAY_MILLIS - 1), 0);
        assert_eq!(roll_cycle.cycle_for_time(DAY_MILLIS), 1);
        assert_eq!(roll_cycle.cycle_for_time(-1), -1);

        let shifted = RollCycle::DAILY.with_epoch(HOUR_MILLIS);
        assert_eq!(shifted.cycle_for_time(DAY_MILLIS), 0);
        assert_eq!(shifted.cycle_for_time(DAY_MILLIS + HOUR_MILLIS), 1);
        assert_eq!(shifted.cycle_start_millis(1), DAY_MILLIS + HOUR_MILLIS);
    }

    #[test_case(RollCycle::DAILY, "20260114" ; "daily")]
    #[test_case(RollCycle::HOURLY, "20260114-13" ; "hourly")]
    #[test_case(RollCycle::MINUTELY, "20260114-1307" ; "minutely")]
    fn test_file_label_round_trip(roll_cycle: RollCycle, expected: &str) {
        let time = Utc.with_ymd_and_hms(2026, 1, 14, 13, 7, 45).unwrap();
        let cycle = roll_cycle.cycle_for_time(time.timestamp_millis());

        let label = roll_cycle.file_label(cycle).unwrap();
        assert_eq!(label, expected);
        assert_eq!(roll_cycle.parse_file_label(&label), Some(cycle));
    }

    #[test]
    fn test_parse_file_label_rejects_foreign_names() {
        assert_eq!(RollCycle::DAILY.parse_file_label("not-a-date"), None);
        assert_eq!(RollCycle::DAILY.parse_file_label("20260114-13"), None);
        assert_eq!(RollCycle::HOURLY.parse_file_label("20260114"), None);
    }

    #[test]
    fn test_custom_roll_cycle_validation() {
        let ok = RollCycle::new("TWO_HOURLY", "%Y%m%d-%H", Duration::from_secs(7200), 64, 4);
        assert_eq!(ok.unwrap().period_millis(), 7_200_000);

        assert!(RollCycle::new("ZERO", "%Y%m%d", Duration::ZERO, 64, 4).is_err());
        assert!(RollCycle::new("ODD", "%Y%m%d", Duration::from_secs(60), 63, 4).is_err());
        assert!(RollCycle::new("EMPTY", "", Duration::from_secs(60), 64, 4).is_err());
    }
}
