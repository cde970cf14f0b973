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

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use tracing::debug;
use uuid::Uuid;

use crate::{Result, RollCycle};

/// Extension of segment files.
pub const SEGMENT_FILE_EXTENSION: &str = "cq";

/// Generates a segment file name: `<label>.cq`, e.g. `20260114.cq`.
pub fn segment_file_name(roll_cycle: &RollCycle, cycle: i64) -> Result<String> {
    Ok(format!(
        "{}.{SEGMENT_FILE_EXTENSION}",
        roll_cycle.file_label(cycle)?
    ))
}

/// Returns the full path of the segment file for `cycle`.
pub fn segment_file_path<P: AsRef<Path>>(
    base: P,
    roll_cycle: &RollCycle,
    cycle: i64,
) -> Result<PathBuf> {
    Ok(base.as_ref().join(segment_file_name(roll_cycle, cycle)?))
}

/// Unique scratch path next to `target`, used to build a segment before
/// publishing it under its real name.
pub fn temp_segment_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    target.with_file_name(name)
}

/// Lists the cycles that have a segment file under `base`.
///
/// Files whose names this roll cycle did not produce are skipped, including
/// in-flight temporaries.
pub fn scan_cycles<P: AsRef<Path>>(base: P, roll_cycle: &RollCycle) -> Result<BTreeSet<i64>> {
    let base = base.as_ref();
    let mut cycles = BTreeSet::new();

    if !base.exists() {
        return Ok(cycles);
    }

    for entry in std::fs::read_dir(base)? {
        let path = entry?.path();

        if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_FILE_EXTENSION) {
            continue;
        }

        let Some(label) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        match roll_cycle.parse_file_label(label) {
            Some(cycle) => {
                cycles.insert(cycle);
            }
            None => debug!(path = ?path, "Skipping file not named by this roll cycle"),
        }
    }

    Ok(cycles)
}
