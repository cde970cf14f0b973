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

//! Frame checksums (CRC-32, IEEE polynomial, via crc32fast).
//!
//! The checksum covers the payload length as well as the payload, so a
//! reader that observes a published header with a stale length is caught.

use crc32fast::Hasher;

#[inline]
pub(crate) fn frame_crc(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[inline]
pub(crate) fn verify_frame_crc(length: u32, payload: &[u8], expected: u32) -> bool {
    frame_crc(length, payload) == expected
}
