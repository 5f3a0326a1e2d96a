// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of memory ranges hidden from self-enumeration.
//!
//! The C-module compiler registers each executable range it creates so that
//! memory scanners cooperating with this registry can skip instrumentation
//! artifacts; ranges are unregistered when the owning module is dropped.

use crate::memory::MemoryRange;
use std::sync::Mutex;

static CLOAKED_RANGES: Mutex<Vec<MemoryRange>> = Mutex::new(Vec::new());

fn ranges() -> std::sync::MutexGuard<'static, Vec<MemoryRange>> {
    CLOAKED_RANGES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers `range` as hidden. Registering the same range twice is allowed
/// and requires a matching number of removals.
pub fn add_range(range: MemoryRange) {
    ranges().push(range);
}

/// Unregisters one previous registration of `range`. Unknown ranges are
/// ignored.
pub fn remove_range(range: &MemoryRange) {
    let mut ranges = ranges();
    if let Some(index) = ranges.iter().position(|r| r == range) {
        ranges.swap_remove(index);
    }
}

/// Reports whether `address` falls inside any registered range.
pub fn is_cloaked(address: usize) -> bool {
    ranges().iter().any(|r| r.contains(address))
}

/// Returns a snapshot of the registered ranges.
pub fn cloaked_ranges() -> Vec<MemoryRange> {
    ranges().clone()
}
