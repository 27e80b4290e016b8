// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::Ticks;

pub fn floor_to_grid(value: Ticks, grid: Ticks) -> Ticks {
    value - value % grid
}

pub fn ceil_to_grid(value: Ticks, grid: Ticks) -> Ticks {
    value + (grid - (value % grid)) % grid
}

/// Convert a requested duration in nanoseconds to instruction ticks.
///
/// Durations are rounded up to the grid quantum; the minimum non-zero
/// duration is one grid quantum.
pub fn duration_to_ticks(nanoseconds: f64, grid: Ticks) -> Ticks {
    let rounded = nanoseconds.round().max(0.0) as Ticks;
    if rounded == 0 {
        return 0;
    }
    ceil_to_grid(rounded.max(grid), grid)
}
