// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Module for defining settings for the compiler.

use crate::timegrid::ceil_to_grid;
use crate::{Error, Result, Ticks};

#[derive(Debug, Clone)]
pub struct SanitizationChange {
    pub field: &'static str,
    pub original: String,
    pub sanitized: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CompilerSettings {
    /// Smallest time step of the instruction set, in nanoseconds.
    pub grid_quantum: Ticks,
    /// Largest usable single-wait immediate.
    pub max_wait_immediate: Ticks,
    /// Top of the wait-immediate encoding; values in
    /// `(max_wait_immediate, wait_immediate_ceiling]` are reserved and must
    /// never be emitted verbatim.
    pub wait_immediate_ceiling: Ticks,
    /// Number of general-purpose registers per sequencer core.
    pub register_pool_size: u8,
    /// Waveform memory available per bus, in samples.
    pub waveform_memory_budget: usize,
    /// Largest table index usable on the device, exclusive.
    pub table_index_ceiling: u32,
    /// Constant-amplitude runs at least this long are substituted by a
    /// short waveform plus a hardware repeat loop.
    pub square_loop_min_length: Ticks,
    /// Length of the repeated chunk of such a substitution.
    pub square_chunk_length: Ticks,
    /// Upper bound on the duration of one repetition per bus.
    pub repetition_period: Option<Ticks>,
    /// Reject block trees nested deeper than this.
    pub max_block_depth: usize,
    pub emit_timing_comments: bool,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        CompilerSettings {
            grid_quantum: 4,
            max_wait_immediate: 65532,
            wait_immediate_ceiling: 65535,
            register_pool_size: 64,
            waveform_memory_budget: 16384,
            table_index_ceiling: 1024,
            square_loop_min_length: 1000,
            square_chunk_length: 100,
            repetition_period: None,
            max_block_depth: 64,
            emit_timing_comments: false,
        }
    }
}

impl CompilerSettings {
    /// Grid-align the tunable lengths, reporting every change made.
    ///
    /// The wait ceiling geometry is not negotiable; misconfiguring it is an
    /// error rather than something to silently repair.
    pub fn sanitize(&mut self) -> Result<Vec<SanitizationChange>> {
        if self.grid_quantum == 0 {
            return Err(Error::new("Grid quantum must be non-zero"));
        }
        if self.max_wait_immediate % self.grid_quantum != 0
            || self.max_wait_immediate == 0
            || self.max_wait_immediate > self.wait_immediate_ceiling
        {
            return Err(Error::new(
                "Maximum wait immediate must be a non-zero grid multiple below the encoding ceiling",
            ));
        }
        let mut changes = vec![];
        let grid = self.grid_quantum;
        let fields = [
            (
                "square_loop_min_length",
                &mut self.square_loop_min_length,
            ),
            ("square_chunk_length", &mut self.square_chunk_length),
        ];
        for (field, value) in fields {
            let sanitized = ceil_to_grid((*value).max(grid), grid);
            if sanitized != *value {
                changes.push(SanitizationChange {
                    field,
                    original: value.to_string(),
                    sanitized: sanitized.to_string(),
                    reason: format!("Not a multiple of {grid}."),
                });
                *value = sanitized;
            }
        }
        Ok(changes)
    }
}
