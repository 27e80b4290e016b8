// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Scheduling of latched parameter updates.
//!
//! Gain, offset, phase, frequency and marker sets are buffered by the
//! hardware and only take effect at the next timing-update event: a play,
//! an acquire, or an explicit `upd_param`. The tracker batches pending
//! sets; a timed instruction absorbs the whole batch for free, anything
//! else that needs the values applied first forces exactly one minimal
//! `upd_param`.

use crate::settings::CompilerSettings;
use crate::Ticks;
use sequencer_asm::{AsmGenerator, Instruction};

#[derive(Debug, Default)]
pub struct LatchedTracker {
    pending: usize,
}

impl LatchedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a latched set instruction that was just emitted.
    pub fn note_set(&mut self) {
        self.pending += 1;
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    /// A play or acquire carries the batch along with its own timing slot.
    pub fn absorb_into_timed(&mut self) {
        self.pending = 0;
    }

    /// Force the pending batch to take effect now.
    ///
    /// Emits at most one minimal-duration `upd_param` regardless of how
    /// many sets are pending, and returns the time it occupies.
    pub fn flush(&mut self, generator: &mut AsmGenerator, settings: &CompilerSettings) -> Ticks {
        if self.pending == 0 {
            return 0;
        }
        self.pending = 0;
        let duration = settings.grid_quantum;
        generator.add(Instruction::UpdParam {
            duration: duration as u32,
        });
        duration
    }
}
