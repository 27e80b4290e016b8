// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;
use serde::Serialize;

use crate::Ticks;
use crate::wavetable::{AcquisitionEntry, WaveformEntry};
use sequencer_asm::AsmGenerator;

/// Everything one sequencer core needs to run its share of the program.
#[derive(Debug, Serialize)]
pub struct CompiledProgram {
    /// Identifier of the sequencer core this program targets.
    pub sequencer: String,
    /// Rendered assembly text.
    pub program: String,
    /// The instruction list the text was rendered from.
    #[serde(skip)]
    pub instructions: AsmGenerator,
    pub waveforms: IndexMap<String, WaveformEntry>,
    pub weights: IndexMap<String, WaveformEntry>,
    pub acquisitions: IndexMap<String, AcquisitionEntry>,
    /// Statically known wall-clock duration of one run, in nanoseconds.
    /// A lower bound when `dynamic` is set.
    pub duration: Ticks,
    /// Whether any wait depends on a runtime register value.
    pub dynamic: bool,
}
