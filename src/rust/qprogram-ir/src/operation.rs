// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::variable::Value;
use crate::waveform::WaveformSource;

pub type BusName = String;

/// Timed operations of the program.
///
/// Every operation is bound to exactly one bus, except [`Operation::Sync`]
/// which is global (or scoped to an explicit subset of buses).
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Play a waveform. `wait_time` overrides the time credited to the
    /// play; by default the waveform duration is used.
    Play {
        bus: BusName,
        waveform: WaveformSource,
        wait_time: Option<u64>,
    },
    Wait {
        bus: BusName,
        duration: Value,
    },
    /// Open an acquisition window integrating with the given weights.
    Acquire {
        bus: BusName,
        weights: WaveformSource,
    },
    /// Play a readout pulse and acquire after the bus's time of flight.
    Measure {
        bus: BusName,
        waveform: WaveformSource,
        weights: WaveformSource,
    },
    SetFrequency {
        bus: BusName,
        frequency: Value,
    },
    SetPhase {
        bus: BusName,
        phase: Value,
    },
    ResetPhase {
        bus: BusName,
    },
    SetGain {
        bus: BusName,
        gain: Value,
    },
    SetOffset {
        bus: BusName,
        offset_i: Value,
        offset_q: Value,
    },
    /// Drive the sequencer marker outputs.
    SetMarkers {
        bus: BusName,
        mask: u8,
    },
    /// Align the timelines of the listed buses (all buses when `None`).
    Sync {
        buses: Option<Vec<BusName>>,
    },
}

impl Operation {
    /// The bus the operation is bound to. `None` for [`Operation::Sync`].
    pub fn bus(&self) -> Option<&str> {
        match self {
            Operation::Play { bus, .. }
            | Operation::Wait { bus, .. }
            | Operation::Acquire { bus, .. }
            | Operation::Measure { bus, .. }
            | Operation::SetFrequency { bus, .. }
            | Operation::SetPhase { bus, .. }
            | Operation::ResetPhase { bus }
            | Operation::SetGain { bus, .. }
            | Operation::SetOffset { bus, .. }
            | Operation::SetMarkers { bus, .. } => Some(bus),
            Operation::Sync { .. } => None,
        }
    }

    /// Whether the operation is one of the latched parameter sets that only
    /// take effect at the next timing-update event.
    pub fn is_latched_set(&self) -> bool {
        matches!(
            self,
            Operation::SetFrequency { .. }
                | Operation::SetPhase { .. }
                | Operation::SetGain { .. }
                | Operation::SetOffset { .. }
                | Operation::SetMarkers { .. }
        )
    }
}
