// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::waveform::IqPair;
use indexmap::IndexMap;

/// Named waveform table, optionally specialized per bus.
///
/// Resolution prefers a `(name, bus)` entry over a plain `name` entry, so a
/// readout pulse can be retuned for a single bus without touching the rest
/// of the program.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    waveforms: IndexMap<String, IqPair>,
    bus_waveforms: IndexMap<(String, String), IqPair>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_waveform<S: Into<String>>(&mut self, name: S, waveform: IqPair) {
        self.waveforms.insert(name.into(), waveform);
    }

    pub fn set_waveform_for_bus<S1: Into<String>, S2: Into<String>>(
        &mut self,
        name: S1,
        bus: S2,
        waveform: IqPair,
    ) {
        self.bus_waveforms
            .insert((name.into(), bus.into()), waveform);
    }

    pub fn resolve(&self, name: &str, bus: &str) -> Option<&IqPair> {
        self.bus_waveforms
            .get(&(name.to_string(), bus.to_string()))
            .or_else(|| self.waveforms.get(name))
    }
}
