// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;

use crate::settings::CompilerSettings;
use crate::{Error, Result};
use qprogram_ir::Calibration;
use qprogram_ir::operation::BusName;

/// Static per-bus hardware configuration.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    /// Identifier of the sequencer core driving this bus.
    pub sequencer: String,
    /// Static line delay compensated with a wait right after the preamble,
    /// in nanoseconds.
    pub delay: u64,
    /// Round-trip latency between the start of a readout pulse and the
    /// earliest meaningful acquisition, in nanoseconds.
    pub time_of_flight: u64,
    /// Marker mask asserted for the whole program run.
    pub init_markers: u8,
}

impl BusConfig {
    pub fn new(sequencer: impl Into<String>) -> Self {
        BusConfig {
            sequencer: sequencer.into(),
            ..Default::default()
        }
    }
}

/// Everything one compilation run needs, created fresh per call so that
/// concurrent compilations cannot observe each other.
pub(crate) struct CompileContext<'a> {
    // Configuration
    pub buses: &'a IndexMap<BusName, BusConfig>,

    // Resources
    pub calibration: &'a Calibration,

    // Settings, sanitized.
    pub settings: CompilerSettings,
}

impl<'a> CompileContext<'a> {
    pub(crate) fn config_for(&self, bus: &str) -> Result<&'a BusConfig> {
        self.buses
            .get(bus)
            .ok_or_else(|| Error::new(&format!("No configuration for bus '{bus}'")))
    }
}
