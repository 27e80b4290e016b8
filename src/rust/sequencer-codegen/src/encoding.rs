// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Fixed-point encodings of the target instruction set.
//!
//! These constants must be reproduced bit-exactly; the instrument decodes
//! immediates with the inverse scalings and any deviation shifts every
//! pulse on the device.

use qprogram_ir::Domain;
use std::f64::consts::TAU;

/// Full scale of the signed gain/offset immediates, mapping `[-1.0, 1.0]`.
pub const GAIN_FULL_SCALE: f64 = 32767.0;
/// Phase units per full turn.
pub const PHASE_UNITS_PER_TURN: f64 = 1e9;
/// Frequency units per Hz (immediates are steps of 0.25 Hz).
pub const FREQUENCY_UNITS_PER_HZ: f64 = 4.0;

/// `[-1.0, 1.0]` → `[-32767, 32767]`, clamped.
pub fn gain_to_fixed(value: f64) -> i64 {
    (value.clamp(-1.0, 1.0) * GAIN_FULL_SCALE).round() as i64
}

/// Radians → `[0, 1e9)` phase units, wrapping into one turn.
pub fn phase_to_fixed(radians: f64) -> i64 {
    let wrapped = radians.rem_euclid(TAU);
    let units = (wrapped * PHASE_UNITS_PER_TURN / TAU).round() as i64;
    // A phase epsilon below 2π may round up to a full turn.
    units % PHASE_UNITS_PER_TURN as i64
}

/// Hz → frequency units.
pub fn frequency_to_fixed(hz: f64) -> i64 {
    (hz * FREQUENCY_UNITS_PER_HZ).round() as i64
}

/// Signed value → the raw 32-bit word a register immediate encodes.
pub fn to_register_word(value: i64) -> u32 {
    value as i32 as u32
}

/// Per-step register increment for a swept variable, in the domain's
/// fixed-point encoding.
pub fn encode_in_domain(domain: Domain, value: f64) -> i64 {
    match domain {
        Domain::Time => value.round() as i64,
        Domain::Frequency => frequency_to_fixed(value),
        Domain::Phase => (value * PHASE_UNITS_PER_TURN / TAU).round() as i64,
        Domain::Voltage => gain_to_fixed(value),
        Domain::Scalar => value.round() as i64,
    }
}
