// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::encoding::encode_in_domain;
use crate::{Error, Result};
use qprogram_ir::ForLoop;

/// Tolerance absorbing floating-point rounding at exact range boundaries,
/// e.g. `(1, 2.05, 0.1)` where the division lands a hair under 10.5.
const RANGE_EPSILON: f64 = 1e-9;

/// Number of iterations of an inclusive `(start, stop, step)` range.
///
/// Valid for positive and negative steps. A zero step, or a step pointing
/// away from `stop`, is an [`Error::InvalidRange`].
pub fn iterations(start: f64, stop: f64, step: f64) -> Result<u64> {
    if step == 0.0 {
        return Err(Error::InvalidRange);
    }
    let count = ((stop - start) / step + RANGE_EPSILON).floor();
    if count < 0.0 {
        return Err(Error::InvalidRange);
    }
    Ok(count as u64 + 1)
}

/// A for-loop lowered onto the register file: an iteration count plus the
/// start value and per-step increment in the variable's fixed-point
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredRange {
    pub iterations: u64,
    pub start: i64,
    pub step: i64,
}

pub fn lower_range(for_loop: &ForLoop) -> Result<LoweredRange> {
    let iterations = iterations(for_loop.start, for_loop.stop, for_loop.step)?;
    let domain = for_loop.variable.domain;
    Ok(LoweredRange {
        iterations,
        start: encode_in_domain(domain, for_loop.start),
        step: encode_in_domain(domain, for_loop.step),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qprogram_ir::{Domain, Variable};

    #[test]
    fn test_iterations() {
        assert_eq!(iterations(0.0, 10.0, 1.0).unwrap(), 11);
        assert_eq!(iterations(10.0, 0.0, -1.0).unwrap(), 11);
        assert_eq!(iterations(1.0, 2.05, 0.1).unwrap(), 11);
        assert_eq!(iterations(0.0, 0.0, 1.0).unwrap(), 1);
        assert_eq!(iterations(0.0, 9.5, 1.0).unwrap(), 10);
    }

    #[test]
    fn test_zero_step_is_invalid() {
        assert!(matches!(
            iterations(0.0, 10.0, 0.0),
            Err(Error::InvalidRange)
        ));
    }

    #[test]
    fn test_step_away_from_stop_is_invalid() {
        assert!(matches!(
            iterations(0.0, 10.0, -1.0),
            Err(Error::InvalidRange)
        ));
        assert!(matches!(
            iterations(10.0, 0.0, 1.0),
            Err(Error::InvalidRange)
        ));
    }

    #[test]
    fn test_lower_range_voltage() {
        let for_loop = ForLoop::new(Variable::new(0, "amp", Domain::Voltage), 0.0, 1.0, 0.1);
        let lowered = lower_range(&for_loop).unwrap();
        assert_eq!(lowered.iterations, 11);
        assert_eq!(lowered.start, 0);
        assert_eq!(lowered.step, 3277);
    }

    #[test]
    fn test_lower_range_negative_time_step() {
        let for_loop = ForLoop::new(Variable::new(1, "t", Domain::Time), 100.0, 4.0, -4.0);
        let lowered = lower_range(&for_loop).unwrap();
        assert_eq!(lowered.iterations, 25);
        assert_eq!(lowered.start, 100);
        assert_eq!(lowered.step, -4);
    }
}
