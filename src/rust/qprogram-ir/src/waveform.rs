// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Waveform envelopes and I/Q pairs.
//!
//! Envelopes are realized at 1 GS/s, so one sample corresponds to one
//! nanosecond and the sample count equals the duration in grid time units.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Square {
        amplitude: f64,
        duration: u64,
    },
    Ramp {
        from: f64,
        to: f64,
        duration: u64,
    },
    Gaussian {
        amplitude: f64,
        duration: u64,
        num_sigmas: f64,
    },
    Arbitrary {
        samples: Vec<f64>,
    },
    /// Envelope whose samples depend on a symbolic variable.
    ///
    /// The target format has no way to express sample-level parametrization;
    /// the compiler logs and skips plays that reference one.
    Parametric {
        variable: crate::variable::VariableId,
        duration: u64,
    },
}

impl Envelope {
    pub fn duration(&self) -> u64 {
        match self {
            Envelope::Square { duration, .. } => *duration,
            Envelope::Ramp { duration, .. } => *duration,
            Envelope::Gaussian { duration, .. } => *duration,
            Envelope::Arbitrary { samples } => samples.len() as u64,
            Envelope::Parametric { duration, .. } => *duration,
        }
    }

    /// Whether the envelope's samples depend on a symbolic variable.
    pub fn is_parametric(&self) -> bool {
        matches!(self, Envelope::Parametric { .. })
    }

    pub fn samples(&self) -> Vec<f64> {
        match self {
            Envelope::Square {
                amplitude,
                duration,
            } => vec![*amplitude; *duration as usize],
            Envelope::Ramp { from, to, duration } => {
                let n = *duration as usize;
                if n <= 1 {
                    return vec![*from; n];
                }
                (0..n)
                    .map(|i| from + (to - from) * i as f64 / (n - 1) as f64)
                    .collect()
            }
            Envelope::Gaussian {
                amplitude,
                duration,
                num_sigmas,
            } => {
                let n = *duration as usize;
                let sigma = *duration as f64 / num_sigmas;
                let mu = *duration as f64 / 2.0;
                (0..n)
                    .map(|i| {
                        let x = (i as f64 - mu) / sigma;
                        amplitude * (-0.5 * x * x).exp()
                    })
                    .collect()
            }
            Envelope::Arbitrary { samples } => samples.clone(),
            // Not realizable; callers must check `is_parametric` first.
            Envelope::Parametric { .. } => Vec::new(),
        }
    }

}

/// A waveform as played on one bus: an in-phase and a quadrature envelope
/// of equal duration.
#[derive(Debug, Clone, PartialEq)]
pub struct IqPair {
    pub i: Envelope,
    pub q: Envelope,
}

impl IqPair {
    /// Build a pair, rejecting mismatched component lengths.
    pub fn new(i: Envelope, q: Envelope) -> Result<Self> {
        if i.duration() != q.duration() {
            return Err(Error::new(&format!(
                "I/Q components differ in length: {} vs {}",
                i.duration(),
                q.duration()
            )));
        }
        Ok(IqPair { i, q })
    }

    /// A square pulse on I with a zeroed Q component.
    pub fn square(amplitude: f64, duration: u64) -> Self {
        IqPair {
            i: Envelope::Square {
                amplitude,
                duration,
            },
            q: Envelope::Square {
                amplitude: 0.0,
                duration,
            },
        }
    }

    pub fn duration(&self) -> u64 {
        self.i.duration()
    }
}

/// Reference to a waveform in a play or acquire operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveformSource {
    /// Content supplied inline with the operation.
    Inline(IqPair),
    /// Name resolved through the calibration table at compile time.
    Named(String),
}

impl From<IqPair> for WaveformSource {
    fn from(pair: IqPair) -> Self {
        WaveformSource::Inline(pair)
    }
}
