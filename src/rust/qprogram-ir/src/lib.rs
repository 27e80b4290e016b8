// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub mod block;
pub mod calibration;
pub mod operation;
pub mod variable;
pub mod waveform;

pub use block::{Block, BlockKind, Element, ForLoop};
pub use calibration::Calibration;
pub use operation::Operation;
pub use variable::{Domain, Value, Variable, VariableId};
pub use waveform::{Envelope, IqPair, WaveformSource};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
