// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub mod generator;
pub mod instructions;

pub use generator::AsmGenerator;
pub use instructions::{Instruction, Operand, Register};

/// Time in sequencer grid units (nanoseconds on the 1 GS/s cores).
pub type Ticks = u32;

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
