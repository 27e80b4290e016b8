// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub mod compiler;
pub mod context;
pub mod encoding;
pub mod fanout;
pub mod latched;
pub mod looprange;
pub mod registers;
pub mod result;
pub mod settings;
pub mod timegrid;
pub mod timing;
pub mod wavetable;

pub use compiler::compile;
pub use context::BusConfig;
pub use result::CompiledProgram;
pub use settings::CompilerSettings;

/// Cumulative time in grid time units (nanoseconds).
pub type Ticks = u64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Loop step must be non-zero and point from start towards stop")]
    InvalidRange,
    #[error("I/Q waveform components differ in length: {i} vs {q}")]
    WaveformShapeMismatch { i: u64, q: u64 },
    #[error("I/Q integration weights differ in length: {i} vs {q}")]
    WeightsLengthMismatch { i: u64, q: u64 },
    #[error("Dynamic syncing is not implemented")]
    UnsupportedDynamicSync,
    #[error(
        "Bus '{bus}' takes {duration} ns per repetition, exceeding the repetition period of {period} ns"
    )]
    DurationExceedsPeriod {
        bus: String,
        duration: Ticks,
        period: Ticks,
    },
    #[error("Register pool of {pool} registers exhausted")]
    RegisterExhausted { pool: usize },
    #[error("Table overflow on bus '{bus}': {reason}")]
    TableOverflow { bus: String, reason: String },
    #[error(transparent)]
    Asm(#[from] sequencer_asm::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
