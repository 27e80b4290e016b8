// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::Ticks;
use std::fmt;

type LabelInternal = String;

/// One of the sequencer's general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u8);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Instruction operand: a literal immediate or a register holding the value.
///
/// Immediates are the raw 32-bit words the instruction encodes; signed
/// quantities must already be in two's complement.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Immediate(u32),
    Register(Register),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Immediate(value) => write!(f, "{value}"),
            Operand::Register(register) => write!(f, "{register}"),
        }
    }
}

impl From<u32> for Operand {
    fn from(value: u32) -> Self {
        Operand::Immediate(value)
    }
}

impl From<Register> for Operand {
    fn from(register: Register) -> Self {
        Operand::Register(register)
    }
}

/// The sequencer instruction set used by the compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Block until all cores have reached their synchronization point.
    WaitSync { duration: Ticks },
    /// Apply latched parameter updates and advance time.
    UpdParam { duration: Ticks },
    SetMrk { mask: u8 },
    SetFreq { frequency: Operand },
    SetPh { phase: Operand },
    ResetPh,
    SetAwgGain { gain_i: Operand, gain_q: Operand },
    SetAwgOffs { offset_i: Operand, offset_q: Operand },
    Play {
        wave_i: u32,
        wave_q: u32,
        duration: Ticks,
    },
    Acquire {
        acquisition: u32,
        bin: Operand,
        duration: Ticks,
    },
    AcquireWeighed {
        acquisition: u32,
        bin: Operand,
        weight_i: Operand,
        weight_q: Operand,
        duration: Ticks,
    },
    Wait { duration: Ticks },
    /// Wait for the duration held in a register; the value is only known
    /// at runtime.
    WaitReg { register: Register },
    Move {
        source: Operand,
        destination: Register,
    },
    Add {
        origin: Register,
        value: Operand,
        destination: Register,
    },
    /// Decrement the register and jump to the label while it is non-zero.
    Loop {
        register: Register,
        label: LabelInternal,
    },
    Jmp { label: LabelInternal },
    Jlt {
        register: Register,
        value: u32,
        label: LabelInternal,
    },
    Jge {
        register: Register,
        value: u32,
        label: LabelInternal,
    },
    Nop,
    Stop,
}

impl Instruction {
    /// The label this instruction jumps to, if any.
    pub fn jump_target(&self) -> Option<&str> {
        match self {
            Instruction::Loop { label, .. }
            | Instruction::Jmp { label }
            | Instruction::Jlt { label, .. }
            | Instruction::Jge { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Time the instruction occupies on the real-time timeline.
    pub fn duration(&self) -> Ticks {
        match self {
            Instruction::WaitSync { duration }
            | Instruction::UpdParam { duration }
            | Instruction::Play { duration, .. }
            | Instruction::Acquire { duration, .. }
            | Instruction::AcquireWeighed { duration, .. }
            | Instruction::Wait { duration } => *duration,
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::WaitSync { duration } => write!(f, "wait_sync        {duration}"),
            Instruction::UpdParam { duration } => write!(f, "upd_param        {duration}"),
            Instruction::SetMrk { mask } => write!(f, "set_mrk          {mask}"),
            Instruction::SetFreq { frequency } => write!(f, "set_freq         {frequency}"),
            Instruction::SetPh { phase } => write!(f, "set_ph           {phase}"),
            Instruction::ResetPh => write!(f, "reset_ph"),
            Instruction::SetAwgGain { gain_i, gain_q } => {
                write!(f, "set_awg_gain     {gain_i}, {gain_q}")
            }
            Instruction::SetAwgOffs { offset_i, offset_q } => {
                write!(f, "set_awg_offs     {offset_i}, {offset_q}")
            }
            Instruction::Play {
                wave_i,
                wave_q,
                duration,
            } => write!(f, "play             {wave_i}, {wave_q}, {duration}"),
            Instruction::Acquire {
                acquisition,
                bin,
                duration,
            } => write!(f, "acquire          {acquisition}, {bin}, {duration}"),
            Instruction::AcquireWeighed {
                acquisition,
                bin,
                weight_i,
                weight_q,
                duration,
            } => write!(
                f,
                "acquire_weighed  {acquisition}, {bin}, {weight_i}, {weight_q}, {duration}"
            ),
            Instruction::Wait { duration } => write!(f, "wait             {duration}"),
            Instruction::WaitReg { register } => write!(f, "wait             {register}"),
            Instruction::Move {
                source,
                destination,
            } => write!(f, "move             {source}, {destination}"),
            Instruction::Add {
                origin,
                value,
                destination,
            } => write!(f, "add              {origin}, {value}, {destination}"),
            Instruction::Loop { register, label } => {
                write!(f, "loop             {register}, @{label}")
            }
            Instruction::Jmp { label } => write!(f, "jmp              @{label}"),
            Instruction::Jlt {
                register,
                value,
                label,
            } => write!(f, "jlt              {register}, {value}, @{label}"),
            Instruction::Jge {
                register,
                value,
                label,
            } => write!(f, "jge              {register}, {value}, @{label}"),
            Instruction::Nop => write!(f, "nop"),
            Instruction::Stop => write!(f, "stop"),
        }
    }
}
