// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub type VariableId = u32;

/// Physical domain of a symbolic variable.
///
/// The domain determines the fixed-point encoding applied to the variable
/// when it is lowered onto a hardware register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Durations, in nanoseconds.
    Time,
    /// Oscillator frequency, in Hz.
    Frequency,
    /// Oscillator phase, in radians.
    Phase,
    /// Gain or offset, dimensionless in `[-1.0, 1.0]`.
    Voltage,
    /// Plain number without a unit.
    Scalar,
}

/// A symbolic placeholder declared once and bound to exactly one register
/// for its entire lifetime within the innermost loop that iterates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: VariableId,
    pub name: String,
    pub domain: Domain,
}

impl Variable {
    pub fn new<S: Into<String>>(id: VariableId, name: S, domain: Domain) -> Self {
        Variable {
            id,
            name: name.into(),
            domain,
        }
    }
}

/// An operand of an operation: either a literal or a reference to a
/// loop variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Literal(f64),
    Variable(VariableId),
}

impl Value {
    pub fn literal(&self) -> Option<f64> {
        match self {
            Value::Literal(value) => Some(*value),
            Value::Variable(_) => None,
        }
    }

    pub fn variable(&self) -> Option<VariableId> {
        match self {
            Value::Literal(_) => None,
            Value::Variable(id) => Some(*id),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Value::Variable(_))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Literal(value)
    }
}

impl From<&Variable> for Value {
    fn from(variable: &Variable) -> Self {
        Value::Variable(variable.id)
    }
}
