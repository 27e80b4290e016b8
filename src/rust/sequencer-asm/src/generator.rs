// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::instructions::Instruction;
use crate::{Result, Ticks};
use anyhow::anyhow;
use indexmap::IndexMap;

fn format_comment(comment: &Option<String>) -> String {
    if let Some(comment) = comment {
        if !comment.is_empty() {
            return format!("  # {comment}");
        }
    }
    String::new()
}

/// One rendered line: an optional label, the instruction and an optional
/// trailing comment.
#[derive(Debug, Clone, PartialEq)]
pub struct AsmLine {
    pub label: Option<String>,
    pub instruction: Instruction,
    pub comment: Option<String>,
}

/// Ordered instruction stream of a single bus program.
///
/// The generator only accumulates; all placement decisions belong to the
/// compiler. Rendering is deterministic given the same line sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsmGenerator {
    lines: Vec<AsmLine>,
    pending_label: Option<String>,
}

impl AsmGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[AsmLine] {
        &self.lines
    }

    pub fn num_instructions(&self) -> usize {
        self.lines.len()
    }

    pub fn add(&mut self, instruction: Instruction) {
        let label = self.pending_label.take();
        self.lines.push(AsmLine {
            label,
            instruction,
            comment: None,
        });
    }

    pub fn add_with_comment<S: Into<String>>(&mut self, instruction: Instruction, comment: S) {
        let label = self.pending_label.take();
        self.lines.push(AsmLine {
            label,
            instruction,
            comment: Some(comment.into()),
        });
    }

    /// Attach a label to the next instruction added to this generator.
    ///
    /// A line carries at most one label; labeling twice without an
    /// instruction in between is an error.
    pub fn set_next_label<S: Into<String>>(&mut self, label: S) -> Result<()> {
        if self.pending_label.replace(label.into()).is_some() {
            return Err(anyhow!("Two labels attached to the same instruction").into());
        }
        Ok(())
    }

    /// Total real-time duration of the straight-line stream, ignoring
    /// back-edges.
    pub fn linear_duration(&self) -> u64 {
        self.lines
            .iter()
            .map(|line| line.instruction.duration() as u64)
            .sum()
    }

    /// Check that every jump target is defined exactly once and that no
    /// label was left dangling past the last instruction.
    pub fn validate_labels(&self) -> Result<()> {
        if self.pending_label.is_some() {
            return Err(anyhow!("Label attached past the last instruction").into());
        }
        let mut defined: IndexMap<&str, usize> = IndexMap::new();
        for line in &self.lines {
            if let Some(label) = &line.label {
                *defined.entry(label.as_str()).or_insert(0) += 1;
            }
        }
        for (label, count) in &defined {
            if *count > 1 {
                return Err(anyhow!("Label '{label}' is defined {count} times").into());
            }
        }
        for line in &self.lines {
            if let Some(target) = line.instruction.jump_target() {
                if !defined.contains_key(target) {
                    return Err(anyhow!("Jump to undefined label '{target}'").into());
                }
            }
        }
        Ok(())
    }

    /// Render the program as text.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            if let Some(label) = &line.label {
                text.push_str(label);
                text.push_str(":\n");
            }
            text.push_str("    ");
            text.push_str(&line.instruction.to_string());
            text.push_str(&format_comment(&line.comment));
            text.push('\n');
        }
        text
    }
}

/// Sum of the plain wait immediates in a line slice.
pub fn wait_total(lines: &[AsmLine]) -> Ticks {
    lines
        .iter()
        .filter_map(|line| match line.instruction {
            Instruction::Wait { duration } => Some(duration),
            _ => None,
        })
        .sum()
}
