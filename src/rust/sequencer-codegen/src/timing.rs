// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Per-bus timekeeping on the instruction grid.
//!
//! Each bus carries a stack of timeline frames mirroring the block tree:
//! entering a loop pushes a frame, leaving it folds the frame's elapsed
//! time times the iteration count into the parent. A frame whose duration
//! depends on a runtime register value is marked dynamic; such frames can
//! never be aligned across buses.

use crate::settings::CompilerSettings;
use crate::Ticks;

/// Split a wait into immediates that are each at most `max_wait_immediate`
/// and never inside the reserved band above it, summing exactly to
/// `duration`.
///
/// The remainder after carving off full-size chunks must stay at or above
/// one grid quantum; when it would not, a slightly smaller chunk is used so
/// that the tail remains encodable.
pub fn split_wait(duration: Ticks, settings: &CompilerSettings) -> Vec<Ticks> {
    let max = settings.max_wait_immediate;
    let min = settings.grid_quantum;
    let mut parts = Vec::new();
    let mut remaining = duration;
    while remaining > max {
        let chunk = if remaining - max < min { max - min } else { max };
        parts.push(chunk);
        remaining -= chunk;
    }
    if remaining > 0 {
        parts.push(remaining);
    }
    parts
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimelineFrame {
    pub elapsed: Ticks,
    pub dynamic: bool,
}

#[derive(Debug)]
pub struct BusTimeline {
    frames: Vec<TimelineFrame>,
}

impl Default for BusTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTimeline {
    pub fn new() -> Self {
        BusTimeline {
            frames: vec![TimelineFrame::default()],
        }
    }

    pub fn advance(&mut self, ticks: Ticks) {
        self.current_mut().elapsed += ticks;
    }

    /// Record a duration only known at runtime.
    pub fn mark_dynamic(&mut self) {
        self.current_mut().dynamic = true;
    }

    pub fn elapsed(&self) -> Ticks {
        self.current().elapsed
    }

    /// Time accumulated in the enclosing frames, excluding the current one.
    ///
    /// A compensation wait inserted now lands in the current frame and is
    /// replayed every iteration, so it can only correct skew that arose
    /// within this frame. Skew carried in from outside must already be zero
    /// for alignment to be possible.
    pub fn outer_elapsed(&self) -> Ticks {
        self.frames[..self.frames.len() - 1]
            .iter()
            .map(|frame| frame.elapsed)
            .sum()
    }

    pub fn is_dynamic(&self) -> bool {
        self.current().dynamic
    }

    pub fn push_frame(&mut self) {
        self.frames.push(TimelineFrame::default());
    }

    /// Close the innermost frame, folding `iterations` repetitions of it
    /// into the parent. Returns the closed frame.
    pub fn fold_frame(&mut self, iterations: u64) -> TimelineFrame {
        let frame = self
            .frames
            .pop()
            .expect("timeline always has a root frame");
        if let Some(parent) = self.frames.last_mut() {
            parent.elapsed += frame.elapsed * iterations;
            parent.dynamic |= frame.dynamic;
        } else {
            self.frames.push(frame);
        }
        frame
    }

    /// Total time of the fully folded timeline; only meaningful after every
    /// block frame has been closed.
    pub fn total(&self) -> Ticks {
        self.frames[0].elapsed
    }

    fn current(&self) -> &TimelineFrame {
        self.frames.last().expect("timeline always has a root frame")
    }

    fn current_mut(&mut self) -> &mut TimelineFrame {
        self.frames
            .last_mut()
            .expect("timeline always has a root frame")
    }
}
