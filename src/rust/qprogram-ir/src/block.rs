// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The block tree consumed by the compiler.
//!
//! A block is an ordered sequence of child blocks and operations. Blocks
//! nest arbitrarily; nesting depth bounds register usage on the target.

use crate::operation::Operation;
use crate::variable::Variable;

/// Loop bounds for one swept variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub variable: Variable,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl ForLoop {
    pub fn new(variable: Variable, start: f64, stop: f64, step: f64) -> Self {
        ForLoop {
            variable,
            start,
            stop,
            step,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Sequential,
    ForLoop(ForLoop),
    /// Multiple loops stepped together in lockstep.
    Parallel(Vec<ForLoop>),
    /// Repeated acquisition of `shots` shots.
    Average { shots: u64 },
    InfiniteLoop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Block(Block),
    Operation(Operation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    kind: BlockKind,
    children: Vec<Element>,
}

impl Default for Block {
    fn default() -> Self {
        Block::sequential()
    }
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Block {
            kind,
            children: Vec::new(),
        }
    }

    pub fn sequential() -> Self {
        Block::new(BlockKind::Sequential)
    }

    pub fn for_loop(variable: Variable, start: f64, stop: f64, step: f64) -> Self {
        Block::new(BlockKind::ForLoop(ForLoop::new(variable, start, stop, step)))
    }

    pub fn parallel(loops: Vec<ForLoop>) -> Self {
        Block::new(BlockKind::Parallel(loops))
    }

    pub fn average(shots: u64) -> Self {
        Block::new(BlockKind::Average { shots })
    }

    pub fn infinite_loop() -> Self {
        Block::new(BlockKind::InfiniteLoop)
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn push_operation(&mut self, operation: Operation) {
        self.children.push(Element::Operation(operation));
    }

    pub fn push_block(&mut self, block: Block) {
        self.children.push(Element::Block(block));
    }

    /// Chainable variant of [`Block::push_operation`].
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.push_operation(operation);
        self
    }

    /// Chainable variant of [`Block::push_block`].
    pub fn with_block(mut self, block: Block) -> Self {
        self.push_block(block);
        self
    }

    /// Maximum nesting depth of the tree rooted at this block.
    ///
    /// Computed with an explicit stack so that pathological inputs cannot
    /// overflow the call stack before the compiler gets a chance to reject
    /// them.
    pub fn depth(&self) -> usize {
        let mut max_depth = 1;
        let mut stack: Vec<(&Block, usize)> = vec![(self, 1)];
        while let Some((block, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            for child in &block.children {
                if let Element::Block(inner) = child {
                    stack.push((inner, depth + 1));
                }
            }
        }
        max_depth
    }
}
