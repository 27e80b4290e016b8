// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of the block tree into per-bus operation streams.
//!
//! Structural blocks are broadcast to every bus: a loop shapes the
//! timeline of all cores even where a core plays nothing inside it, and a
//! sync point must appear at the same logical position in every stream.
//! Operations are routed to the single bus they are bound to.
//!
//! The traversal is stack-based with a bounded depth so that pathological
//! nesting is rejected instead of overflowing the call stack.

use crate::{Result, Error};
use anyhow::anyhow;
use indexmap::IndexMap;
use qprogram_ir::operation::BusName;
use qprogram_ir::{Block, BlockKind, Element, Operation};

pub type ScopeId = u32;
pub type SyncId = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    EnterBlock { scope: ScopeId, kind: BlockKind },
    ExitBlock { scope: ScopeId, kind: BlockKind },
    Operation(Operation),
    /// Broadcast sync marker; a placeholder for buses with no operations
    /// at this point.
    SyncPoint {
        id: SyncId,
        buses: Option<Vec<BusName>>,
    },
}

#[derive(Debug)]
pub struct FanOut {
    /// All items in program order, across buses.
    pub master: Vec<StreamItem>,
    /// Per-bus filtered view of `master`.
    pub per_bus: IndexMap<BusName, Vec<StreamItem>>,
}

enum Work<'a> {
    Enter(&'a Block),
    Leave(ScopeId, &'a BlockKind),
    Op(&'a Operation),
}

pub fn fan_out(root: &Block, buses: &[BusName], max_depth: usize) -> Result<FanOut> {
    if root.depth() > max_depth {
        return Err(anyhow!(
            "Block tree nested {} deep, exceeding the limit of {max_depth}",
            root.depth()
        )
        .into());
    }

    let mut master = Vec::new();
    let mut scope_counter: ScopeId = 0;
    let mut sync_counter: SyncId = 0;
    let mut stack: Vec<Work<'_>> = vec![Work::Enter(root)];

    while let Some(work) = stack.pop() {
        match work {
            Work::Enter(block) => {
                let scope = scope_counter;
                scope_counter += 1;
                master.push(StreamItem::EnterBlock {
                    scope,
                    kind: block.kind().clone(),
                });
                stack.push(Work::Leave(scope, block.kind()));
                for child in block.children().iter().rev() {
                    match child {
                        Element::Block(inner) => stack.push(Work::Enter(inner)),
                        Element::Operation(operation) => stack.push(Work::Op(operation)),
                    }
                }
            }
            Work::Leave(scope, kind) => {
                master.push(StreamItem::ExitBlock {
                    scope,
                    kind: kind.clone(),
                });
            }
            Work::Op(operation) => match operation {
                Operation::Sync { buses: parties } => {
                    if let Some(parties) = parties {
                        for party in parties {
                            check_bus(party, buses)?;
                        }
                    }
                    master.push(StreamItem::SyncPoint {
                        id: sync_counter,
                        buses: parties.clone(),
                    });
                    sync_counter += 1;
                }
                _ => {
                    let bus = operation
                        .bus()
                        .expect("non-sync operations are bus-bound");
                    check_bus(bus, buses)?;
                    master.push(StreamItem::Operation(operation.clone()));
                }
            },
        }
    }

    let mut per_bus: IndexMap<BusName, Vec<StreamItem>> = buses
        .iter()
        .map(|bus| (bus.clone(), Vec::new()))
        .collect();
    for item in &master {
        match item {
            StreamItem::EnterBlock { .. } | StreamItem::ExitBlock { .. } => {
                for stream in per_bus.values_mut() {
                    stream.push(item.clone());
                }
            }
            StreamItem::Operation(operation) => {
                let bus = operation.bus().expect("routed operations are bus-bound");
                if let Some(stream) = per_bus.get_mut(bus) {
                    stream.push(item.clone());
                }
            }
            StreamItem::SyncPoint { buses: parties, .. } => {
                for (bus, stream) in per_bus.iter_mut() {
                    let participates = parties.as_ref().is_none_or(|p| p.contains(bus));
                    if participates {
                        stream.push(item.clone());
                    }
                }
            }
        }
    }

    Ok(FanOut { master, per_bus })
}

fn check_bus(bus: &str, buses: &[BusName]) -> Result<()> {
    if !buses.iter().any(|known| known == bus) {
        return Err(Error::new(&format!(
            "Operation references unknown bus '{bus}'"
        )));
    }
    Ok(())
}
