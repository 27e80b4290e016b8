// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Per-bus waveform, weight and acquisition tables.
//!
//! Waveform content is deduplicated through an md5 fingerprint over the
//! rounded samples, so repeated plays of identical content share one table
//! entry. Long constant-amplitude segments are substituted by a short
//! chunk plus a hardware repeat loop to bound table memory.

use crate::settings::CompilerSettings;
use crate::{Error, Result, Ticks};
use indexmap::IndexMap;
use serde::Serialize;

pub type TableIndex = u32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveformEntry {
    pub index: TableIndex,
    pub samples: Vec<f64>,
}

/// Index table for waveform-like content (waveforms and integration
/// weights), memoized by content fingerprint.
#[derive(Debug)]
pub struct WaveformTable {
    bus: String,
    label: &'static str,
    entries: IndexMap<String, WaveformEntry>,
    by_fingerprint: IndexMap<String, TableIndex>,
    next_index: TableIndex,
    memory_used: usize,
    memory_budget: usize,
    index_ceiling: u32,
}

impl WaveformTable {
    pub fn new(bus: &str, label: &'static str, settings: &CompilerSettings) -> Self {
        WaveformTable {
            bus: bus.to_string(),
            label,
            entries: IndexMap::new(),
            by_fingerprint: IndexMap::new(),
            next_index: 0,
            memory_used: 0,
            memory_budget: settings.waveform_memory_budget,
            index_ceiling: settings.table_index_ceiling,
        }
    }

    /// Look up or insert content, returning its table index.
    pub fn register(&mut self, samples: &[f64]) -> Result<TableIndex> {
        let fingerprint = fingerprint(samples);
        if let Some(index) = self.by_fingerprint.get(&fingerprint) {
            return Ok(*index);
        }
        if self.next_index >= self.index_ceiling {
            return Err(Error::TableOverflow {
                bus: self.bus.clone(),
                reason: format!("{} index ceiling of {} reached", self.label, self.index_ceiling),
            });
        }
        if self.memory_used + samples.len() > self.memory_budget {
            return Err(Error::TableOverflow {
                bus: self.bus.clone(),
                reason: format!(
                    "{} memory budget of {} samples exceeded",
                    self.label, self.memory_budget
                ),
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        self.memory_used += samples.len();
        self.by_fingerprint.insert(fingerprint, index);
        self.entries.insert(
            format!("{}_{}", self.label, index),
            WaveformEntry {
                index,
                samples: samples.to_vec(),
            },
        );
        Ok(index)
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn finish(self) -> IndexMap<String, WaveformEntry> {
        self.entries
    }
}

fn fingerprint(samples: &[f64]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 8);
    for sample in samples {
        let rounded = (sample * 1e12).round() as i64;
        bytes.extend_from_slice(&rounded.to_le_bytes());
    }
    format!("{:x}", md5::compute(&bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcquisitionEntry {
    pub index: TableIndex,
    pub num_bins: u64,
}

#[derive(Debug)]
pub struct AcquisitionTable {
    bus: String,
    entries: IndexMap<String, AcquisitionEntry>,
    next_index: TableIndex,
    index_ceiling: u32,
}

impl AcquisitionTable {
    pub fn new(bus: &str, settings: &CompilerSettings) -> Self {
        AcquisitionTable {
            bus: bus.to_string(),
            entries: IndexMap::new(),
            next_index: 0,
            index_ceiling: settings.table_index_ceiling,
        }
    }

    pub fn register<S: Into<String>>(&mut self, name: S, num_bins: u64) -> Result<TableIndex> {
        if self.next_index >= self.index_ceiling {
            return Err(Error::TableOverflow {
                bus: self.bus.clone(),
                reason: format!("acquisition index ceiling of {} reached", self.index_ceiling),
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        self.entries
            .insert(name.into(), AcquisitionEntry { index, num_bins });
        Ok(index)
    }

    pub fn finish(self) -> IndexMap<String, AcquisitionEntry> {
        self.entries
    }
}

/// One play instruction's worth of table content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaySegment {
    pub wave_i: TableIndex,
    pub wave_q: TableIndex,
    pub duration: Ticks,
}

/// How a play operation lands in the waveform table.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayLowering {
    /// The full content is stored literally.
    Literal(PlaySegment),
    /// A long constant-amplitude segment replaced by edge waveforms plus a
    /// counted repeat of a short chunk.
    Looped {
        head: Option<PlaySegment>,
        chunk: PlaySegment,
        repeats: u64,
        tail: Option<PlaySegment>,
    },
}

impl PlayLowering {
    /// Total playback time; must equal the original waveform duration.
    pub fn total_duration(&self) -> Ticks {
        match self {
            PlayLowering::Literal(segment) => segment.duration,
            PlayLowering::Looped {
                head,
                chunk,
                repeats,
                tail,
            } => {
                head.map_or(0, |s| s.duration)
                    + chunk.duration * repeats
                    + tail.map_or(0, |s| s.duration)
            }
        }
    }
}

fn round_sample(value: f64) -> f64 {
    (value * 1e12).round() / 1e12
}

/// Longest run where both I and Q hold a constant value simultaneously.
fn joint_flat_run(i: &[f64], q: &[f64]) -> Option<(usize, usize)> {
    let len = i.len().min(q.len());
    let mut best: Option<(usize, usize)> = None;
    let mut run_start = 0usize;
    for k in 1..=len {
        let run_ended = k == len
            || round_sample(i[k]) != round_sample(i[run_start])
            || round_sample(q[k]) != round_sample(q[run_start]);
        if run_ended {
            let run_len = k - run_start;
            if best.is_none_or(|(_, l)| run_len > l) {
                best = Some((run_start, run_len));
            }
            run_start = k;
        }
    }
    best
}

/// Decide how to store a play's content, registering the needed entries.
///
/// The substitution only triggers when the flat run is long enough and
/// leaves at least two repetitions; edge segments shorter than one grid
/// quantum are widened into the flat run so every emitted play stays
/// encodable. The reconstruction is exact: segment durations always sum to
/// the original length.
pub fn lower_play(
    table: &mut WaveformTable,
    i: &[f64],
    q: &[f64],
    settings: &CompilerSettings,
) -> Result<PlayLowering> {
    let total = i.len() as Ticks;
    let grid = settings.grid_quantum as usize;
    let chunk_len = settings.square_chunk_length as usize;

    let flat = (total >= settings.square_loop_min_length)
        .then(|| joint_flat_run(i, q))
        .flatten()
        .filter(|(_, run_len)| *run_len as Ticks >= settings.square_loop_min_length);

    if let Some((run_start, run_len)) = flat {
        let run_end = run_start + run_len;
        // Widen a sub-grid head into the flat run.
        let mut head_len = run_start;
        if head_len > 0 && head_len < grid {
            head_len = grid.min(i.len());
        }
        if head_len < run_end {
            let body_len = run_end - head_len;
            let mut repeats = body_len / chunk_len;
            let mut tail_start = head_len + repeats * chunk_len;
            // A sub-grid tail steals one repetition instead.
            if repeats > 0 && tail_start < i.len() && i.len() - tail_start < grid {
                repeats -= 1;
                tail_start -= chunk_len;
            }
            if repeats >= 2 {
                let head = if head_len > 0 {
                    Some(register_segment(table, &i[..head_len], &q[..head_len])?)
                } else {
                    None
                };
                let chunk = register_segment(
                    table,
                    &i[head_len..head_len + chunk_len],
                    &q[head_len..head_len + chunk_len],
                )?;
                let tail = if tail_start < i.len() {
                    Some(register_segment(table, &i[tail_start..], &q[tail_start..])?)
                } else {
                    None
                };
                return Ok(PlayLowering::Looped {
                    head,
                    chunk,
                    repeats: repeats as u64,
                    tail,
                });
            }
        }
    }

    Ok(PlayLowering::Literal(register_segment(table, i, q)?))
}

fn register_segment(table: &mut WaveformTable, i: &[f64], q: &[f64]) -> Result<PlaySegment> {
    let wave_i = table.register(i)?;
    let wave_q = table.register(q)?;
    Ok(PlaySegment {
        wave_i,
        wave_q,
        duration: i.len() as Ticks,
    })
}
