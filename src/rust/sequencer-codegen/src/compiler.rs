// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Compilation of a block tree into one assembly program per bus.
//!
//! The master stream produced by the fan-out pass is consumed once, with
//! every bus tracker advanced in lockstep. Structural items apply to all
//! trackers so that loop frames, register scopes and labels stay congruent
//! across buses; operations only touch the tracker of their bus.

use indexmap::{IndexMap, IndexSet};

use crate::context::{BusConfig, CompileContext};
use crate::encoding::{encode_in_domain, phase_to_fixed, to_register_word};
use crate::fanout::{ScopeId, StreamItem, fan_out};
use crate::latched::LatchedTracker;
use crate::looprange::{LoweredRange, iterations, lower_range};
use crate::registers::RegisterAllocator;
use crate::result::CompiledProgram;
use crate::settings::CompilerSettings;
use crate::timegrid::duration_to_ticks;
use crate::timing::{BusTimeline, split_wait};
use crate::wavetable::{AcquisitionTable, PlayLowering, PlaySegment, WaveformTable, lower_play};
use crate::{Error, Result, Ticks};
use qprogram_ir::operation::BusName;
use qprogram_ir::{
    Block, BlockKind, Calibration, Domain, ForLoop, IqPair, Operation, Value, Variable, VariableId,
    WaveformSource,
};
use sequencer_asm::{AsmGenerator, Instruction, Operand, Register};

/// Compile a program into one [`CompiledProgram`] per configured bus.
///
/// Every call builds its state from scratch; the calibration and bus map
/// are only read.
pub fn compile(
    program: &Block,
    buses: &IndexMap<BusName, BusConfig>,
    calibration: &Calibration,
    settings: &CompilerSettings,
) -> Result<IndexMap<BusName, CompiledProgram>> {
    let mut settings = settings.clone();
    for change in settings.sanitize()? {
        log::debug!(
            "Sanitized setting {}: {} -> {} ({})",
            change.field,
            change.original,
            change.sanitized,
            change.reason
        );
    }
    let context = CompileContext {
        buses,
        calibration,
        settings,
    };
    let settings = &context.settings;
    let bus_names: Vec<BusName> = buses.keys().cloned().collect();
    let fanned = fan_out(program, &bus_names, settings.max_block_depth)?;

    let mut trackers: IndexMap<BusName, BusTracker<'_>> = IndexMap::new();
    for (bus, stream) in &fanned.per_bus {
        let config = context.config_for(bus)?;
        let plan = plan_bus(stream)?;
        let mut tracker = BusTracker::new(bus.clone(), config, plan, settings);
        tracker.preamble(settings);
        trackers.insert(bus.clone(), tracker);
    }

    for item in &fanned.master {
        match item {
            StreamItem::EnterBlock { scope, kind } => {
                for tracker in trackers.values_mut() {
                    tracker.enter_block(*scope, kind, settings)?;
                }
            }
            StreamItem::ExitBlock { .. } => {
                for tracker in trackers.values_mut() {
                    tracker.exit_block(settings)?;
                }
            }
            StreamItem::Operation(operation) => {
                let bus = operation.bus().expect("routed operations are bus-bound");
                let tracker = trackers
                    .get_mut(bus)
                    .expect("a tracker exists for every configured bus");
                tracker.handle_operation(operation, context.calibration, settings)?;
            }
            StreamItem::SyncPoint { buses: parties, .. } => {
                synchronize(&mut trackers, parties.as_deref(), settings)?;
            }
        }
    }

    let mut compiled = IndexMap::new();
    for (bus, tracker) in trackers {
        compiled.insert(bus, tracker.finish(settings)?);
    }
    Ok(compiled)
}

/// Pad the participating buses with compensating waits so that their
/// elapsed time in the current frame is equal afterwards.
///
/// Compensation waits land in the current frame and repeat with every
/// iteration of an enclosing loop, so they can only correct skew that arose
/// within that frame. Skew carried in from outside the frame would be
/// over-corrected on every pass and is rejected instead.
fn synchronize(
    trackers: &mut IndexMap<BusName, BusTracker<'_>>,
    parties: Option<&[BusName]>,
    settings: &CompilerSettings,
) -> Result<()> {
    let participants: Vec<BusName> = match parties {
        Some(parties) => parties.to_vec(),
        None => trackers.keys().cloned().collect(),
    };
    if participants.len() > 1
        && participants
            .iter()
            .any(|bus| trackers.get(bus).is_some_and(|t| t.timeline.is_dynamic()))
    {
        return Err(Error::UnsupportedDynamicSync);
    }
    let outer: Vec<Ticks> = participants
        .iter()
        .filter_map(|bus| trackers.get(bus).map(|t| t.timeline.outer_elapsed()))
        .collect();
    if outer.windows(2).any(|pair| pair[0] != pair[1]) {
        return Err(Error::new(
            "Sync inside a loop cannot compensate timing skew accumulated before the loop; \
             sync the buses before entering it",
        ));
    }
    // A sync point is a timing event; pending sets take effect here.
    for bus in &participants {
        if let Some(tracker) = trackers.get_mut(bus) {
            tracker.flush_forced(settings);
        }
    }
    let target = participants
        .iter()
        .filter_map(|bus| trackers.get(bus).map(|t| t.timeline.elapsed()))
        .max()
        .unwrap_or(0);
    for bus in &participants {
        if let Some(tracker) = trackers.get_mut(bus) {
            let pad = target - tracker.timeline.elapsed();
            for part in split_wait(pad, settings) {
                tracker.emit_timed(
                    Instruction::Wait {
                        duration: part as u32,
                    },
                    settings,
                );
            }
        }
    }
    Ok(())
}

/// Loop counts are loaded into registers, whose words are 32 bits wide.
fn loop_immediate(count: u64) -> Result<u32> {
    u32::try_from(count).map_err(|_| {
        Error::new(&format!(
            "Loop count {count} does not fit a 32-bit register immediate"
        ))
    })
}

/// Static shape of one acquisition: its table name, the total bin count
/// across all enclosing loops, and the loop whose entry initializes the
/// bin register (`None` for a top-level acquisition, which uses bin 0).
#[derive(Debug, Clone)]
struct AcquisitionPlan {
    name: String,
    num_bins: u64,
    init_scope: Option<ScopeId>,
}

#[derive(Debug, Default)]
struct BusPlan {
    acquisitions: Vec<AcquisitionPlan>,
    by_scope: IndexMap<ScopeId, Vec<usize>>,
    /// Loop variables actually read by an operation on this bus; only these
    /// get a value register.
    referenced: IndexSet<VariableId>,
}

/// Pre-scan of one bus stream, resolving everything that must be known
/// before the first instruction is emitted.
fn plan_bus(stream: &[StreamItem]) -> Result<BusPlan> {
    let mut plan = BusPlan::default();
    let mut stack: Vec<(ScopeId, u64, bool)> = Vec::new();
    for item in stream {
        match item {
            StreamItem::EnterBlock { scope, kind } => {
                let (multiplier, is_loop) = match kind {
                    BlockKind::Sequential => (1, false),
                    BlockKind::ForLoop(fl) => (iterations(fl.start, fl.stop, fl.step)?, true),
                    BlockKind::Parallel(loops) => (parallel_iterations(loops)?, true),
                    BlockKind::Average { shots } => (*shots, true),
                    // Runs forever; it scales neither bins nor time.
                    BlockKind::InfiniteLoop => (1, true),
                };
                stack.push((*scope, multiplier, is_loop));
            }
            StreamItem::ExitBlock { .. } => {
                stack.pop();
            }
            StreamItem::Operation(operation) => {
                if matches!(
                    operation,
                    Operation::Acquire { .. } | Operation::Measure { .. }
                ) {
                    let index = plan.acquisitions.len();
                    let num_bins = stack.iter().map(|(_, m, _)| *m).product();
                    let init_scope = stack.iter().find(|(_, _, l)| *l).map(|(s, _, _)| *s);
                    if let Some(scope) = init_scope {
                        plan.by_scope.entry(scope).or_default().push(index);
                    }
                    plan.acquisitions.push(AcquisitionPlan {
                        name: format!("acq_{index}"),
                        num_bins,
                        init_scope,
                    });
                }
                for value in operation_values(operation) {
                    if let Some(id) = value.variable() {
                        plan.referenced.insert(id);
                    }
                }
            }
            StreamItem::SyncPoint { .. } => {}
        }
    }
    Ok(plan)
}

fn operation_values(operation: &Operation) -> Vec<Value> {
    match operation {
        Operation::Wait { duration, .. } => vec![*duration],
        Operation::SetFrequency { frequency, .. } => vec![*frequency],
        Operation::SetPhase { phase, .. } => vec![*phase],
        Operation::SetGain { gain, .. } => vec![*gain],
        Operation::SetOffset {
            offset_i, offset_q, ..
        } => vec![*offset_i, *offset_q],
        _ => vec![],
    }
}

/// Lockstep loops iterate together until the shortest range is exhausted.
fn parallel_iterations(loops: &[ForLoop]) -> Result<u64> {
    let mut shortest: Option<u64> = None;
    for fl in loops {
        let count = iterations(fl.start, fl.stop, fl.step)?;
        shortest = Some(shortest.map_or(count, |s| s.min(count)));
    }
    shortest.ok_or_else(|| Error::new("Parallel block contains no loops"))
}

fn resolve_waveform<'c>(
    bus: &str,
    source: &'c WaveformSource,
    calibration: &'c Calibration,
) -> Result<&'c IqPair> {
    match source {
        WaveformSource::Inline(pair) => Ok(pair),
        WaveformSource::Named(name) => calibration.resolve(name, bus).ok_or_else(|| {
            Error::new(&format!(
                "Waveform '{name}' is not in the calibration table for bus '{bus}'"
            ))
        }),
    }
}

enum BlockFrame {
    Sequential,
    Loop {
        label: String,
        /// `None` for an infinite loop, which jumps back unconditionally.
        counter: Option<Register>,
        iterations: u64,
        /// Value registers stepped at the end of every iteration.
        steps: Vec<(Register, i64)>,
        variables: Vec<VariableId>,
        average: bool,
    },
}

/// All per-bus compilation state: the instruction stream under
/// construction, the timeline, pending latched sets, the register file and
/// the content tables.
struct BusTracker<'a> {
    bus: BusName,
    config: &'a BusConfig,
    plan: BusPlan,
    generator: AsmGenerator,
    timeline: BusTimeline,
    latched: LatchedTracker,
    registers: RegisterAllocator,
    waveforms: WaveformTable,
    weights: WaveformTable,
    acquisitions: AcquisitionTable,
    variable_registers: IndexMap<VariableId, (Register, Domain)>,
    bin_registers: IndexMap<String, Register>,
    frames: Vec<BlockFrame>,
    next_acquisition: usize,
    square_counter: usize,
    saw_average: bool,
}

impl<'a> BusTracker<'a> {
    fn new(
        bus: BusName,
        config: &'a BusConfig,
        plan: BusPlan,
        settings: &CompilerSettings,
    ) -> Self {
        BusTracker {
            waveforms: WaveformTable::new(&bus, "waveform", settings),
            weights: WaveformTable::new(&bus, "weight", settings),
            acquisitions: AcquisitionTable::new(&bus, settings),
            registers: RegisterAllocator::new(settings.register_pool_size),
            generator: AsmGenerator::new(),
            timeline: BusTimeline::new(),
            latched: LatchedTracker::new(),
            variable_registers: IndexMap::new(),
            bin_registers: IndexMap::new(),
            frames: Vec::new(),
            next_acquisition: 0,
            square_counter: 0,
            saw_average: false,
            plan,
            config,
            bus,
        }
    }

    /// Start barrier across all cores, initial marker state and the static
    /// line-delay compensation of this bus.
    fn preamble(&mut self, settings: &CompilerSettings) {
        self.emit_timed(
            Instruction::WaitSync {
                duration: settings.grid_quantum as u32,
            },
            settings,
        );
        self.generator.add(Instruction::SetMrk {
            mask: self.config.init_markers,
        });
        self.emit_timed(
            Instruction::UpdParam {
                duration: settings.grid_quantum as u32,
            },
            settings,
        );
        let delay = duration_to_ticks(self.config.delay as f64, settings.grid_quantum);
        for part in split_wait(delay, settings) {
            self.emit_timed(
                Instruction::Wait {
                    duration: part as u32,
                },
                settings,
            );
        }
    }

    fn finish(mut self, settings: &CompilerSettings) -> Result<CompiledProgram> {
        self.generator.add(Instruction::SetMrk { mask: 0 });
        self.emit_timed(
            Instruction::UpdParam {
                duration: settings.grid_quantum as u32,
            },
            settings,
        );
        self.latched.absorb_into_timed();
        self.generator.add(Instruction::Stop);
        self.generator.validate_labels()?;
        if !self.saw_average {
            if let Some(period) = settings.repetition_period {
                let duration = self.timeline.total();
                if duration > period {
                    return Err(Error::DurationExceedsPeriod {
                        bus: self.bus.clone(),
                        duration,
                        period,
                    });
                }
            }
        }
        log::debug!(
            "Bus '{}': {} instructions, {} ns straight-line, {} ns in plain waits",
            self.bus,
            self.generator.num_instructions(),
            self.generator.linear_duration(),
            sequencer_asm::generator::wait_total(self.generator.lines()),
        );
        let program = self.generator.render();
        Ok(CompiledProgram {
            sequencer: self.config.sequencer.clone(),
            program,
            instructions: self.generator,
            waveforms: self.waveforms.finish(),
            weights: self.weights.finish(),
            acquisitions: self.acquisitions.finish(),
            duration: self.timeline.total(),
            dynamic: self.timeline.is_dynamic(),
        })
    }

    fn emit_timed(&mut self, instruction: Instruction, settings: &CompilerSettings) {
        let ticks = instruction.duration() as Ticks;
        if settings.emit_timing_comments {
            let comment = format!("t={} ns", self.timeline.elapsed());
            self.generator.add_with_comment(instruction, comment);
        } else {
            self.generator.add(instruction);
        }
        self.timeline.advance(ticks);
    }

    /// Apply pending latched sets now, paying one update quantum.
    fn flush_forced(&mut self, settings: &CompilerSettings) {
        let used = self.latched.flush(&mut self.generator, settings);
        self.timeline.advance(used);
    }

    /// Emit a wait of exactly `ticks`. A pending latched batch is applied
    /// first and its update quantum is folded into the wait budget, so the
    /// elapsed time still comes out to `ticks`.
    fn emit_wait(&mut self, mut ticks: Ticks, settings: &CompilerSettings) {
        if ticks == 0 {
            return;
        }
        if self.latched.has_pending() {
            let used = self.latched.flush(&mut self.generator, settings);
            self.timeline.advance(used);
            ticks = ticks.saturating_sub(used);
        }
        for part in split_wait(ticks, settings) {
            self.emit_timed(
                Instruction::Wait {
                    duration: part as u32,
                },
                settings,
            );
        }
    }

    fn enter_block(
        &mut self,
        scope: ScopeId,
        kind: &BlockKind,
        settings: &CompilerSettings,
    ) -> Result<()> {
        match kind {
            BlockKind::Sequential => {
                self.registers.open_scope();
                self.frames.push(BlockFrame::Sequential);
                Ok(())
            }
            BlockKind::ForLoop(fl) => {
                let lowered = lower_range(fl)?;
                let count = lowered.iterations;
                let sweeps = [(fl.variable.clone(), lowered)];
                self.begin_loop(
                    scope,
                    format!("loop_{scope}"),
                    Some(count),
                    &sweeps,
                    false,
                    settings,
                )
            }
            BlockKind::Parallel(loops) => {
                let mut sweeps = Vec::with_capacity(loops.len());
                for fl in loops {
                    sweeps.push((fl.variable.clone(), lower_range(fl)?));
                }
                let count = sweeps
                    .iter()
                    .map(|(_, lowered)| lowered.iterations)
                    .min()
                    .ok_or_else(|| Error::new("Parallel block contains no loops"))?;
                self.begin_loop(
                    scope,
                    format!("loop_{scope}"),
                    Some(count),
                    &sweeps,
                    false,
                    settings,
                )
            }
            BlockKind::Average { shots } => self.begin_loop(
                scope,
                format!("avg_{scope}"),
                Some(*shots),
                &[],
                true,
                settings,
            ),
            BlockKind::InfiniteLoop => self.begin_loop(
                scope,
                format!("infinite_{scope}"),
                None,
                &[],
                false,
                settings,
            ),
        }
    }

    fn begin_loop(
        &mut self,
        scope: ScopeId,
        label: String,
        count: Option<u64>,
        sweeps: &[(Variable, LoweredRange)],
        average: bool,
        settings: &CompilerSettings,
    ) -> Result<()> {
        // Apply pending sets outside the loop so every iteration starts
        // from the same state and timing.
        self.flush_forced(settings);
        self.init_bin_registers(scope)?;
        self.registers.open_scope();
        let mut counter = None;
        if let Some(count) = count {
            let register = self.registers.allocate()?;
            let instruction = Instruction::Move {
                source: Operand::Immediate(loop_immediate(count)?),
                destination: register,
            };
            if settings.emit_timing_comments {
                self.generator
                    .add_with_comment(instruction, format!("{count} iterations"));
            } else {
                self.generator.add(instruction);
            }
            counter = Some(register);
        }
        let mut steps = Vec::new();
        let mut variables = Vec::new();
        for (variable, lowered) in sweeps {
            if !self.plan.referenced.contains(&variable.id) {
                continue;
            }
            let register = self.registers.allocate()?;
            self.generator.add(Instruction::Move {
                source: Operand::Immediate(to_register_word(lowered.start)),
                destination: register,
            });
            self.variable_registers
                .insert(variable.id, (register, variable.domain));
            steps.push((register, lowered.step));
            variables.push(variable.id);
        }
        self.generator.set_next_label(label.clone())?;
        self.timeline.push_frame();
        self.frames.push(BlockFrame::Loop {
            label,
            counter,
            iterations: count.unwrap_or(1),
            steps,
            variables,
            average,
        });
        Ok(())
    }

    /// Acquisitions bound to this loop get their bin register zeroed before
    /// the loop is entered, so re-running the block restarts the binning.
    fn init_bin_registers(&mut self, scope: ScopeId) -> Result<()> {
        let indices = self.plan.by_scope.get(&scope).cloned().unwrap_or_default();
        for index in indices {
            let name = self.plan.acquisitions[index].name.clone();
            let register = self.registers.allocate()?;
            self.generator.add(Instruction::Move {
                source: Operand::Immediate(0),
                destination: register,
            });
            self.bin_registers.insert(name, register);
        }
        Ok(())
    }

    fn exit_block(&mut self, settings: &CompilerSettings) -> Result<()> {
        let frame = self
            .frames
            .pop()
            .expect("block frames mirror the stream nesting");
        match frame {
            BlockFrame::Sequential => {
                self.registers.close_scope();
            }
            BlockFrame::Loop {
                label,
                counter,
                iterations,
                steps,
                variables,
                average,
            } => {
                // The back-edge is a timing boundary; pending sets must land
                // within the iteration that issued them.
                self.flush_forced(settings);
                for (register, step) in &steps {
                    self.generator.add(Instruction::Add {
                        origin: *register,
                        value: Operand::Immediate(to_register_word(*step)),
                        destination: *register,
                    });
                }
                match counter {
                    Some(register) => self.generator.add(Instruction::Loop { register, label }),
                    None => self.generator.add(Instruction::Jmp { label }),
                }
                for id in &variables {
                    self.variable_registers.swap_remove(id);
                }
                self.registers.close_scope();
                let closed = self.timeline.fold_frame(iterations);
                if average {
                    self.saw_average = true;
                    if let Some(period) = settings.repetition_period {
                        if closed.elapsed > period {
                            return Err(Error::DurationExceedsPeriod {
                                bus: self.bus.clone(),
                                duration: closed.elapsed,
                                period,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_operation(
        &mut self,
        operation: &Operation,
        calibration: &Calibration,
        settings: &CompilerSettings,
    ) -> Result<()> {
        match operation {
            Operation::Play {
                waveform,
                wait_time,
                ..
            } => self.handle_play(waveform, *wait_time, calibration, settings),
            Operation::Wait { duration, .. } => match duration {
                Value::Literal(nanoseconds) => {
                    let ticks = duration_to_ticks(*nanoseconds, settings.grid_quantum);
                    self.emit_wait(ticks, settings);
                    Ok(())
                }
                Value::Variable(id) => {
                    let register = self.variable_register(*id, Domain::Time)?;
                    self.flush_forced(settings);
                    self.generator.add(Instruction::WaitReg { register });
                    self.timeline.mark_dynamic();
                    Ok(())
                }
            },
            Operation::Acquire { weights, .. } => {
                self.handle_acquire(weights, calibration, settings)
            }
            Operation::Measure {
                waveform, weights, ..
            } => {
                self.handle_play(waveform, None, calibration, settings)?;
                let flight =
                    duration_to_ticks(self.config.time_of_flight as f64, settings.grid_quantum);
                self.emit_wait(flight, settings);
                self.handle_acquire(weights, calibration, settings)
            }
            Operation::SetFrequency { frequency, .. } => {
                let frequency = self.value_operand(frequency, Domain::Frequency)?;
                self.generator.add(Instruction::SetFreq { frequency });
                self.latched.note_set();
                Ok(())
            }
            Operation::SetPhase { phase, .. } => {
                let phase = match phase {
                    Value::Literal(radians) => {
                        Operand::Immediate(to_register_word(phase_to_fixed(*radians)))
                    }
                    Value::Variable(id) => {
                        Operand::Register(self.variable_register(*id, Domain::Phase)?)
                    }
                };
                self.generator.add(Instruction::SetPh { phase });
                self.latched.note_set();
                Ok(())
            }
            Operation::ResetPhase { .. } => {
                self.generator.add(Instruction::ResetPh);
                Ok(())
            }
            Operation::SetGain { gain, .. } => {
                let gain = self.value_operand(gain, Domain::Voltage)?;
                self.generator.add(Instruction::SetAwgGain {
                    gain_i: gain.clone(),
                    gain_q: gain,
                });
                self.latched.note_set();
                Ok(())
            }
            Operation::SetOffset {
                offset_i, offset_q, ..
            } => {
                let offset_i = self.value_operand(offset_i, Domain::Voltage)?;
                let offset_q = self.value_operand(offset_q, Domain::Voltage)?;
                self.generator
                    .add(Instruction::SetAwgOffs { offset_i, offset_q });
                self.latched.note_set();
                Ok(())
            }
            Operation::SetMarkers { mask, .. } => {
                self.generator.add(Instruction::SetMrk { mask: *mask });
                self.latched.note_set();
                Ok(())
            }
            // Routed as a stream-level sync point, never dispatched here.
            Operation::Sync { .. } => Ok(()),
        }
    }

    fn handle_play(
        &mut self,
        source: &WaveformSource,
        wait_time: Option<u64>,
        calibration: &Calibration,
        settings: &CompilerSettings,
    ) -> Result<()> {
        let pair = resolve_waveform(&self.bus, source, calibration)?;
        if pair.i.is_parametric() || pair.q.is_parametric() {
            log::warn!(
                "Play on bus '{}' uses a waveform parametrized by a runtime variable; \
                 the target format cannot express it, skipping",
                self.bus
            );
            return Ok(());
        }
        let i = pair.i.samples();
        let q = pair.q.samples();
        if i.len() != q.len() {
            return Err(Error::WaveformShapeMismatch {
                i: i.len() as u64,
                q: q.len() as u64,
            });
        }
        if i.is_empty() {
            return Ok(());
        }
        let lowering = lower_play(&mut self.waveforms, &i, &q, settings)?;
        let played = lowering.total_duration();
        let credit = wait_time.map(|w| duration_to_ticks(w as f64, settings.grid_quantum));
        match lowering {
            PlayLowering::Literal(segment) => {
                // An explicit wait time replaces the time credited to the
                // play; the waveform itself keeps running underneath.
                self.emit_play_segment(segment, credit.unwrap_or(segment.duration), settings);
            }
            PlayLowering::Looped {
                head,
                chunk,
                repeats,
                tail,
            } => {
                if let Some(segment) = head {
                    self.emit_play_segment(segment, segment.duration, settings);
                }
                self.registers.open_scope();
                let register = self.registers.allocate()?;
                let label = format!("square_{}", self.square_counter);
                self.square_counter += 1;
                self.generator.add(Instruction::Move {
                    source: Operand::Immediate(loop_immediate(repeats)?),
                    destination: register,
                });
                self.generator.set_next_label(label.clone())?;
                self.emit_play_segment(chunk, chunk.duration, settings);
                self.generator.add(Instruction::Loop { register, label });
                self.timeline.advance(chunk.duration * (repeats - 1));
                self.registers.close_scope();
                if let Some(segment) = tail {
                    self.emit_play_segment(segment, segment.duration, settings);
                }
                if let Some(credit) = credit {
                    for part in split_wait(credit.saturating_sub(played), settings) {
                        self.emit_timed(
                            Instruction::Wait {
                                duration: part as u32,
                            },
                            settings,
                        );
                    }
                }
            }
        }
        self.latched.absorb_into_timed();
        Ok(())
    }

    /// Emit one play crediting `credit` ticks of timeline. The instruction
    /// operand is capped at the wait immediate maximum; the excess follows
    /// as plain waits while the waveform keeps playing.
    fn emit_play_segment(
        &mut self,
        segment: PlaySegment,
        credit: Ticks,
        settings: &CompilerSettings,
    ) {
        let max = settings.max_wait_immediate;
        let grid = settings.grid_quantum;
        let credit = credit.max(grid);
        let mut operand = credit.min(max);
        let mut rest = credit - operand;
        if rest > 0 && rest < grid {
            operand -= grid;
            rest += grid;
        }
        self.emit_timed(
            Instruction::Play {
                wave_i: segment.wave_i,
                wave_q: segment.wave_q,
                duration: operand as u32,
            },
            settings,
        );
        for part in split_wait(rest, settings) {
            self.emit_timed(
                Instruction::Wait {
                    duration: part as u32,
                },
                settings,
            );
        }
    }

    fn handle_acquire(
        &mut self,
        weights: &WaveformSource,
        calibration: &Calibration,
        settings: &CompilerSettings,
    ) -> Result<()> {
        let plan = self
            .plan
            .acquisitions
            .get(self.next_acquisition)
            .cloned()
            .expect("acquisition plans cover every acquisition operation");
        self.next_acquisition += 1;
        let pair = resolve_waveform(&self.bus, weights, calibration)?;
        if pair.i.is_parametric() || pair.q.is_parametric() {
            log::warn!(
                "Acquisition on bus '{}' uses weights parametrized by a runtime variable; \
                 the target format cannot express them, skipping",
                self.bus
            );
            return Ok(());
        }
        let weight_i = pair.i.samples();
        let weight_q = pair.q.samples();
        if weight_i.len() != weight_q.len() {
            return Err(Error::WeightsLengthMismatch {
                i: weight_i.len() as u64,
                q: weight_q.len() as u64,
            });
        }
        let acquisition = self.acquisitions.register(plan.name.clone(), plan.num_bins)?;
        let weight_i = self.weights.register(&weight_i)?;
        let weight_q = self.weights.register(&weight_q)?;
        let bin_register = self.bin_registers.get(&plan.name).copied();
        let bin = match bin_register {
            Some(register) => Operand::Register(register),
            None => Operand::Immediate(0),
        };
        // Integration runs in the background; the instruction itself only
        // occupies one update quantum of sequencer time.
        self.emit_timed(
            Instruction::AcquireWeighed {
                acquisition,
                bin,
                weight_i: Operand::Immediate(weight_i),
                weight_q: Operand::Immediate(weight_q),
                duration: settings.grid_quantum as u32,
            },
            settings,
        );
        if let Some(register) = bin_register {
            self.generator.add(Instruction::Add {
                origin: register,
                value: Operand::Immediate(1),
                destination: register,
            });
        }
        self.latched.absorb_into_timed();
        Ok(())
    }

    fn value_operand(&self, value: &Value, domain: Domain) -> Result<Operand> {
        match value {
            Value::Literal(literal) => Ok(Operand::Immediate(to_register_word(encode_in_domain(
                domain, *literal,
            )))),
            Value::Variable(id) => Ok(Operand::Register(self.variable_register(*id, domain)?)),
        }
    }

    fn variable_register(&self, id: VariableId, expected: Domain) -> Result<Register> {
        let (register, domain) = self.variable_registers.get(&id).ok_or_else(|| {
            Error::new(&format!(
                "Variable {id} is not swept by an enclosing loop on bus '{}'",
                self.bus
            ))
        })?;
        if *domain != expected {
            return Err(Error::new(&format!(
                "Variable {id} has domain {domain:?} where {expected:?} is required"
            )));
        }
        Ok(*register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qprogram_ir::Envelope;

    fn readout_bus() -> IndexMap<BusName, BusConfig> {
        IndexMap::from([("readout".to_string(), BusConfig::new("q0_readout"))])
    }

    fn two_buses() -> IndexMap<BusName, BusConfig> {
        IndexMap::from([
            ("drive".to_string(), BusConfig::new("q0_drive")),
            ("readout".to_string(), BusConfig::new("q0_readout")),
        ])
    }

    fn play(bus: &str, amplitude: f64, duration: u64) -> Operation {
        Operation::Play {
            bus: bus.to_string(),
            waveform: IqPair::square(amplitude, duration).into(),
            wait_time: None,
        }
    }

    fn acquire(bus: &str, duration: u64) -> Operation {
        Operation::Acquire {
            bus: bus.to_string(),
            weights: IqPair::square(1.0, duration).into(),
        }
    }

    fn compile_one(root: &Block, settings: &CompilerSettings) -> CompiledProgram {
        let mut programs = compile(root, &readout_bus(), &Calibration::new(), settings).unwrap();
        programs.swap_remove("readout").unwrap()
    }

    #[test]
    fn test_end_to_end_shot_loop() {
        let root = Block::sequential()
            .with_operation(Operation::SetGain {
                bus: "readout".to_string(),
                gain: Value::Literal(0.5),
            })
            .with_operation(Operation::Wait {
                bus: "readout".to_string(),
                duration: Value::Literal(4.0),
            })
            .with_block(
                Block::average(10)
                    .with_operation(play("readout", 0.4, 100))
                    .with_operation(acquire("readout", 100)),
            );
        let program = compile_one(&root, &CompilerSettings::default());

        // Preamble 8, gain update folded into the 4 ns wait, ten shots of
        // 100 ns play plus 4 ns acquire, final update 4.
        assert_eq!(program.duration, 8 + 4 + 10 * (100 + 4) + 4);
        assert!(!program.dynamic);
        assert_eq!(program.acquisitions.len(), 1);
        assert_eq!(program.acquisitions["acq_0"].num_bins, 10);
        assert_eq!(program.waveforms.len(), 2);
        assert_eq!(program.weights.len(), 2);
        assert!(program.program.starts_with("    wait_sync        4\n"));
        assert!(program.program.contains("set_awg_gain     16384, 16384"));
        assert!(program.program.contains("avg_1:"));
        assert!(program.program.contains("loop             R1, @avg_1"));
        assert!(program.program.contains("acquire_weighed  0, R0, 0, 1, 4"));
        assert!(program.program.contains("add              R0, 1, R0"));
        assert!(program.program.trim_end().ends_with("stop"));
    }

    #[test]
    fn test_sync_aligns_buses() {
        let root = Block::sequential()
            .with_operation(play("drive", 0.5, 100))
            .with_operation(Operation::Sync { buses: None });
        let programs = compile(
            &root,
            &two_buses(),
            &Calibration::new(),
            &CompilerSettings::default(),
        )
        .unwrap();
        assert_eq!(programs["drive"].duration, programs["readout"].duration);
        assert!(programs["readout"].program.contains("wait             100"));
        assert!(!programs["drive"].program.contains("wait             100"));
    }

    #[test]
    fn test_sync_inside_loop_rejects_skew_from_outside() {
        // The drive bus is 100 ns ahead before the loop starts. A wait
        // emitted inside the loop body repeats every shot, so the skew
        // cannot be compensated there.
        let root = Block::sequential()
            .with_operation(Operation::Wait {
                bus: "drive".to_string(),
                duration: Value::Literal(100.0),
            })
            .with_block(Block::average(2).with_operation(Operation::Sync { buses: None }));
        let result = compile(
            &root,
            &two_buses(),
            &Calibration::new(),
            &CompilerSettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sync_inside_loop_aligns_per_iteration_skew() {
        let root = Block::sequential()
            .with_operation(Operation::Wait {
                bus: "drive".to_string(),
                duration: Value::Literal(100.0),
            })
            .with_operation(Operation::Sync { buses: None })
            .with_block(
                Block::average(3)
                    .with_operation(play("drive", 0.5, 40))
                    .with_operation(Operation::Sync { buses: None }),
            );
        let programs = compile(
            &root,
            &two_buses(),
            &Calibration::new(),
            &CompilerSettings::default(),
        )
        .unwrap();
        // Aligned before the loop, then re-padded by 40 ns every shot.
        assert_eq!(programs["drive"].duration, 8 + 100 + 3 * 40 + 4);
        assert_eq!(programs["drive"].duration, programs["readout"].duration);
        assert!(programs["readout"].program.contains("wait             40"));
    }

    #[test]
    fn test_sync_with_dynamic_timing_is_rejected() {
        let duration = Variable::new(0, "t", Domain::Time);
        let root = Block::sequential()
            .with_block(
                Block::for_loop(duration.clone(), 4.0, 20.0, 4.0).with_operation(Operation::Wait {
                    bus: "drive".to_string(),
                    duration: Value::Variable(duration.id),
                }),
            )
            .with_operation(Operation::Sync { buses: None });
        let result = compile(
            &root,
            &two_buses(),
            &Calibration::new(),
            &CompilerSettings::default(),
        );
        assert!(matches!(result, Err(Error::UnsupportedDynamicSync)));
    }

    #[test]
    fn test_dynamic_wait_emits_register_wait() {
        let duration = Variable::new(0, "t", Domain::Time);
        let root = Block::sequential().with_block(
            Block::for_loop(duration.clone(), 4.0, 20.0, 4.0).with_operation(Operation::Wait {
                bus: "readout".to_string(),
                duration: Value::Variable(duration.id),
            }),
        );
        let program = compile_one(&root, &CompilerSettings::default());
        assert!(program.dynamic);
        assert!(program.program.contains("wait             R1"));
        assert!(program.program.contains("add              R1, 4, R1"));
    }

    #[test]
    fn test_waveform_dedup() {
        let mut root = Block::sequential();
        for _ in 0..5 {
            root.push_operation(play("readout", 0.5, 100));
        }
        let program = compile_one(&root, &CompilerSettings::default());
        assert_eq!(program.waveforms.len(), 2);
        assert_eq!(
            program.program.matches("play             0, 1, 100").count(),
            5
        );
    }

    #[test]
    fn test_sibling_loops_reuse_registers() {
        // Pool size equals the peak usage of a single loop.
        let settings = CompilerSettings {
            register_pool_size: 1,
            ..CompilerSettings::default()
        };
        let root = Block::sequential()
            .with_block(Block::average(2).with_operation(play("readout", 0.1, 40)))
            .with_block(Block::average(2).with_operation(play("readout", 0.2, 40)));
        let program = compile_one(&root, &settings);
        assert!(program.program.contains("loop             R0, @avg_1"));
        assert!(program.program.contains("loop             R0, @avg_2"));
    }

    #[test]
    fn test_nested_loops_exhaust_small_pool() {
        let settings = CompilerSettings {
            register_pool_size: 1,
            ..CompilerSettings::default()
        };
        let root = Block::sequential().with_block(
            Block::average(2)
                .with_block(Block::average(2).with_operation(play("readout", 0.1, 40))),
        );
        let result = compile(&root, &readout_bus(), &Calibration::new(), &settings);
        assert!(matches!(result, Err(Error::RegisterExhausted { pool: 1 })));
    }

    #[test]
    fn test_for_loop_sweeps_gain() {
        let amp = Variable::new(0, "amp", Domain::Voltage);
        let root = Block::sequential().with_block(
            Block::for_loop(amp.clone(), 0.0, 1.0, 0.1)
                .with_operation(Operation::SetGain {
                    bus: "readout".to_string(),
                    gain: Value::Variable(amp.id),
                })
                .with_operation(play("readout", 0.2, 40)),
        );
        let program = compile_one(&root, &CompilerSettings::default());
        assert_eq!(program.duration, 8 + 11 * 40 + 4);
        assert!(program.program.contains("move             11, R0"));
        assert!(program.program.contains("move             0, R1"));
        assert!(program.program.contains("set_awg_gain     R1, R1"));
        assert!(program.program.contains("add              R1, 3277, R1"));
        assert!(program.program.contains("loop             R0, @loop_1"));
    }

    #[test]
    fn test_unreferenced_loop_variable_gets_no_register() {
        let amp = Variable::new(0, "amp", Domain::Voltage);
        let root = Block::sequential().with_block(
            Block::for_loop(amp, 0.0, 1.0, 0.1).with_operation(play("readout", 0.2, 40)),
        );
        let program = compile_one(&root, &CompilerSettings::default());
        assert!(program.program.contains("move             11, R0"));
        assert!(!program.program.contains("R1"));
    }

    #[test]
    fn test_parallel_loops_iterate_min() {
        let time = Variable::new(0, "t", Domain::Time);
        let gain = Variable::new(1, "g", Domain::Voltage);
        let root = Block::sequential().with_block(
            Block::parallel(vec![
                ForLoop::new(time, 0.0, 16.0, 4.0),
                ForLoop::new(gain.clone(), 0.0, 0.9, 0.1),
            ])
            .with_operation(Operation::SetGain {
                bus: "readout".to_string(),
                gain: Value::Variable(gain.id),
            })
            .with_operation(play("readout", 0.2, 40)),
        );
        let program = compile_one(&root, &CompilerSettings::default());
        // 5 lockstep iterations, the shorter of the two ranges.
        assert_eq!(program.duration, 8 + 5 * 40 + 4);
        assert!(program.program.contains("move             5, R0"));
        assert!(program.program.contains("add              R1, 3277, R1"));
    }

    #[test]
    fn test_nested_loops_multiply_bins() {
        let freq = Variable::new(0, "f", Domain::Frequency);
        let root = Block::sequential().with_block(
            Block::average(10).with_block(
                Block::for_loop(freq.clone(), 0.0, 4e6, 1e6)
                    .with_operation(Operation::SetFrequency {
                        bus: "readout".to_string(),
                        frequency: Value::Variable(freq.id),
                    })
                    .with_operation(acquire("readout", 100)),
            ),
        );
        let program = compile_one(&root, &CompilerSettings::default());
        assert_eq!(program.acquisitions["acq_0"].num_bins, 50);
        // The bin register lives outside the whole loop nest.
        assert!(program.program.contains("move             0, R0"));
        assert!(program.program.contains("acquire_weighed  0, R0, 0, 1, 4"));
        assert!(program.program.contains("add              R3, 4000000, R3"));
    }

    #[test]
    fn test_infinite_loop_emits_jump() {
        let root = Block::sequential()
            .with_block(Block::infinite_loop().with_operation(play("readout", 0.5, 100)));
        let program = compile_one(&root, &CompilerSettings::default());
        assert!(program.program.contains("infinite_1:"));
        assert!(program.program.contains("jmp              @infinite_1"));
        // One pass of the body; the loop never multiplies time.
        assert_eq!(program.duration, 8 + 100 + 4);
    }

    #[test]
    fn test_long_wait_is_split() {
        let root = Block::sequential().with_operation(Operation::Wait {
            bus: "readout".to_string(),
            duration: Value::Literal(200_000.0),
        });
        let program = compile_one(&root, &CompilerSettings::default());
        assert_eq!(program.duration, 8 + 200_000 + 4);
        assert_eq!(
            program.program.matches("wait             65532").count(),
            3
        );
        assert!(program.program.contains("wait             3404"));
        assert_eq!(
            sequencer_asm::generator::wait_total(program.instructions.lines()),
            200_000
        );
    }

    #[test]
    fn test_latched_set_folds_into_wait() {
        let root = Block::sequential()
            .with_operation(Operation::SetGain {
                bus: "readout".to_string(),
                gain: Value::Literal(1.0),
            })
            .with_operation(Operation::Wait {
                bus: "readout".to_string(),
                duration: Value::Literal(100.0),
            });
        let program = compile_one(&root, &CompilerSettings::default());
        // The update quantum comes out of the wait budget.
        assert_eq!(program.duration, 8 + 100 + 4);
        assert!(program.program.contains("set_awg_gain     32767, 32767"));
        assert!(program.program.contains("wait             96"));
    }

    #[test]
    fn test_parametric_waveform_is_skipped() {
        let root = Block::sequential().with_operation(Operation::Play {
            bus: "readout".to_string(),
            waveform: WaveformSource::Inline(IqPair {
                i: Envelope::Parametric {
                    variable: 0,
                    duration: 100,
                },
                q: Envelope::Square {
                    amplitude: 0.0,
                    duration: 100,
                },
            }),
            wait_time: None,
        });
        let program = compile_one(&root, &CompilerSettings::default());
        assert!(program.waveforms.is_empty());
        assert!(!program.program.contains("play"));
        assert_eq!(program.duration, 8 + 4);
    }

    #[test]
    fn test_repetition_period_enforced() {
        let settings = CompilerSettings {
            repetition_period: Some(50),
            ..CompilerSettings::default()
        };
        let root = Block::sequential()
            .with_block(Block::average(10).with_operation(play("readout", 0.5, 100)));
        let result = compile(&root, &readout_bus(), &Calibration::new(), &settings);
        assert!(matches!(
            result,
            Err(Error::DurationExceedsPeriod {
                duration: 100,
                period: 50,
                ..
            })
        ));
    }

    #[test]
    fn test_loop_count_beyond_register_width_is_rejected() {
        let root = Block::sequential()
            .with_block(Block::average(1_u64 << 33).with_operation(play("readout", 0.5, 40)));
        let result = compile(
            &root,
            &readout_bus(),
            &Calibration::new(),
            &CompilerSettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_step_is_rejected() {
        let amp = Variable::new(0, "amp", Domain::Voltage);
        let root = Block::sequential()
            .with_block(Block::for_loop(amp, 0.0, 1.0, 0.0).with_operation(play("readout", 0.2, 40)));
        let result = compile(
            &root,
            &readout_bus(),
            &Calibration::new(),
            &CompilerSettings::default(),
        );
        assert!(matches!(result, Err(Error::InvalidRange)));
    }

    #[test]
    fn test_measure_inserts_time_of_flight() {
        let buses = IndexMap::from([(
            "readout".to_string(),
            BusConfig {
                sequencer: "q0_readout".to_string(),
                time_of_flight: 120,
                ..BusConfig::default()
            },
        )]);
        let root = Block::sequential().with_operation(Operation::Measure {
            bus: "readout".to_string(),
            waveform: IqPair::square(0.3, 100).into(),
            weights: IqPair::square(1.0, 100).into(),
        });
        let programs = compile(
            &root,
            &buses,
            &Calibration::new(),
            &CompilerSettings::default(),
        )
        .unwrap();
        let program = &programs["readout"];
        assert_eq!(program.duration, 8 + 100 + 120 + 4 + 4);
        assert!(program.program.contains("play             0, 1, 100"));
        assert!(program.program.contains("wait             120"));
        // Top-level acquisition: a single bin addressed immediately.
        assert!(program.program.contains("acquire_weighed  0, 0, 0, 1, 4"));
        assert_eq!(program.acquisitions["acq_0"].num_bins, 1);
        // Loop-free program: the straight-line reading agrees with the
        // folded timeline.
        assert_eq!(program.instructions.linear_duration(), program.duration);
    }

    #[test]
    fn test_per_bus_delay_becomes_initial_wait() {
        let buses = IndexMap::from([(
            "readout".to_string(),
            BusConfig {
                sequencer: "q0_readout".to_string(),
                delay: 100,
                ..BusConfig::default()
            },
        )]);
        let root = Block::sequential().with_operation(play("readout", 0.5, 40));
        let programs = compile(
            &root,
            &buses,
            &Calibration::new(),
            &CompilerSettings::default(),
        )
        .unwrap();
        let program = &programs["readout"];
        assert_eq!(program.duration, 8 + 100 + 40 + 4);
        let delay_position = program.program.find("wait             100").unwrap();
        let play_position = program.program.find("play").unwrap();
        assert!(delay_position < play_position);
    }

    #[test]
    fn test_named_waveform_resolved_via_calibration() {
        let mut calibration = Calibration::new();
        calibration.set_waveform("pi", IqPair::square(0.5, 40));
        let root = Block::sequential().with_operation(Operation::Play {
            bus: "readout".to_string(),
            waveform: WaveformSource::Named("pi".to_string()),
            wait_time: None,
        });
        let programs = compile(
            &root,
            &readout_bus(),
            &calibration,
            &CompilerSettings::default(),
        )
        .unwrap();
        assert_eq!(programs["readout"].waveforms.len(), 2);

        let missing = Block::sequential().with_operation(Operation::Play {
            bus: "readout".to_string(),
            waveform: WaveformSource::Named("nope".to_string()),
            wait_time: None,
        });
        assert!(
            compile(
                &missing,
                &readout_bus(),
                &calibration,
                &CompilerSettings::default()
            )
            .is_err()
        );
    }

    #[test]
    fn test_long_square_play_becomes_repeat_loop() {
        let root = Block::sequential().with_operation(play("readout", 0.5, 2000));
        let program = compile_one(&root, &CompilerSettings::default());
        assert_eq!(program.duration, 8 + 2000 + 4);
        assert!(program.program.contains("move             20, R0"));
        assert!(program.program.contains("square_0:"));
        assert!(program.program.contains("play             0, 1, 100"));
        assert!(program.program.contains("loop             R0, @square_0"));
        // Only the chunk is stored, per component.
        assert_eq!(program.waveforms["waveform_0"].samples.len(), 100);
    }

    #[test]
    fn test_output_is_deterministic() {
        let make = || {
            Block::sequential().with_block(
                Block::average(4)
                    .with_operation(play("readout", 0.4, 100))
                    .with_operation(acquire("readout", 100)),
            )
        };
        let first = compile_one(&make(), &CompilerSettings::default());
        let second = compile_one(&make(), &CompilerSettings::default());
        assert_eq!(first.program, second.program);
        assert_eq!(first.waveforms, second.waveforms);
        assert_eq!(first.duration, second.duration);
    }

    #[test]
    fn test_timing_comments_behind_flag() {
        let settings = CompilerSettings {
            emit_timing_comments: true,
            ..CompilerSettings::default()
        };
        let root = Block::sequential().with_operation(play("readout", 0.5, 40));
        let program = compile_one(&root, &settings);
        assert!(program.program.contains("# t=8 ns"));
        let plain = compile_one(&root, &CompilerSettings::default());
        assert!(!plain.program.contains("# t="));
    }
}
