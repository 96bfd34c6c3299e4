/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Top level interface of the trace register allocator.
//!
//! The client hands in a trace of LIR blocks through the [`Function`] trait,
//! a register file description, a move factory and a frame builder.  The
//! allocator mutates the LIR in place: operand slots are rewritten to
//! registers, stack slots or rematerialized constants, and resolution moves
//! are inserted at instruction gaps and intra-trace block edges.

use std::fmt;

use log::info;

use crate::analysis;
use crate::checker;
use crate::eliminate;
use crate::inst_stream::{self, EditSet};
use crate::linear_scan;
use crate::resolution;

pub use crate::data_structures::{
  AllocatedOperand, BlockId, ConstValue, FixedInterval, IntervalId,
  IntervalStore, LiveRange, Location, Numbering, OpId, Operand, OperandMode,
  RegNum, SpillSlot, SpillState, TraceInterval, UseKind, UsePos, ValueKind,
  VarId,
};

//=============================================================================
// Register file description

/// Register class as seen by the allocator; the value kind of an interval
/// selects the class it can live in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegClass {
  Gpr,
  Fpr,
}

impl RegClass {
  pub fn of(kind: ValueKind) -> RegClass {
    match kind {
      ValueKind::Int | ValueKind::Reference => RegClass::Gpr,
      ValueKind::Float => RegClass::Fpr,
    }
  }
}

/// Attributes of one register in the target description.
#[derive(Clone, Copy, Debug)]
pub struct RegisterDescr {
  pub class: RegClass,
  pub allocatable: bool,
  pub caller_saved: bool,
}

/// The architecture register file plus the calling convention, as far as
/// allocation is concerned.  Register numbers index the descriptor table.
pub struct RegisterConfig {
  regs: Vec<RegisterDescr>,
}

impl RegisterConfig {
  pub fn new(regs: Vec<RegisterDescr>) -> RegisterConfig {
    RegisterConfig { regs }
  }

  pub fn num_regs(&self) -> usize {
    self.regs.len()
  }

  pub fn descr(&self, reg: RegNum) -> &RegisterDescr {
    &self.regs[reg.index()]
  }

  pub fn is_allocatable(&self, reg: RegNum) -> bool {
    self.regs[reg.index()].allocatable
  }

  pub fn is_caller_saved(&self, reg: RegNum) -> bool {
    self.regs[reg.index()].caller_saved
  }

  /// Allocatable registers of a class, ascending by number.
  pub fn allocatable_regs(
    &self, class: RegClass,
  ) -> impl Iterator<Item = RegNum> + '_ {
    self
      .regs
      .iter()
      .enumerate()
      .filter(move |(_, d)| d.allocatable && d.class == class)
      .map(|(i, _)| RegNum::new(i as u8))
  }

  /// Allocatable caller-saved registers, all classes.
  pub fn caller_saved_regs(&self) -> impl Iterator<Item = RegNum> + '_ {
    self
      .regs
      .iter()
      .enumerate()
      .filter(|(_, d)| d.allocatable && d.caller_saved)
      .map(|(i, _)| RegNum::new(i as u8))
  }

  /// When every allocatable register is caller-saved, a call kills all
  /// registers and everything live across it must go to memory.
  pub fn all_allocatable_caller_saved(&self) -> bool {
    self
      .regs
      .iter()
      .filter(|d| d.allocatable)
      .all(|d| d.caller_saved)
  }
}

//=============================================================================
// Client traits

/// Access to the client's LIR and trace.  The trace is the ordered block
/// list returned by `blocks()`; successors may point outside the trace
/// (those edges are resolved by a separate cross-trace pass, not here).
///
/// Entry-block parameters are modelled as outputs of the entry block's
/// first (label) instruction.
pub trait Function {
  type Inst: Clone;

  /// Blocks of the trace, in linear order.
  fn blocks(&self) -> &[BlockId];

  /// CFG successors of a block, on or off the trace.
  fn block_succs(&self, block: BlockId) -> Vec<BlockId>;

  fn insns(&self, block: BlockId) -> &[Self::Inst];

  fn insns_mut(&mut self, block: BlockId) -> &mut Vec<Self::Inst>;

  /// Number of virtual variables; `VarId`s are dense below this.
  fn num_vars(&self) -> usize;

  fn var_kind(&self, var: VarId) -> ValueKind;

  /// Report every operand slot of an instruction together with its mode,
  /// how much it wants a register, and its value kind.
  fn visit_operands(
    inst: &Self::Inst,
    visitor: &mut dyn FnMut(Operand, OperandMode, UseKind, ValueKind),
  );

  /// Rewrite operand slots.  The mapper returns `None` to leave a slot
  /// unchanged (registers, immediates).
  fn map_operands(
    inst: &mut Self::Inst,
    mapper: &mut dyn FnMut(Operand, OperandMode) -> Option<AllocatedOperand>,
  );

  /// `Some((dst, src))` when the instruction is a plain move; feeds the
  /// register hint and the spill-move eliminator.
  fn as_move(inst: &Self::Inst) -> Option<(Operand, Operand)>;

  /// `Some((dst, value))` when the instruction loads a constant that could
  /// be rematerialized instead of spilled.
  fn as_constant_load(inst: &Self::Inst) -> Option<(Operand, ConstValue)>;

  /// Does the instruction clobber all caller-saved registers (a call)?
  fn destroys_caller_saved(&self, inst: &Self::Inst) -> bool;

  /// Does the instruction carry a safepoint state map?
  fn has_state(&self, inst: &Self::Inst) -> bool;
}

/// Produces target-specific move instructions for insertion into the LIR.
pub trait MoveFactory<I> {
  fn make_move(&mut self, dst: AllocatedOperand, src: AllocatedOperand) -> I;

  fn make_materialize(&mut self, dst: AllocatedOperand, value: ConstValue)
    -> I;

  /// May `value` be rematerialized (including directly into a stack slot)
  /// instead of being kept in a register or spilled?
  fn allow_constant_to_stack_move(&self, value: ConstValue) -> bool;
}

/// The frame builder owns spill slots; the allocator only holds
/// identifiers.
pub trait FrameBuilder {
  fn allocate_spill_slot(&mut self, kind: ValueKind) -> SpillSlot;
}

//=============================================================================
// Options, caches, stats

#[derive(Clone, Debug)]
pub struct AllocationOptions {
  /// Constants are never spilled to the stack; they are forced back into a
  /// register after calls instead of being rematerialized.
  pub never_spill_constants: bool,
  /// Run the verifier after allocation.
  pub detailed_asserts: bool,
  /// Run the spill-move elimination phase.
  pub eliminate_spill_moves: bool,
  /// Reuse one stack slot per variable across traces of a compilation.
  pub cache_stack_slots: bool,
}

impl Default for AllocationOptions {
  fn default() -> Self {
    AllocationOptions {
      never_spill_constants: false,
      detailed_asserts: cfg!(debug_assertions),
      eliminate_spill_moves: true,
      cache_stack_slots: true,
    }
  }
}

/// Per-compilation map from variable index to its spill slot, owned by the
/// pass manager and shared by all traces of one compilation so a variable
/// keeps one canonical slot.
pub struct CachedStackSlots {
  slots: Vec<Option<(SpillSlot, ValueKind)>>,
}

impl CachedStackSlots {
  pub fn new(num_vars: usize) -> CachedStackSlots {
    let mut slots = Vec::with_capacity(num_vars);
    slots.resize_with(num_vars, || None);
    CachedStackSlots { slots }
  }

  pub fn get(&self, var: VarId, kind: ValueKind) -> Option<SpillSlot> {
    match self.slots.get(var.index()).copied().flatten() {
      Some((slot, cached_kind)) => {
        debug_assert!(cached_kind == kind, "cached stack slot kind mismatch");
        Some(slot)
      }
      None => None,
    }
  }

  pub fn set(&mut self, var: VarId, slot: SpillSlot, kind: ValueKind) {
    self.slots[var.index()] = Some((slot, kind));
  }
}

/// Named diagnostic counters; none affect semantics.
#[derive(Clone, Debug, Default)]
pub struct Stats {
  /// Spill slots served from the per-compilation cache.
  pub global_stack_slots: u32,
  /// Spill slots newly allocated from the frame builder.
  pub allocated_stack_slots: u32,
}

//=============================================================================
// Errors

/// Allocation bailouts.  Any of these means "this trace cannot be allocated
/// here"; the caller falls back to a non-trace allocator for the
/// compilation.  Internal invariant violations are panics, not errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
  /// No split child of the variable's family covers the requested
  /// position.
  SplitChildMiss { var: VarId, pos: OpId },
  /// A must-have-register use cannot be honored at its own position.
  OutOfRegisters { kind: ValueKind, pos: OpId },
  /// The verifier rejected the finished allocation.
  Verifier(String),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::SplitChildMiss { var, pos } => {
        write!(fmt, "no split child of {:?} at {:?}", var, pos)
      }
      RegAllocError::OutOfRegisters { kind, pos } => {
        write!(fmt, "out of {:?} registers at {:?}", kind, pos)
      }
      RegAllocError::Verifier(msg) => {
        write!(fmt, "verification failed: {}", msg)
      }
    }
  }
}

impl std::error::Error for RegAllocError {}

//=============================================================================
// Entry points

/// Allocate registers for one trace.  On success the LIR has been mutated
/// in place and the finalized interval store is returned for diagnostics.
/// On a bailout the LIR may be partially rewritten; the caller is expected
/// to have snapshotted it (or to run allocation on a clone).
pub fn allocate_registers<F, M, B>(
  func: &mut F, config: &RegisterConfig, moves: &mut M, frame: &mut B,
  cached_slots: &mut CachedStackSlots, opts: &AllocationOptions,
  stats: &mut Stats,
) -> Result<IntervalStore, RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
  B: FrameBuilder,
{
  run(func, config, moves, frame, cached_slots, opts, stats, None)
}

/// Re-entry with a pre-computed interval store (e.g. after a bailout
/// retry); lifetime analysis is skipped.
pub fn allocate_registers_with_intervals<F, M, B>(
  func: &mut F, config: &RegisterConfig, moves: &mut M, frame: &mut B,
  cached_slots: &mut CachedStackSlots, opts: &AllocationOptions,
  stats: &mut Stats, intervals: IntervalStore,
) -> Result<IntervalStore, RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
  B: FrameBuilder,
{
  run(
    func,
    config,
    moves,
    frame,
    cached_slots,
    opts,
    stats,
    Some(intervals),
  )
}

fn run<F, M, B>(
  func: &mut F, config: &RegisterConfig, moves: &mut M, frame: &mut B,
  cached_slots: &mut CachedStackSlots, opts: &AllocationOptions,
  stats: &mut Stats, prebuilt: Option<IntervalStore>,
) -> Result<IntervalStore, RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
  B: FrameBuilder,
{
  info!("trace linear scan: begin");

  let mut store = match prebuilt {
    Some(store) => store,
    None => analysis::run_lifetime_analysis(func, config, moves, opts),
  };
  store.print_intervals("before allocation");

  linear_scan::run_allocation(
    &mut store,
    config,
    frame,
    cached_slots,
    opts,
    stats,
  )?;
  store.print_intervals("after allocation");

  let mut edits = EditSet::new();
  resolution::resolve_data_flow(func, &store, moves, frame, &mut edits)?;

  if opts.eliminate_spill_moves {
    eliminate::eliminate_spill_moves(func, &store, moves, &mut edits)?;
  }

  inst_stream::assign_locations(func, &store)?;

  // Verify against the numbered stream, before the splice shifts
  // instruction slots.
  if opts.detailed_asserts {
    checker::verify(func, &store, config)?;
  }

  inst_stream::apply_edits(func, &store, edits);

  info!("trace linear scan: end");
  Ok(store)
}
