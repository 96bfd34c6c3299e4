/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Core data structures: instruction numbering, operands, live ranges, use
//! positions, variable/fixed intervals and the interval store.

use std::cmp::Ordering;
use std::fmt;

use smallvec::SmallVec;

use crate::interface::Function;

//=============================================================================
// Instruction ids and gap positions

/// A position in the numbered trace.  Instructions sit at even positions,
/// assigned in trace order starting at 0; the odd position between two
/// instructions is the gap where resolution moves are inserted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(u32);

impl OpId {
  pub fn new(n: u32) -> Self {
    OpId(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn is_even(self) -> bool {
    self.0 & 1 == 0
  }
  /// Dense index for per-instruction tables; the gap following an
  /// instruction shares the instruction's index.
  pub fn index(self) -> usize {
    (self.0 >> 1) as usize
  }
  /// The gap position just before this instruction.
  pub fn gap_before(self) -> OpId {
    debug_assert!(self.0 > 0);
    OpId(self.0 - 1)
  }
  /// The gap position just after this instruction (`id | 1`).
  pub fn gap_after(self) -> OpId {
    OpId(self.0 | 1)
  }
  pub fn plus(self, n: u32) -> OpId {
    OpId(self.0 + n)
  }
  pub fn minus(self, n: u32) -> OpId {
    debug_assert!(self.0 >= n);
    OpId(self.0 - n)
  }
  pub fn min_value() -> OpId {
    OpId(0)
  }
  pub fn max_value() -> OpId {
    OpId(u32::MAX)
  }
}

impl fmt::Debug for OpId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "op{}", self.0)
  }
}

//=============================================================================
// Blocks, variables, registers, slots

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
  pub fn new(n: u32) -> Self {
    BlockId(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
}

impl fmt::Debug for BlockId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "b{}", self.0)
  }
}

/// A virtual operand, densely numbered by the LIR.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(u32);

impl VarId {
  pub fn new(n: u32) -> Self {
    VarId(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for VarId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "v{}", self.0)
  }
}

/// A physical register number from the target description.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegNum(u8);

impl RegNum {
  pub fn new(n: u8) -> Self {
    RegNum(n)
  }
  pub fn get(self) -> u8 {
    self.0
  }
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for RegNum {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "r{}", self.0)
  }
}

/// A spill slot identifier owned by the frame builder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpillSlot(u32);

impl SpillSlot {
  pub fn new(n: u32) -> Self {
    SpillSlot(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
}

impl fmt::Debug for SpillSlot {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "slot{}", self.0)
  }
}

//=============================================================================
// Operands, value kinds, locations

/// An unallocated operand slot in the LIR: either one of the allocator's
/// unknowns (a variable) or a pre-colored physical register.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
  Var(VarId),
  Reg(RegNum),
}

impl Operand {
  pub fn as_var(self) -> Option<VarId> {
    match self {
      Operand::Var(v) => Some(v),
      Operand::Reg(_) => None,
    }
  }
  pub fn as_reg(self) -> Option<RegNum> {
    match self {
      Operand::Reg(r) => Some(r),
      Operand::Var(_) => None,
    }
  }
}

impl fmt::Debug for Operand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Operand::Var(v) => v.fmt(fmt),
      Operand::Reg(r) => r.fmt(fmt),
    }
  }
}

/// Value category of an operand; selects the register class and the spill
/// slot kind.  Reference values additionally constrain fixed intervals at
/// safepoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
  Int,
  Float,
  Reference,
}

/// How much an instruction wants a register for an operand use.  Ordered:
/// queries ask for "next use of kind >= k".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UseKind {
  NoUse,
  ShouldHaveRegister,
  MustHaveRegister,
}

/// The role of an operand occurrence within an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandMode {
  Input,
  Alive,
  Temp,
  Output,
}

/// Where an interval's value lives after allocation.  `Illegal` marks a
/// rematerialized interval: uses are rewritten to the constant instead of a
/// memory reload.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Location {
  Unassigned,
  Reg(RegNum),
  Stack(SpillSlot),
  Illegal,
}

impl Location {
  pub fn reg(self) -> Option<RegNum> {
    match self {
      Location::Reg(r) => Some(r),
      _ => None,
    }
  }
  pub fn stack(self) -> Option<SpillSlot> {
    match self {
      Location::Stack(s) => Some(s),
      _ => None,
    }
  }
  pub fn is_unassigned(self) -> bool {
    self == Location::Unassigned
  }
  pub fn is_illegal(self) -> bool {
    self == Location::Illegal
  }
}

impl fmt::Debug for Location {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Location::Unassigned => write!(fmt, "none"),
      Location::Reg(r) => r.fmt(fmt),
      Location::Stack(s) => s.fmt(fmt),
      Location::Illegal => write!(fmt, "remat"),
    }
  }
}

/// A constant payload that can be rematerialized at a use site.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstValue(i64);

impl ConstValue {
  pub fn new(v: i64) -> Self {
    ConstValue(v)
  }
  pub fn get(self) -> i64 {
    self.0
  }
}

impl fmt::Debug for ConstValue {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "#{}", self.0)
  }
}

/// A fully allocated operand, as written back into the LIR.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AllocatedOperand {
  Reg(RegNum, ValueKind),
  Stack(SpillSlot, ValueKind),
  Constant(ConstValue),
}

impl AllocatedOperand {
  pub fn kind(self) -> Option<ValueKind> {
    match self {
      AllocatedOperand::Reg(_, k) | AllocatedOperand::Stack(_, k) => Some(k),
      AllocatedOperand::Constant(_) => None,
    }
  }
}

impl fmt::Debug for AllocatedOperand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AllocatedOperand::Reg(r, _) => r.fmt(fmt),
      AllocatedOperand::Stack(s, _) => s.fmt(fmt),
      AllocatedOperand::Constant(c) => c.fmt(fmt),
    }
  }
}

//=============================================================================
// Live ranges and use positions

/// A half-open interval `[from, to)` over trace positions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
  pub from: OpId,
  pub to: OpId,
}

impl LiveRange {
  pub fn new(from: OpId, to: OpId) -> Self {
    debug_assert!(from < to, "empty live range");
    LiveRange { from, to }
  }
  pub fn covers(&self, pos: OpId) -> bool {
    self.from <= pos && pos < self.to
  }
  pub fn intersects(&self, other: &LiveRange) -> bool {
    self.from < other.to && other.from < self.to
  }
}

impl fmt::Debug for LiveRange {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{}, {})", self.from.get(), self.to.get())
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UsePos {
  pub pos: OpId,
  pub kind: UseKind,
}

/// Prepend-or-merge for the backward range build: the lifetime scan visits
/// positions in decreasing order, so a new range either extends the current
/// first range downwards or lands strictly before it.
fn add_range_front<A>(ranges: &mut SmallVec<A>, from: OpId, to: OpId)
where
  A: smallvec::Array<Item = LiveRange>,
{
  debug_assert!(from < to, "adding empty range");
  if let Some(first) = ranges.first_mut() {
    if to >= first.from {
      first.from = first.from.min(from);
      first.to = first.to.max(to);
      return;
    }
  }
  ranges.insert(0, LiveRange { from, to });
}

fn ranges_cover<A>(ranges: &SmallVec<A>, pos: OpId) -> bool
where
  A: smallvec::Array<Item = LiveRange>,
{
  ranges
    .binary_search_by(|r| {
      if pos < r.from {
        Ordering::Greater
      } else if pos >= r.to {
        Ordering::Less
      } else {
        Ordering::Equal
      }
    })
    .is_ok()
}

/// First position where two sorted range lists intersect.
fn ranges_intersection(
  left: &[LiveRange], right: &[LiveRange],
) -> Option<OpId> {
  let mut li = 0;
  let mut ri = 0;
  while li < left.len() && ri < right.len() {
    let l = &left[li];
    let r = &right[ri];
    if l.intersects(r) {
      return Some(l.from.max(r.from));
    }
    if l.to <= r.from {
      li += 1;
    } else {
      ri += 1;
    }
  }
  None
}

//=============================================================================
// Spill state

/// Where the spill-move eliminator stands with respect to one split family.
/// Transitions are kept conservative; a family only reaches
/// `StoreAtDefinition` when hoisting the store to the definition is known to
/// pay off (more than one spilled part).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillState {
  /// No definition encountered yet (initial state).
  NoDefinitionFound,
  /// The definition position is known.
  OneDefinitionFound,
  /// One part of the family has been spilled; a single store is inserted
  /// at the split position.
  OneMoveInserted,
  /// Several parts spill; store once at the definition instead.
  StoreAtDefinition,
  /// The interval starts out in memory; no store needed.
  StartInMemory,
  /// Spill store optimization disabled for this family.
  NoOptimization,
}

//=============================================================================
// Numbering & instruction index

/// Tables built by pre-walking the trace in linear order: each instruction
/// gets the next even id, and positions map back to blocks and instruction
/// slots.  The tables stay valid for the whole allocation because the LIR is
/// only mutated by the final splice.
pub struct Numbering {
  /// Trace blocks in linear order.
  blocks: Vec<BlockId>,
  /// Per instruction index: containing block.
  block_of: Vec<BlockId>,
  /// Per instruction index: (block, index within the block's list).
  slot_of: Vec<(BlockId, usize)>,
  /// Per trace position: id of the block's first/last instruction.
  block_first: Vec<OpId>,
  block_last: Vec<OpId>,
  /// Per instruction index: destroys all caller-saved registers.
  has_call: Vec<bool>,
  /// Per instruction index: carries a safepoint state map.
  has_state: Vec<bool>,
}

impl Numbering {
  /// Number all instructions of the trace.  Ids strictly increase in trace
  /// order, consecutive instructions differ by 2, all ids are even.
  pub fn compute<F: Function>(func: &F) -> Numbering {
    let blocks: Vec<BlockId> = func.blocks().to_vec();
    let mut block_of = Vec::new();
    let mut slot_of = Vec::new();
    let mut block_first = Vec::new();
    let mut block_last = Vec::new();
    let mut has_call = Vec::new();
    let mut has_state = Vec::new();

    let mut next_id = 0u32;
    for &b in &blocks {
      let insns = func.insns(b);
      assert!(!insns.is_empty(), "empty block {:?} in trace", b);
      block_first.push(OpId::new(next_id));
      for (i, inst) in insns.iter().enumerate() {
        block_of.push(b);
        slot_of.push((b, i));
        has_call.push(func.destroys_caller_saved(inst));
        has_state.push(func.has_state(inst));
        next_id += 2;
      }
      block_last.push(OpId::new(next_id - 2));
    }

    Numbering {
      blocks,
      block_of,
      slot_of,
      block_first,
      block_last,
      has_call,
      has_state,
    }
  }

  pub fn blocks(&self) -> &[BlockId] {
    &self.blocks
  }

  pub fn num_insts(&self) -> usize {
    self.block_of.len()
  }

  /// Highest instruction id assigned.
  pub fn max_op_id(&self) -> OpId {
    debug_assert!(!self.block_of.is_empty());
    OpId::new((self.block_of.len() as u32 - 1) * 2)
  }

  /// The block containing a position.  A gap belongs to the block of the
  /// preceding instruction.
  pub fn block_for(&self, pos: OpId) -> BlockId {
    self.block_of[pos.index()]
  }

  /// Where the instruction with the given id sits in the LIR.
  pub fn inst_slot(&self, id: OpId) -> (BlockId, usize) {
    debug_assert!(id.is_even(), "{:?} is a gap, not an instruction", id);
    self.slot_of[id.index()]
  }

  fn trace_index(&self, block: BlockId) -> usize {
    // Traces are short; a linear probe beats a map here.
    self
      .blocks
      .iter()
      .position(|&b| b == block)
      .expect("block not on trace")
  }

  pub fn block_first_id(&self, block: BlockId) -> OpId {
    self.block_first[self.trace_index(block)]
  }

  pub fn block_last_id(&self, block: BlockId) -> OpId {
    self.block_last[self.trace_index(block)]
  }

  pub fn is_block_begin(&self, id: OpId) -> bool {
    id == OpId::min_value() || self.block_for(id) != self.block_for(id.minus(1))
  }

  pub fn is_block_end(&self, id: OpId) -> bool {
    let next = id.gap_after().plus(1);
    next.index() >= self.num_insts() || self.is_block_begin(next)
  }

  /// Does the instruction at `id` clobber all caller-saved registers?
  pub fn has_call(&self, id: OpId) -> bool {
    debug_assert!(id.is_even(), "opId not even");
    self.has_call[id.index()]
  }

  /// Does the instruction at `id` carry a safepoint state map?
  pub fn has_state(&self, id: OpId) -> bool {
    debug_assert!(id.is_even(), "opId not even");
    self.has_state[id.index()]
  }

  #[cfg(test)]
  pub fn for_test(
    blocks: Vec<BlockId>, block_of: Vec<BlockId>,
    block_first: Vec<OpId>, block_last: Vec<OpId>,
  ) -> Numbering {
    let n = block_of.len();
    let slot_of = block_of.iter().map(|&b| (b, 0)).collect();
    Numbering {
      blocks,
      block_of,
      slot_of,
      block_first,
      block_last,
      has_call: vec![false; n],
      has_state: vec![false; n],
    }
  }
}

//=============================================================================
// Variable intervals

/// Arena index of a variable interval.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalId(u32);

impl IntervalId {
  pub fn new(n: usize) -> Self {
    IntervalId(n as u32)
  }
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for IntervalId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "int{}", self.0)
  }
}

/// The live ranges and use positions of one virtual value, or of a split
/// child thereof.  Spill bookkeeping (canonical slot, spill state,
/// definition position) lives on the split parent and is reached through
/// the store's family accessors.
pub struct TraceInterval {
  /// This interval's own arena index.
  pub operand_number: u32,
  /// The original variable; split children keep the parent's.
  pub var: VarId,
  pub kind: ValueKind,
  ranges: SmallVec<[LiveRange; 2]>,
  use_positions: SmallVec<[UsePos; 4]>,
  pub location: Location,
  spill_slot: Option<SpillSlot>,
  spill_state: SpillState,
  spill_definition_pos: Option<OpId>,
  /// Root of the split family; self for unsplit intervals.
  pub split_parent: IntervalId,
  /// On the family root only: all family members (root included), ordered
  /// by `from()`.  Empty while unsplit.
  split_children: Vec<IntervalId>,
  /// Set when the value is a trivially materializable constant; spilling
  /// this family degrades to rematerialize-on-use.
  pub material: Option<ConstValue>,
  /// Move-coalescing hint: the interval feeding this one's definition.
  pub location_hint: Option<IntervalId>,
}

impl TraceInterval {
  fn new(operand_number: u32, var: VarId, kind: ValueKind) -> Self {
    TraceInterval {
      operand_number,
      var,
      kind,
      ranges: SmallVec::new(),
      use_positions: SmallVec::new(),
      location: Location::Unassigned,
      spill_slot: None,
      spill_state: SpillState::NoDefinitionFound,
      spill_definition_pos: None,
      split_parent: IntervalId::new(operand_number as usize),
      split_children: Vec::new(),
      material: None,
      location_hint: None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  pub fn from(&self) -> OpId {
    self.ranges.first().map_or(OpId::max_value(), |r| r.from)
  }

  pub fn to(&self) -> OpId {
    self.ranges.last().map_or(OpId::min_value(), |r| r.to)
  }

  pub fn ranges(&self) -> &[LiveRange] {
    &self.ranges
  }

  pub fn covers(&self, pos: OpId) -> bool {
    ranges_cover(&self.ranges, pos)
  }

  /// Is `pos` inside a lifetime hole (between `from()` and `to()` but not
  /// covered)?
  pub fn in_hole(&self, pos: OpId) -> bool {
    self.from() <= pos && pos < self.to() && !self.covers(pos)
  }

  pub fn first_intersection(&self, other: &TraceInterval) -> Option<OpId> {
    ranges_intersection(&self.ranges, &other.ranges)
  }

  pub fn first_intersection_with_fixed(
    &self, fixed: &FixedInterval,
  ) -> Option<OpId> {
    ranges_intersection(&self.ranges, &fixed.ranges)
  }

  pub fn add_range(&mut self, from: OpId, to: OpId) {
    add_range_front(&mut self.ranges, from, to);
  }

  /// A definition closes the currently open range.
  pub fn set_from(&mut self, pos: OpId) {
    debug_assert!(!self.ranges.is_empty(), "set_from on empty interval");
    let first = self.ranges.first_mut().unwrap();
    debug_assert!(pos < first.to);
    first.from = pos;
  }

  pub fn add_use(&mut self, pos: OpId, kind: UseKind) {
    // The backward scan mostly prepends; fall back to a sorted insert for
    // same-instruction visits.
    let at = self
      .use_positions
      .iter()
      .position(|u| u.pos >= pos)
      .unwrap_or(self.use_positions.len());
    self.use_positions.insert(at, UsePos { pos, kind });
  }

  pub fn use_positions(&self) -> &[UsePos] {
    &self.use_positions
  }

  /// Next use of kind >= `min_kind` at or after `pos`.
  pub fn next_use_after(&self, pos: OpId, min_kind: UseKind) -> Option<OpId> {
    self
      .use_positions
      .iter()
      .find(|u| u.pos >= pos && u.kind >= min_kind)
      .map(|u| u.pos)
  }

  pub fn first_use(&self, min_kind: UseKind) -> Option<OpId> {
    self.next_use_after(OpId::min_value(), min_kind)
  }
}

//=============================================================================
// Fixed intervals

/// Live ranges of one physical register over the trace: register operands,
/// temps and call clobbers.  No use positions; fixed intervals only block
/// registers during allocation.
pub struct FixedInterval {
  pub reg: RegNum,
  ranges: SmallVec<[LiveRange; 4]>,
  /// Sub-ranges during which the register holds a reference-kind value;
  /// checked against safepoints by the verifier.  Call-clobber ranges carry
  /// no value and never appear here.
  ref_ranges: SmallVec<[LiveRange; 2]>,
}

impl FixedInterval {
  fn new(reg: RegNum) -> Self {
    FixedInterval {
      reg,
      ranges: SmallVec::new(),
      ref_ranges: SmallVec::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  pub fn from(&self) -> OpId {
    self.ranges.first().map_or(OpId::max_value(), |r| r.from)
  }

  pub fn to(&self) -> OpId {
    self.ranges.last().map_or(OpId::min_value(), |r| r.to)
  }

  pub fn ranges(&self) -> &[LiveRange] {
    &self.ranges
  }

  pub fn covers(&self, pos: OpId) -> bool {
    ranges_cover(&self.ranges, pos)
  }

  pub fn add_range(&mut self, from: OpId, to: OpId) {
    add_range_front(&mut self.ranges, from, to);
  }

  pub fn add_ref_range(&mut self, from: OpId, to: OpId) {
    add_range_front(&mut self.ref_ranges, from, to);
  }

  pub fn ref_ranges(&self) -> &[LiveRange] {
    &self.ref_ranges
  }
}

//=============================================================================
// The interval store

/// Owns all intervals of one allocation: one variable interval per virtual
/// operand encountered, one fixed interval per touched register, plus an
/// append-only region of split children derived during allocation.
pub struct IntervalStore {
  numbering: Numbering,
  intervals: Vec<Option<TraceInterval>>,
  fixed: Vec<Option<FixedInterval>>,
  num_vars: usize,
  /// Positions of instructions that clobber caller-saved registers,
  /// ascending.
  call_positions: Vec<OpId>,
}

impl IntervalStore {
  pub fn new(
    numbering: Numbering, num_vars: usize, num_regs: usize,
  ) -> IntervalStore {
    let mut intervals = Vec::with_capacity(num_vars + 8);
    intervals.resize_with(num_vars, || None);
    let mut fixed = Vec::with_capacity(num_regs);
    fixed.resize_with(num_regs, || None);
    IntervalStore {
      numbering,
      intervals,
      fixed,
      num_vars,
      call_positions: Vec::new(),
    }
  }

  pub fn numbering(&self) -> &Numbering {
    &self.numbering
  }

  pub fn max_op_id(&self) -> OpId {
    self.numbering.max_op_id()
  }

  pub fn intervals_len(&self) -> usize {
    self.intervals.len()
  }

  /// Index of the first split child; everything below is a root (or an
  /// untouched variable slot).
  pub fn first_derived_index(&self) -> usize {
    self.num_vars
  }

  pub fn has_derived_intervals(&self) -> bool {
    self.intervals.len() > self.num_vars
  }

  pub fn get(&self, id: IntervalId) -> &TraceInterval {
    self.intervals[id.index()]
      .as_ref()
      .expect("interval slot is vacant")
  }

  pub fn get_mut(&mut self, id: IntervalId) -> &mut TraceInterval {
    self.intervals[id.index()]
      .as_mut()
      .expect("interval slot is vacant")
  }

  /// All populated interval ids, roots first, split children after.
  pub fn ids(&self) -> impl Iterator<Item = IntervalId> + '_ {
    self
      .intervals
      .iter()
      .enumerate()
      .filter(|(_, slot)| slot.is_some())
      .map(|(i, _)| IntervalId::new(i))
  }

  /// Populated root intervals, ascending by variable index.
  pub fn root_ids(&self) -> impl Iterator<Item = IntervalId> + '_ {
    (0..self.num_vars)
      .filter(|&i| self.intervals[i].is_some())
      .map(IntervalId::new)
  }

  pub fn interval_for(&self, var: VarId) -> Option<IntervalId> {
    match self.intervals.get(var.index()) {
      Some(Some(_)) => Some(IntervalId::new(var.index())),
      _ => None,
    }
  }

  pub fn get_or_create_interval(
    &mut self, operand: Operand, kind: ValueKind,
  ) -> IntervalId {
    let var = match operand {
      Operand::Var(v) => v,
      Operand::Reg(r) => {
        panic!("registers do not have variable intervals: {:?}", r)
      }
    };
    let slot = &mut self.intervals[var.index()];
    if slot.is_none() {
      *slot = Some(TraceInterval::new(var.get(), var, kind));
    }
    IntervalId::new(var.index())
  }

  pub fn fixed_interval_for(&self, reg: RegNum) -> Option<&FixedInterval> {
    self.fixed.get(reg.index()).and_then(|slot| slot.as_ref())
  }

  pub fn get_or_create_fixed_interval(
    &mut self, reg: RegNum,
  ) -> &mut FixedInterval {
    let slot = &mut self.fixed[reg.index()];
    if slot.is_none() {
      *slot = Some(FixedInterval::new(reg));
    }
    slot.as_mut().unwrap()
  }

  pub fn fixed_intervals(&self) -> impl Iterator<Item = &FixedInterval> {
    self.fixed.iter().filter_map(|slot| slot.as_ref())
  }

  pub fn set_call_positions(&mut self, positions: Vec<OpId>) {
    debug_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    self.call_positions = positions;
  }

  /// Does `[from, to)` contain an instruction that clobbers caller-saved
  /// registers?
  pub fn crosses_call(&self, from: OpId, to: OpId) -> bool {
    let at = self.call_positions.partition_point(|&c| c < from);
    self.call_positions.get(at).map_or(false, |&c| c < to)
  }

  //---------------------------------------------------------------------------
  // Split families

  /// Creates a new interval derived from `source` (a split).  The child
  /// joins `source`'s family; ranges and uses are moved over by `split`.
  pub fn create_derived_interval(&mut self, source: IntervalId) -> IntervalId {
    let number = self.intervals.len() as u32;
    let (var, kind, parent) = {
      let src = self.get(source);
      (src.var, src.kind, src.split_parent)
    };
    let mut child = TraceInterval::new(number, var, kind);
    child.split_parent = parent;
    let id = IntervalId::new(self.intervals.len());
    self.intervals.push(Some(child));
    id
  }

  /// Splits `id` at `at`: `id` keeps `[from, at)`, the returned child gets
  /// `[at, to)` together with the use positions at or after `at`.
  pub fn split(&mut self, id: IntervalId, at: OpId) -> IntervalId {
    {
      let int = self.get(id);
      debug_assert!(
        int.from() < at && at < int.to(),
        "split position {:?} outside {:?} [{:?}, {:?})",
        at,
        id,
        int.from(),
        int.to()
      );
    }
    let child_id = self.create_derived_interval(id);

    // Carve the range list in two.
    let (child_ranges, child_uses) = {
      let int = self.get_mut(id);
      let split_at = int
        .ranges
        .iter()
        .position(|r| r.to > at)
        .expect("split would create an empty child");
      let mut child_ranges: SmallVec<[LiveRange; 2]> =
        int.ranges.drain(split_at..).collect();
      if child_ranges[0].from < at {
        // Splitting in the middle of a range: [l, r) -> [l, at) + [at, r).
        int.ranges.push(LiveRange::new(child_ranges[0].from, at));
        child_ranges[0].from = at;
      }
      debug_assert!(!int.ranges.is_empty(), "no ranges left in parent part");
      debug_assert!(!child_ranges.is_empty(), "no ranges in child");

      let use_split = int
        .use_positions
        .iter()
        .position(|u| u.pos >= at)
        .unwrap_or(int.use_positions.len());
      let child_uses: SmallVec<[UsePos; 4]> =
        int.use_positions.drain(use_split..).collect();
      (child_ranges, child_uses)
    };

    {
      let child = self.get_mut(child_id);
      child.ranges = child_ranges;
      child.use_positions = child_uses;
    }

    // Register the child with the family root, keeping the list ordered by
    // from().
    let root = self.get(id).split_parent;
    if self.get(root).split_children.is_empty() {
      self.get_mut(root).split_children.push(root);
    }
    let child_from = self.get(child_id).from();
    let at_index = {
      let children = &self.get(root).split_children;
      children
        .iter()
        .position(|&c| self.get(c).from() > child_from)
        .unwrap_or(children.len())
    };
    self.get_mut(root).split_children.insert(at_index, child_id);

    child_id
  }

  pub fn split_children(&self, root: IntervalId) -> &[IntervalId] {
    &self.get(root).split_children
  }

  /// The member of `root`'s family that holds the value at `pos` for the
  /// given operand mode: outputs pick the child starting at (or covering)
  /// `pos`, inputs the child covering `pos`, falling back to the child
  /// ending exactly there.  An unsplit interval must match `pos` under the
  /// same rules.  `None` means the allocation is inconsistent and the
  /// caller should bail out.
  pub fn split_child_at(
    &self, root: IntervalId, pos: OpId, mode: OperandMode,
  ) -> Option<IntervalId> {
    let parent = self.get(root);
    debug_assert!(
      parent.split_parent == root,
      "split_child_at must start at the family root"
    );
    if parent.split_children.is_empty() {
      let matches = match mode {
        OperandMode::Output | OperandMode::Temp => {
          parent.from() == pos || parent.covers(pos)
        }
        OperandMode::Input | OperandMode::Alive => {
          parent.covers(pos) || parent.to() == pos
        }
      };
      return if matches { Some(root) } else { None };
    }
    let children = &parent.split_children;
    match mode {
      OperandMode::Output | OperandMode::Temp => {
        let mut covering = None;
        for &c in children {
          let int = self.get(c);
          if int.from() == pos {
            return Some(c);
          }
          if int.covers(pos) {
            covering = Some(c);
          }
        }
        covering
      }
      OperandMode::Input | OperandMode::Alive => {
        let mut ends_here = None;
        for &c in children {
          let int = self.get(c);
          if int.covers(pos) {
            return Some(c);
          }
          if int.to() == pos {
            ends_here = Some(c);
          }
        }
        ends_here
      }
    }
  }

  //---------------------------------------------------------------------------
  // Family-level spill bookkeeping, stored on the root

  pub fn spill_slot(&self, id: IntervalId) -> Option<SpillSlot> {
    self.get(self.get(id).split_parent).spill_slot
  }

  pub fn set_spill_slot(&mut self, id: IntervalId, slot: SpillSlot) {
    let root = self.get(id).split_parent;
    let parent = self.get_mut(root);
    debug_assert!(parent.spill_slot.is_none(), "canonical slot already set");
    parent.spill_slot = Some(slot);
  }

  pub fn spill_state(&self, id: IntervalId) -> SpillState {
    self.get(self.get(id).split_parent).spill_state
  }

  pub fn set_spill_state(&mut self, id: IntervalId, state: SpillState) {
    let root = self.get(id).split_parent;
    self.get_mut(root).spill_state = state;
  }

  pub fn spill_definition_pos(&self, id: IntervalId) -> Option<OpId> {
    self.get(self.get(id).split_parent).spill_definition_pos
  }

  pub fn set_spill_definition_pos(&mut self, id: IntervalId, pos: OpId) {
    let root = self.get(id).split_parent;
    self.get_mut(root).spill_definition_pos = Some(pos);
  }

  pub fn can_materialize(&self, id: IntervalId) -> bool {
    self.material(id).is_some()
  }

  pub fn material(&self, id: IntervalId) -> Option<ConstValue> {
    self.get(self.get(id).split_parent).material
  }

  //---------------------------------------------------------------------------
  // Diagnostics

  pub fn display(&self, id: IntervalId) -> String {
    let int = self.get(id);
    let parent = if int.split_parent == id {
      String::new()
    } else {
      format!(" (parent={:?})", int.split_parent)
    };
    format!(
      "{:?}{}: {:?} {:?} {:?} uses {:?}",
      id, parent, int.var, int.location, int.ranges, int.use_positions
    )
  }

  /// Level-tagged interval table dump; purely diagnostic.
  pub fn print_intervals(&self, label: &str) {
    log::trace!("intervals: {}", label);
    for id in self.ids() {
      log::trace!("  {}", self.display(id));
    }
    for fixed in self.fixed_intervals() {
      log::trace!("  fixed {:?}: {:?}", fixed.reg, fixed.ranges);
    }
  }
}

//=============================================================================
// Tests

#[cfg(test)]
mod test {
  use super::*;

  fn r(from: u32, to: u32) -> LiveRange {
    LiveRange::new(OpId::new(from), OpId::new(to))
  }

  fn store_with_one_var() -> IntervalStore {
    // A handcrafted straight-line numbering is enough for interval tests.
    let numbering = Numbering::for_test(
      vec![BlockId::new(0)],
      vec![BlockId::new(0); 16],
      vec![OpId::new(0)],
      vec![OpId::new(30)],
    );
    IntervalStore::new(numbering, 1, 2)
  }

  #[test]
  fn backward_range_build_merges() {
    let mut store = store_with_one_var();
    let id = store
      .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
    let int = store.get_mut(id);
    // Backward scan order: later ranges first.
    int.add_range(OpId::new(10), OpId::new(12));
    int.add_range(OpId::new(4), OpId::new(7));
    int.add_range(OpId::new(0), OpId::new(5));
    assert_eq!(int.ranges(), &[r(0, 7), r(10, 12)]);
    assert_eq!(int.from(), OpId::new(0));
    assert_eq!(int.to(), OpId::new(12));
    assert!(int.covers(OpId::new(6)));
    assert!(!int.covers(OpId::new(8)));
    assert!(int.in_hole(OpId::new(8)));
  }

  #[test]
  fn definition_closes_open_range() {
    let mut store = store_with_one_var();
    let id = store
      .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
    let int = store.get_mut(id);
    int.add_range(OpId::new(0), OpId::new(9));
    int.set_from(OpId::new(4));
    assert_eq!(int.ranges(), &[r(4, 9)]);
  }

  #[test]
  fn use_position_queries() {
    let mut store = store_with_one_var();
    let id = store
      .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
    let int = store.get_mut(id);
    int.add_use(OpId::new(8), UseKind::ShouldHaveRegister);
    int.add_use(OpId::new(4), UseKind::MustHaveRegister);
    int.add_use(OpId::new(0), UseKind::MustHaveRegister);
    assert_eq!(
      int.next_use_after(OpId::new(2), UseKind::MustHaveRegister),
      Some(OpId::new(4))
    );
    assert_eq!(
      int.next_use_after(OpId::new(5), UseKind::MustHaveRegister),
      None
    );
    assert_eq!(
      int.next_use_after(OpId::new(5), UseKind::ShouldHaveRegister),
      Some(OpId::new(8))
    );
    assert_eq!(int.first_use(UseKind::NoUse), Some(OpId::new(0)));
  }

  #[test]
  fn range_intersection() {
    assert_eq!(ranges_intersection(&[r(0, 4), r(8, 12)], &[r(4, 8)]), None);
    assert_eq!(
      ranges_intersection(&[r(0, 4), r(8, 12)], &[r(2, 3)]),
      Some(OpId::new(2))
    );
    assert_eq!(
      ranges_intersection(&[r(0, 4), r(8, 12)], &[r(5, 9)]),
      Some(OpId::new(8))
    );
  }

  #[test]
  fn split_mid_range_and_lookup() {
    let mut store = store_with_one_var();
    let id = store
      .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
    {
      let int = store.get_mut(id);
      int.add_use(OpId::new(10), UseKind::MustHaveRegister);
      int.add_use(OpId::new(0), UseKind::MustHaveRegister);
      int.add_range(OpId::new(0), OpId::new(11));
    }
    let child = store.split(id, OpId::new(6));
    assert_eq!(store.get(id).ranges(), &[r(0, 6)]);
    assert_eq!(store.get(child).ranges(), &[r(6, 11)]);
    assert_eq!(store.get(id).use_positions().len(), 1);
    assert_eq!(store.get(child).use_positions().len(), 1);
    assert_eq!(store.get(child).split_parent, id);
    assert_eq!(store.split_children(id), &[id, child]);

    // Output at the split point resolves to the child; input just before
    // the split to the parent part; input inside the child to the child.
    assert_eq!(
      store.split_child_at(id, OpId::new(6), OperandMode::Output),
      Some(child)
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(5), OperandMode::Input),
      Some(id)
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(10), OperandMode::Input),
      Some(child)
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(6), OperandMode::Input),
      Some(child)
    );
  }

  #[test]
  fn unsplit_lookup_misses_outside_the_interval() {
    let mut store = store_with_one_var();
    let id = store
      .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
    store.get_mut(id).add_range(OpId::new(4), OpId::new(8));

    // Positions the interval really occupies resolve to the root itself.
    assert_eq!(
      store.split_child_at(id, OpId::new(4), OperandMode::Output),
      Some(id)
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(6), OperandMode::Input),
      Some(id)
    );
    // A read at the endpoint is still served by the root.
    assert_eq!(
      store.split_child_at(id, OpId::new(8), OperandMode::Input),
      Some(id)
    );
    // Anything else is a miss, not a silent success.
    assert_eq!(
      store.split_child_at(id, OpId::new(2), OperandMode::Input),
      None
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(8), OperandMode::Output),
      None
    );
    assert_eq!(
      store.split_child_at(id, OpId::new(10), OperandMode::Input),
      None
    );
  }

  #[test]
  fn numbering_predicates() {
    // Two blocks of two instructions each: ids 0,2 in b0 and 4,6 in b1.
    let numbering = Numbering::for_test(
      vec![BlockId::new(0), BlockId::new(1)],
      vec![
        BlockId::new(0),
        BlockId::new(0),
        BlockId::new(1),
        BlockId::new(1),
      ],
      vec![OpId::new(0), OpId::new(4)],
      vec![OpId::new(2), OpId::new(6)],
    );
    assert!(numbering.is_block_begin(OpId::new(0)));
    assert!(!numbering.is_block_begin(OpId::new(2)));
    assert!(numbering.is_block_begin(OpId::new(4)));
    assert!(numbering.is_block_end(OpId::new(2)));
    assert!(!numbering.is_block_end(OpId::new(0)));
    assert!(numbering.is_block_end(OpId::new(6)));
    assert_eq!(numbering.block_for(OpId::new(3)), BlockId::new(0));
    assert_eq!(numbering.block_for(OpId::new(4)), BlockId::new(1));
    assert_eq!(numbering.max_op_id(), OpId::new(6));
  }

  #[test]
  fn call_crossing() {
    let mut store = store_with_one_var();
    store.set_call_positions(vec![OpId::new(6)]);
    assert!(store.crosses_call(OpId::new(0), OpId::new(8)));
    assert!(store.crosses_call(OpId::new(6), OpId::new(7)));
    assert!(!store.crosses_call(OpId::new(0), OpId::new(6)));
    assert!(!store.crosses_call(OpId::new(7), OpId::new(12)));
  }

  #[test]
  #[should_panic]
  fn register_operand_has_no_interval() {
    let mut store = store_with_one_var();
    store.get_or_create_interval(Operand::Reg(RegNum::new(0)), ValueKind::Int);
  }
}
