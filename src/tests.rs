/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A mini LIR implementing the allocator's client traits, plus end-to-end
//! allocation scenarios over it.

use crate::analysis;
use crate::eliminate;
use crate::inst_stream::EditSet;
use crate::interface::*;
use crate::linear_scan;
use crate::resolution;

//=============================================================================
// The mini IR

/// An operand slot: virtual before allocation, allocated after.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Val {
  Op(Operand),
  Alloc(AllocatedOperand),
}

fn v(n: u32) -> Val {
  Val::Op(Operand::Var(VarId::new(n)))
}

impl Val {
  fn alloc(self) -> AllocatedOperand {
    match self {
      Val::Alloc(a) => a,
      Val::Op(op) => panic!("operand {:?} was never allocated", op),
    }
  }
}

#[derive(Clone, Copy, Debug)]
enum Inst {
  /// An opaque definition, e.g. reading an incoming argument.
  Def { dst: Val },
  /// Loads a constant; candidate for rematerialization.
  Const { dst: Val, value: i64 },
  Add { dst: Val, lhs: Val, rhs: Val },
  /// A multiply that burns a scratch register while it executes.
  Mul { dst: Val, lhs: Val, rhs: Val, tmp: Val },
  Move { dst: Val, src: Val },
  /// Reads a value that must be in a register.
  Use { src: Val },
  /// Reads a value from wherever it lives.
  UseAny { src: Val },
  Call,
  /// A call that keeps one operand live across it.
  CallWith { keep: Val },
  Jump { target: BlockId },
  Ret { src: Option<Val> },
  /// Inserted by the allocator.
  SpillMove {
    dst: AllocatedOperand,
    src: AllocatedOperand,
  },
  Materialize {
    dst: AllocatedOperand,
    value: ConstValue,
  },
}

struct MiniFunc {
  block_ids: Vec<BlockId>,
  blocks: Vec<Vec<Inst>>,
  num_vars: usize,
}

impl MiniFunc {
  fn new(blocks: Vec<(u32, Vec<Inst>)>, num_vars: usize) -> MiniFunc {
    let block_ids = blocks.iter().map(|(n, _)| BlockId::new(*n)).collect();
    let blocks = blocks.into_iter().map(|(_, insts)| insts).collect();
    MiniFunc {
      block_ids,
      blocks,
      num_vars,
    }
  }

  fn linear(insts: Vec<Inst>, num_vars: usize) -> MiniFunc {
    MiniFunc::new(vec![(0, insts)], num_vars)
  }

  fn index_of(&self, block: BlockId) -> usize {
    self
      .block_ids
      .iter()
      .position(|&b| b == block)
      .expect("unknown block")
  }

  fn all_insts(&self) -> impl Iterator<Item = &Inst> {
    self.blocks.iter().flat_map(|insts| insts.iter())
  }

  fn inserted_moves(&self) -> usize {
    self
      .all_insts()
      .filter(|i| matches!(i, Inst::SpillMove { .. } | Inst::Materialize { .. }))
      .count()
  }
}

fn visit(
  val: &Val, mode: OperandMode, use_kind: UseKind,
  visitor: &mut dyn FnMut(Operand, OperandMode, UseKind, ValueKind),
) {
  if let Val::Op(op) = val {
    visitor(*op, mode, use_kind, ValueKind::Int);
  }
}

fn remap(
  val: &mut Val, mode: OperandMode,
  mapper: &mut dyn FnMut(Operand, OperandMode) -> Option<AllocatedOperand>,
) {
  if let Val::Op(op) = val {
    if let Some(alloc) = mapper(*op, mode) {
      *val = Val::Alloc(alloc);
    }
  }
}

impl Function for MiniFunc {
  type Inst = Inst;

  fn blocks(&self) -> &[BlockId] {
    &self.block_ids
  }

  fn block_succs(&self, block: BlockId) -> Vec<BlockId> {
    match self.blocks[self.index_of(block)].last() {
      Some(Inst::Jump { target }) => vec![*target],
      _ => Vec::new(),
    }
  }

  fn insns(&self, block: BlockId) -> &[Inst] {
    &self.blocks[self.index_of(block)]
  }

  fn insns_mut(&mut self, block: BlockId) -> &mut Vec<Inst> {
    let index = self.index_of(block);
    &mut self.blocks[index]
  }

  fn num_vars(&self) -> usize {
    self.num_vars
  }

  fn var_kind(&self, _var: VarId) -> ValueKind {
    ValueKind::Int
  }

  fn visit_operands(
    inst: &Inst,
    visitor: &mut dyn FnMut(Operand, OperandMode, UseKind, ValueKind),
  ) {
    use OperandMode::*;
    use UseKind::*;
    match inst {
      Inst::Def { dst } => visit(dst, Output, ShouldHaveRegister, visitor),
      Inst::Const { dst, .. } => {
        visit(dst, Output, ShouldHaveRegister, visitor)
      }
      Inst::Add { dst, lhs, rhs } => {
        visit(lhs, Input, MustHaveRegister, visitor);
        visit(rhs, Input, MustHaveRegister, visitor);
        visit(dst, Output, MustHaveRegister, visitor);
      }
      Inst::Mul { dst, lhs, rhs, tmp } => {
        visit(lhs, Input, MustHaveRegister, visitor);
        visit(rhs, Input, MustHaveRegister, visitor);
        visit(tmp, Temp, MustHaveRegister, visitor);
        visit(dst, Output, MustHaveRegister, visitor);
      }
      Inst::Move { dst, src } => {
        visit(src, Input, ShouldHaveRegister, visitor);
        visit(dst, Output, ShouldHaveRegister, visitor);
      }
      Inst::Use { src } => visit(src, Input, MustHaveRegister, visitor),
      Inst::UseAny { src } => visit(src, Input, ShouldHaveRegister, visitor),
      Inst::CallWith { keep } => {
        visit(keep, Alive, MustHaveRegister, visitor)
      }
      Inst::Ret { src: Some(src) } => {
        visit(src, Input, MustHaveRegister, visitor)
      }
      Inst::Ret { src: None }
      | Inst::Call
      | Inst::Jump { .. }
      | Inst::SpillMove { .. }
      | Inst::Materialize { .. } => {}
    }
  }

  fn map_operands(
    inst: &mut Inst,
    mapper: &mut dyn FnMut(Operand, OperandMode) -> Option<AllocatedOperand>,
  ) {
    use OperandMode::*;
    match inst {
      Inst::Def { dst } | Inst::Const { dst, .. } => remap(dst, Output, mapper),
      Inst::Add { dst, lhs, rhs } => {
        remap(lhs, Input, mapper);
        remap(rhs, Input, mapper);
        remap(dst, Output, mapper);
      }
      Inst::Mul { dst, lhs, rhs, tmp } => {
        remap(lhs, Input, mapper);
        remap(rhs, Input, mapper);
        remap(tmp, Temp, mapper);
        remap(dst, Output, mapper);
      }
      Inst::Move { dst, src } => {
        remap(src, Input, mapper);
        remap(dst, Output, mapper);
      }
      Inst::Use { src } | Inst::UseAny { src } => remap(src, Input, mapper),
      Inst::CallWith { keep } => remap(keep, Alive, mapper),
      Inst::Ret { src: Some(src) } => remap(src, Input, mapper),
      Inst::Ret { src: None }
      | Inst::Call
      | Inst::Jump { .. }
      | Inst::SpillMove { .. }
      | Inst::Materialize { .. } => {}
    }
  }

  fn as_move(inst: &Inst) -> Option<(Operand, Operand)> {
    match inst {
      Inst::Move {
        dst: Val::Op(dst),
        src: Val::Op(src),
      } => Some((*dst, *src)),
      _ => None,
    }
  }

  fn as_constant_load(inst: &Inst) -> Option<(Operand, ConstValue)> {
    match inst {
      Inst::Const {
        dst: Val::Op(dst),
        value,
      } => Some((*dst, ConstValue::new(*value))),
      _ => None,
    }
  }

  fn destroys_caller_saved(&self, inst: &Inst) -> bool {
    matches!(inst, Inst::Call | Inst::CallWith { .. })
  }

  fn has_state(&self, inst: &Inst) -> bool {
    matches!(inst, Inst::Call | Inst::CallWith { .. })
  }
}

struct MiniMoves {
  /// Whether constants may be rematerialized instead of spilled.
  remat: bool,
}

impl MoveFactory<Inst> for MiniMoves {
  fn make_move(&mut self, dst: AllocatedOperand, src: AllocatedOperand) -> Inst {
    Inst::SpillMove { dst, src }
  }
  fn make_materialize(
    &mut self, dst: AllocatedOperand, value: ConstValue,
  ) -> Inst {
    Inst::Materialize { dst, value }
  }
  fn allow_constant_to_stack_move(&self, _value: ConstValue) -> bool {
    self.remat
  }
}

struct MiniFrame {
  next: u32,
}

impl MiniFrame {
  fn new() -> MiniFrame {
    MiniFrame { next: 0 }
  }
}

impl FrameBuilder for MiniFrame {
  fn allocate_spill_slot(&mut self, _kind: ValueKind) -> SpillSlot {
    let slot = SpillSlot::new(self.next);
    self.next += 1;
    slot
  }
}

//=============================================================================
// Harness helpers

fn gprs(descrs: &[(bool, bool)]) -> RegisterConfig {
  // (allocatable, caller_saved) per register number.
  RegisterConfig::new(
    descrs
      .iter()
      .map(|&(allocatable, caller_saved)| RegisterDescr {
        class: RegClass::Gpr,
        allocatable,
        caller_saved,
      })
      .collect(),
  )
}

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn allocate(
  func: &mut MiniFunc, config: &RegisterConfig, remat: bool,
  opts: &AllocationOptions,
) -> Result<(IntervalStore, Stats), RegAllocError> {
  init_logger();
  let mut moves = MiniMoves { remat };
  let mut frame = MiniFrame::new();
  let mut cached = CachedStackSlots::new(func.num_vars());
  let mut stats = Stats::default();
  let store = allocate_registers(
    func, config, &mut moves, &mut frame, &mut cached, opts, &mut stats,
  )?;
  Ok((store, stats))
}

fn detailed() -> AllocationOptions {
  AllocationOptions {
    detailed_asserts: true,
    ..Default::default()
  }
}

fn location_of(store: &IntervalStore, var: u32) -> Location {
  let root = store.interval_for(VarId::new(var)).expect("no interval");
  store.get(root).location
}

fn reg(n: u8) -> AllocatedOperand {
  AllocatedOperand::Reg(RegNum::new(n), ValueKind::Int)
}

fn stack(n: u32) -> AllocatedOperand {
  AllocatedOperand::Stack(SpillSlot::new(n), ValueKind::Int)
}

//=============================================================================
// Straight line, no pressure

#[test]
fn straight_line_no_pressure() {
  // 0: v0 := 1; 2: v1 := 2; 4: v2 := v0 + v1; 6: ret v2
  let mut func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 1 },
      Inst::Const { dst: v(1), value: 2 },
      Inst::Add { dst: v(2), lhs: v(0), rhs: v(1) },
      Inst::Ret { src: Some(v(2)) },
    ],
    3,
  );
  let config = gprs(&[(true, true), (true, true)]);
  let (store, stats) = allocate(&mut func, &config, false, &detailed()).unwrap();

  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(0)));
  assert_eq!(location_of(&store, 1), Location::Reg(RegNum::new(1)));
  // r0 is free again after the add reads v0.
  assert_eq!(location_of(&store, 2), Location::Reg(RegNum::new(0)));

  assert!(!store.has_derived_intervals(), "no splits expected");
  assert_eq!(func.inserted_moves(), 0);
  assert_eq!(stats.allocated_stack_slots, 0);

  let insts = func.insns(BlockId::new(0));
  match &insts[2] {
    Inst::Add { dst, lhs, rhs } => {
      assert_eq!(dst.alloc(), reg(0));
      assert_eq!(lhs.alloc(), reg(0));
      assert_eq!(rhs.alloc(), reg(1));
    }
    other => panic!("unexpected inst {:?}", other),
  }
  match &insts[3] {
    Inst::Ret { src: Some(src) } => assert_eq!(src.alloc(), reg(0)),
    other => panic!("unexpected inst {:?}", other),
  }
}

//=============================================================================
// Temps and alives

#[test]
fn temp_conflicts_with_the_output() {
  // 0: v0 := ...; 2: v1 := v0 * v0 (scratch v2); 4: ret v1
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Mul { dst: v(1), lhs: v(0), rhs: v(0), tmp: v(2) },
      Inst::Ret { src: Some(v(1)) },
    ],
    3,
  );
  let config = gprs(&[(true, true), (true, true)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();

  // The temp lives for the instruction only and must not share the
  // output's register; the dying input may be reused for the output.
  let tmp_root = store.interval_for(VarId::new(2)).unwrap();
  assert_eq!(
    store.get(tmp_root).ranges(),
    &[LiveRange::new(OpId::new(2), OpId::new(3))]
  );
  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(0)));
  assert_eq!(location_of(&store, 1), Location::Reg(RegNum::new(0)));
  assert_eq!(location_of(&store, 2), Location::Reg(RegNum::new(1)));
  assert_eq!(func.inserted_moves(), 0);

  let insts = func.insns(BlockId::new(0));
  match &insts[1] {
    Inst::Mul { dst, lhs, rhs, tmp } => {
      assert_eq!(lhs.alloc(), reg(0));
      assert_eq!(rhs.alloc(), reg(0));
      assert_eq!(tmp.alloc(), reg(1));
      assert_eq!(dst.alloc(), reg(0));
    }
    other => panic!("unexpected inst {:?}", other),
  }
}

#[test]
fn alive_operand_survives_past_the_call() {
  // 0: v0 := ...; 2: call keeping v0 alive
  let mut func = MiniFunc::linear(
    vec![Inst::Def { dst: v(0) }, Inst::CallWith { keep: v(0) }],
    1,
  );
  // r0 caller-saved, r1 callee-saved.
  let config = gprs(&[(true, true), (true, false)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();

  // The alive range extends one gap past the call, so the value cannot be
  // clobbered by the call or by anything inserted right after it; the
  // callee-saved register carries it through.
  let root = store.interval_for(VarId::new(0)).unwrap();
  assert_eq!(
    store.get(root).ranges(),
    &[LiveRange::new(OpId::new(0), OpId::new(4))]
  );
  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(1)));
  assert!(!store.has_derived_intervals());
  assert_eq!(func.inserted_moves(), 0);

  let insts = func.insns(BlockId::new(0));
  match &insts[1] {
    Inst::CallWith { keep } => assert_eq!(keep.alloc(), reg(1)),
    other => panic!("unexpected inst {:?}", other),
  }
}

//=============================================================================
// Spill by use distance

#[test]
fn spill_by_use_distance() {
  // 0: v0 := ...; 2: v1 := ...; 4: use v0; 6: use v1; 8: use v0
  // One register: v1 is used further away at the decision point, so v1
  // lives in memory from its definition and v0 is split around the use of
  // v1.
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Def { dst: v(1) },
      Inst::Use { src: v(0) },
      Inst::Use { src: v(1) },
      Inst::Use { src: v(0) },
    ],
    2,
  );
  let config = gprs(&[(true, true)]);
  let (store, stats) = allocate(&mut func, &config, false, &detailed()).unwrap();

  // v1 starts in memory; its definition writes straight to the slot.
  assert_eq!(location_of(&store, 1), Location::Stack(SpillSlot::new(0)));
  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(0)));
  assert_eq!(stats.allocated_stack_slots, 2);

  let insts = func.insns(BlockId::new(0));
  assert_eq!(insts.len(), 8);
  match &insts[1] {
    Inst::Def { dst } => assert_eq!(dst.alloc(), stack(0)),
    other => panic!("unexpected inst {:?}", other),
  }
  // Before "use v1": v0 is stored to its own slot, then v1 reloads into
  // the register.
  assert!(
    matches!(insts[3], Inst::SpillMove { dst, src }
      if dst == stack(1) && src == reg(0)),
    "expected store of v0, got {:?}",
    insts[3]
  );
  assert!(
    matches!(insts[4], Inst::SpillMove { dst, src }
      if dst == reg(0) && src == stack(0)),
    "expected reload of v1, got {:?}",
    insts[4]
  );
  // Before the final use: v0 reloads.
  assert!(
    matches!(insts[6], Inst::SpillMove { dst, src }
      if dst == reg(0) && src == stack(1)),
    "expected reload of v0, got {:?}",
    insts[6]
  );
  // All three uses read the register.
  for i in [2usize, 5, 7] {
    match &insts[i] {
      Inst::Use { src } => assert_eq!(src.alloc(), reg(0)),
      other => panic!("unexpected inst {:?}", other),
    }
  }
}

#[test]
fn cached_stack_slots_are_reused() {
  let build = || {
    MiniFunc::linear(
      vec![
        Inst::Def { dst: v(0) },
        Inst::Def { dst: v(1) },
        Inst::Use { src: v(0) },
        Inst::Use { src: v(1) },
        Inst::Use { src: v(0) },
      ],
      2,
    )
  };
  init_logger();
  let config = gprs(&[(true, true)]);
  let mut moves = MiniMoves { remat: false };
  let mut frame = MiniFrame::new();
  let mut cached = CachedStackSlots::new(2);
  let mut stats = Stats::default();
  let opts = detailed();

  let mut first = build();
  allocate_registers(
    &mut first, &config, &mut moves, &mut frame, &mut cached, &opts,
    &mut stats,
  )
  .unwrap();
  assert_eq!(stats.allocated_stack_slots, 2);
  assert_eq!(stats.global_stack_slots, 0);

  // A second trace of the same compilation reuses both slots.
  let mut second = build();
  allocate_registers(
    &mut second, &config, &mut moves, &mut frame, &mut cached, &opts,
    &mut stats,
  )
  .unwrap();
  assert_eq!(stats.allocated_stack_slots, 2);
  assert_eq!(stats.global_stack_slots, 2);
}

//=============================================================================
// Call handling

#[test]
fn call_crossing_prefers_callee_saved() {
  // 0: v0 := ...; 2: call; 4: use v0
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Call,
      Inst::Use { src: v(0) },
    ],
    1,
  );
  // r0 caller-saved, r1 callee-saved.
  let config = gprs(&[(true, true), (true, false)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();

  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(1)));
  assert!(!store.has_derived_intervals());
  assert_eq!(func.inserted_moves(), 0);
}

#[test]
fn call_crossing_spills_around_call() {
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Call,
      Inst::Use { src: v(0) },
    ],
    1,
  );
  // Only one register, and it dies at the call.
  let config = gprs(&[(true, true)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();
  assert!(store.has_derived_intervals());

  let insts = func.insns(BlockId::new(0));
  assert_eq!(insts.len(), 5);
  assert!(
    matches!(insts[1], Inst::SpillMove { dst, src }
      if dst == stack(0) && src == reg(0)),
    "expected store before the call, got {:?}",
    insts[1]
  );
  assert!(matches!(insts[2], Inst::Call));
  assert!(
    matches!(insts[3], Inst::SpillMove { dst, src }
      if dst == reg(0) && src == stack(0)),
    "expected reload after the call, got {:?}",
    insts[3]
  );
  match &insts[4] {
    Inst::Use { src } => assert_eq!(src.alloc(), reg(0)),
    other => panic!("unexpected inst {:?}", other),
  }
}

#[test]
fn short_intervals_prefer_caller_saved() {
  let mut func = MiniFunc::linear(
    vec![Inst::Def { dst: v(0) }, Inst::Use { src: v(0) }],
    1,
  );
  // r0 callee-saved, r1 caller-saved: a call-free interval picks the
  // caller-saved register even though it has the higher number.
  let config = gprs(&[(true, false), (true, true)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();
  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(1)));
}

//=============================================================================
// Rematerialization

#[test]
fn constant_rematerializes_instead_of_spilling() {
  // 0: v0 := 42; 2: call; 4: use-any v0
  let mut func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 42 },
      Inst::Call,
      Inst::UseAny { src: v(0) },
    ],
    1,
  );
  let config = gprs(&[(true, true)]);
  let (store, stats) = allocate(&mut func, &config, true, &detailed()).unwrap();

  // The spilled part carries the illegal marker, not a slot.
  let spilled = store
    .ids()
    .find(|&id| store.get(id).location.is_illegal())
    .expect("no rematerialized part");
  assert!(store.can_materialize(spilled));
  assert_eq!(stats.allocated_stack_slots, 0);
  assert_eq!(func.inserted_moves(), 0);

  let insts = func.insns(BlockId::new(0));
  match &insts[2] {
    Inst::UseAny { src } => {
      assert_eq!(src.alloc(), AllocatedOperand::Constant(ConstValue::new(42)));
    }
    other => panic!("unexpected inst {:?}", other),
  }
}

#[test]
fn never_spill_constants_takes_the_slot_path() {
  let mut func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 42 },
      Inst::Call,
      Inst::UseAny { src: v(0) },
    ],
    1,
  );
  let config = gprs(&[(true, true)]);
  let opts = AllocationOptions {
    never_spill_constants: true,
    ..detailed()
  };
  let (store, stats) = allocate(&mut func, &config, true, &opts).unwrap();

  assert!(store.ids().all(|id| !store.get(id).location.is_illegal()));
  assert_eq!(stats.allocated_stack_slots, 1);

  let insts = func.insns(BlockId::new(0));
  // The value is stored before the call and read from memory afterwards.
  assert!(
    matches!(insts[1], Inst::SpillMove { dst, src }
      if dst == stack(0) && src == reg(0))
  );
  match insts.last().unwrap() {
    Inst::UseAny { src } => assert_eq!(src.alloc(), stack(0)),
    other => panic!("unexpected inst {:?}", other),
  }
}

//=============================================================================
// Move coalescing

#[test]
fn hinted_move_is_coalesced_and_eliminated() {
  // 0: v0 := 7; 2: v1 := move v0; 4: use v1
  let mut func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 7 },
      Inst::Move { dst: v(1), src: v(0) },
      Inst::Use { src: v(1) },
    ],
    2,
  );
  let config = gprs(&[(true, true), (true, true)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();

  // The hint gives both values the same register, which makes the move a
  // no-op; the eliminator drops it.
  assert_eq!(location_of(&store, 0), Location::Reg(RegNum::new(0)));
  assert_eq!(location_of(&store, 1), Location::Reg(RegNum::new(0)));
  let insts = func.insns(BlockId::new(0));
  assert_eq!(insts.len(), 2);
  assert!(matches!(insts[0], Inst::Const { .. }));
  match &insts[1] {
    Inst::Use { src } => assert_eq!(src.alloc(), reg(0)),
    other => panic!("unexpected inst {:?}", other),
  }
}

#[test]
fn eliminate_pass_is_deterministic() {
  let func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 7 },
      Inst::Move { dst: v(1), src: v(0) },
      Inst::Use { src: v(1) },
    ],
    2,
  );
  init_logger();
  let config = gprs(&[(true, true), (true, true)]);
  let mut moves = MiniMoves { remat: false };
  let mut frame = MiniFrame::new();
  let mut cached = CachedStackSlots::new(2);
  let mut stats = Stats::default();
  let opts = detailed();

  let mut store =
    analysis::run_lifetime_analysis(&func, &config, &moves, &opts);
  linear_scan::run_allocation(
    &mut store, &config, &mut frame, &mut cached, &opts, &mut stats,
  )
  .unwrap();

  // Repeating the elimination over the unmodified stream finds exactly
  // the same set of dead moves.
  let mut first = EditSet::new();
  eliminate::eliminate_spill_moves(&func, &store, &mut moves, &mut first)
    .unwrap();
  let mut second = EditSet::new();
  eliminate::eliminate_spill_moves(&func, &store, &mut moves, &mut second)
    .unwrap();
  assert_eq!(first.num_deleted(), 1);
  assert_eq!(second.num_deleted(), first.num_deleted());
  assert_eq!(second.num_inserted(), first.num_inserted());
}

#[test]
fn store_at_definition_emits_a_single_store() {
  // A family marked store-at-definition gets exactly one store, right
  // after its defining instruction.
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Use { src: v(0) },
      Inst::Use { src: v(0) },
    ],
    1,
  );
  init_logger();
  let numbering = Numbering::compute(&func);
  let mut store = IntervalStore::new(numbering, 1, 1);
  let root = store
    .get_or_create_interval(Operand::Var(VarId::new(0)), ValueKind::Int);
  store.get_mut(root).add_range(OpId::new(0), OpId::new(6));
  store.get_mut(root).location = Location::Reg(RegNum::new(0));
  store.set_spill_definition_pos(root, OpId::new(0));
  store.set_spill_slot(root, SpillSlot::new(3));
  store.set_spill_state(root, SpillState::StoreAtDefinition);

  let mut moves = MiniMoves { remat: false };
  let mut edits = EditSet::new();
  eliminate::eliminate_spill_moves(&func, &store, &mut moves, &mut edits)
    .unwrap();
  assert_eq!(edits.num_inserted(), 1);
  assert_eq!(edits.num_deleted(), 0);

  crate::inst_stream::apply_edits(&mut func, &store, edits);
  let insts = func.insns(BlockId::new(0));
  assert!(
    matches!(insts[1], Inst::SpillMove { dst, src }
      if dst == stack(3) && src == reg(0)),
    "expected the hoisted store, got {:?}",
    insts[1]
  );
}

//=============================================================================
// Block edges

#[test]
fn spill_state_flows_across_blocks() {
  // b0: 0: v0 := ...; 2: v1 := ...; 4: jump b1
  // b1: 6: use v0; 8: use v1; 10: ret
  let mut func = MiniFunc::new(
    vec![
      (
        0,
        vec![
          Inst::Def { dst: v(0) },
          Inst::Def { dst: v(1) },
          Inst::Jump { target: BlockId::new(1) },
        ],
      ),
      (
        1,
        vec![
          Inst::Use { src: v(0) },
          Inst::Use { src: v(1) },
          Inst::Ret { src: None },
        ],
      ),
    ],
    2,
  );
  let config = gprs(&[(true, true)]);
  let (store, _) = allocate(&mut func, &config, false, &detailed()).unwrap();

  // v1 lives in memory from its definition; locations agree on both sides
  // of the edge, so the only inserted move is v1's reload in b1.
  assert_eq!(location_of(&store, 1), Location::Stack(SpillSlot::new(0)));
  assert_eq!(func.insns(BlockId::new(0)).len(), 3);
  let b1 = func.insns(BlockId::new(1));
  assert_eq!(b1.len(), 4);
  assert!(
    matches!(b1[1], Inst::SpillMove { dst, src }
      if dst == reg(0) && src == stack(0))
  );
}

#[test]
fn edge_cycle_is_broken_with_a_scratch() {
  // Two values swap registers across a block edge; the resolver needs a
  // parking slot and exactly three moves.
  let mut func = MiniFunc::new(
    vec![
      (
        0,
        vec![
          Inst::Def { dst: v(0) },
          Inst::Def { dst: v(1) },
          Inst::Jump { target: BlockId::new(1) },
        ],
      ),
      (
        1,
        vec![
          Inst::Use { src: v(0) },
          Inst::Use { src: v(1) },
          Inst::Ret { src: None },
        ],
      ),
    ],
    2,
  );
  init_logger();

  // Handcraft the allocation: both families split at the boundary (id 6)
  // with swapped registers on the far side.
  let numbering = Numbering::compute(&func);
  let mut store = IntervalStore::new(numbering, 2, 2);
  for (var, near, far) in [(0u32, 0u8, 1u8), (1, 1, 0)] {
    let root = store
      .get_or_create_interval(Operand::Var(VarId::new(var)), ValueKind::Int);
    store.get_mut(root).add_range(OpId::new(0), OpId::new(10));
    let child = store.split(root, OpId::new(6));
    store.get_mut(root).location = Location::Reg(RegNum::new(near));
    store.get_mut(child).location = Location::Reg(RegNum::new(far));
  }

  let mut moves = MiniMoves { remat: false };
  let mut frame = MiniFrame::new();
  let mut edits = EditSet::new();
  resolution::resolve_data_flow(&func, &store, &mut moves, &mut frame,
    &mut edits)
  .unwrap();
  crate::inst_stream::apply_edits(&mut func, &store, edits);

  let b0 = func.insns(BlockId::new(0));
  assert_eq!(b0.len(), 6, "three resolution moves expected: {:?}", b0);
  assert!(matches!(b0[5], Inst::Jump { .. }));
  let moves: Vec<(AllocatedOperand, AllocatedOperand)> = b0[2..5]
    .iter()
    .map(|inst| match inst {
      Inst::SpillMove { dst, src } => (*dst, *src),
      other => panic!("unexpected inst {:?}", other),
    })
    .collect();

  // One parking store, one register move, one fill from the parking slot.
  let scratch = stack(0);
  assert_eq!(moves[0].0, scratch);
  let parked = moves[0].1;
  assert!(parked == reg(0) || parked == reg(1));
  let other = if parked == reg(0) { reg(1) } else { reg(0) };
  assert_eq!(moves[1], (parked, other));
  assert_eq!(moves[2], (other, scratch));
}

//=============================================================================
// Bailouts

#[test]
fn impossible_pressure_bails_out() {
  // Two values both needed in registers at the add, but only one
  // register exists.
  let mut func = MiniFunc::linear(
    vec![
      Inst::Def { dst: v(0) },
      Inst::Def { dst: v(1) },
      Inst::Add { dst: v(2), lhs: v(0), rhs: v(1) },
      Inst::Ret { src: Some(v(2)) },
    ],
    3,
  );
  let config = gprs(&[(true, true)]);
  let err = match allocate(&mut func, &config, false, &detailed()) {
    Err(err) => err,
    Ok(_) => panic!("allocation should have bailed out"),
  };
  assert!(
    matches!(err, RegAllocError::OutOfRegisters { .. }),
    "unexpected error {:?}",
    err
  );
}

//=============================================================================
// Re-entry with precomputed intervals

#[test]
fn reentry_with_prebuilt_intervals() {
  let mut func = MiniFunc::linear(
    vec![
      Inst::Const { dst: v(0), value: 1 },
      Inst::Const { dst: v(1), value: 2 },
      Inst::Add { dst: v(2), lhs: v(0), rhs: v(1) },
      Inst::Ret { src: Some(v(2)) },
    ],
    3,
  );
  init_logger();
  let config = gprs(&[(true, true), (true, true)]);
  let moves_probe = MiniMoves { remat: false };
  let opts = detailed();
  let store =
    analysis::run_lifetime_analysis(&func, &config, &moves_probe, &opts);

  let mut moves = MiniMoves { remat: false };
  let mut frame = MiniFrame::new();
  let mut cached = CachedStackSlots::new(3);
  let mut stats = Stats::default();
  let store = allocate_registers_with_intervals(
    &mut func, &config, &mut moves, &mut frame, &mut cached, &opts,
    &mut stats, store,
  )
  .unwrap();

  assert_eq!(location_of(&store, 2), Location::Reg(RegNum::new(0)));
  assert_eq!(func.inserted_moves(), 0);
}
