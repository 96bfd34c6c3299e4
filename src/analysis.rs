/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Lifetime analysis: one backward pass over the trace computing live
//! ranges, use positions and fixed-interval constraints.
//!
//! Blocks are visited in reverse linear order, instructions in reverse
//! within each block.  A use opens a range with a provisional start at the
//! trace entry; the definition closes it.  Values never defined on the
//! trace keep the provisional start and behave like entry parameters.

use log::{debug, info};
use smallvec::SmallVec;

use crate::data_structures::{
  IntervalStore, Numbering, OpId, Operand, OperandMode, SpillState, UseKind,
  ValueKind,
};
use crate::interface::{
  AllocationOptions, Function, MoveFactory, RegisterConfig,
};

/// One operand occurrence, as reported by the client visitor.
struct OperandVisit {
  operand: Operand,
  kind: ValueKind,
  use_kind: UseKind,
}

#[inline(never)]
pub fn run_lifetime_analysis<F, M>(
  func: &F, config: &RegisterConfig, moves: &M, opts: &AllocationOptions,
) -> IntervalStore
where
  F: Function,
  M: MoveFactory<F::Inst>,
{
  info!("lifetime analysis: begin");

  let numbering = Numbering::compute(func);
  let max_op_id = numbering.max_op_id();
  let mut store =
    IntervalStore::new(numbering, func.num_vars(), config.num_regs());
  let mut call_positions = Vec::new();

  // Reverse linear order over blocks, reverse over instructions.
  let blocks: Vec<_> = func.blocks().to_vec();
  let mut next_id = max_op_id.plus(2);
  for &block in blocks.iter().rev() {
    for inst in func.insns(block).iter().rev() {
      let id = next_id.minus(2);
      next_id = id;

      // Sort the operand visits into per-mode buckets; modes are handled
      // defs-first so a definition sees the range its uses opened.
      let mut outputs: SmallVec<[OperandVisit; 2]> = SmallVec::new();
      let mut temps: SmallVec<[OperandVisit; 2]> = SmallVec::new();
      let mut alives: SmallVec<[OperandVisit; 2]> = SmallVec::new();
      let mut inputs: SmallVec<[OperandVisit; 4]> = SmallVec::new();
      F::visit_operands(inst, &mut |operand, mode, use_kind, kind| {
        let visit = OperandVisit {
          operand,
          kind,
          use_kind,
        };
        match mode {
          OperandMode::Output => outputs.push(visit),
          OperandMode::Temp => temps.push(visit),
          OperandMode::Alive => alives.push(visit),
          OperandMode::Input => inputs.push(visit),
        }
      });

      if func.destroys_caller_saved(inst) {
        for reg in config.caller_saved_regs() {
          store
            .get_or_create_fixed_interval(reg)
            .add_range(id, id.plus(1));
        }
        call_positions.push(id);
      }

      for out in &outputs {
        match out.operand {
          Operand::Var(_) => {
            let int_id = store.get_or_create_interval(out.operand, out.kind);
            {
              let int = store.get_mut(int_id);
              if int.is_empty() {
                // Dead definition: keep a vacuous range so the output still
                // gets a register.
                int.add_range(id, id.plus(1));
              } else {
                int.set_from(id);
              }
              int.add_use(id, out.use_kind);
            }
            store.set_spill_definition_pos(int_id, id);
            if store.spill_state(int_id) == SpillState::NoDefinitionFound {
              store.set_spill_state(int_id, SpillState::OneDefinitionFound);
            }

            // Move destinations inherit the source interval as a register
            // hint, so both ends coalesce into one register when possible.
            // The source interval may not have been seen yet at this point
            // of the backward scan.
            if let Some((dst, src)) = F::as_move(inst) {
              if dst == out.operand && src != out.operand {
                if let Some(src_var) = src.as_var() {
                  let hint = store
                    .get_or_create_interval(src, func.var_kind(src_var));
                  store.get_mut(int_id).location_hint = Some(hint);
                  debug!("hint for {:?}: {:?}", out.operand, hint);
                }
              }
            }

            // Trivially materializable constants spill by rematerializing
            // at their uses instead of through a stack slot.
            if !opts.never_spill_constants {
              if let Some((dst, value)) = F::as_constant_load(inst) {
                if dst == out.operand && moves.allow_constant_to_stack_move(value)
                {
                  store.get_mut(int_id).material = Some(value);
                  debug!("{:?} can rematerialize {:?}", out.operand, value);
                }
              }
            }
          }
          Operand::Reg(reg) => {
            if config.is_allocatable(reg) {
              let fixed = store.get_or_create_fixed_interval(reg);
              fixed.add_range(id, id.plus(1));
              if out.kind == ValueKind::Reference {
                fixed.add_ref_range(id, id.plus(1));
              }
            }
          }
        }
      }

      for tmp in &temps {
        match tmp.operand {
          Operand::Var(_) => {
            let int_id = store.get_or_create_interval(tmp.operand, tmp.kind);
            let int = store.get_mut(int_id);
            int.add_range(id, id.plus(1));
            int.add_use(id, tmp.use_kind);
          }
          Operand::Reg(reg) => {
            if config.is_allocatable(reg) {
              let fixed = store.get_or_create_fixed_interval(reg);
              fixed.add_range(id, id.plus(1));
              if tmp.kind == ValueKind::Reference {
                fixed.add_ref_range(id, id.plus(1));
              }
            }
          }
        }
      }

      // Alive operands must survive past the output side of the
      // instruction: their range covers the instruction and the gap after
      // it, so they conflict with outputs, temps, and moves inserted into
      // that gap.
      for alive in &alives {
        match alive.operand {
          Operand::Var(_) => {
            let int_id =
              store.get_or_create_interval(alive.operand, alive.kind);
            let int = store.get_mut(int_id);
            int.add_range(OpId::min_value(), id.plus(2));
            int.add_use(id, alive.use_kind);
          }
          Operand::Reg(reg) => {
            if config.is_allocatable(reg) {
              let fixed = store.get_or_create_fixed_interval(reg);
              fixed.add_range(id, id.plus(2));
              if alive.kind == ValueKind::Reference {
                fixed.add_ref_range(id, id.plus(2));
              }
            }
          }
        }
      }

      // Input ranges end at the reading instruction: the read happens
      // before the outputs are written, so a dying input and an output of
      // the same instruction may share a register.
      for input in &inputs {
        match input.operand {
          Operand::Var(_) => {
            let int_id =
              store.get_or_create_interval(input.operand, input.kind);
            let to = if id == OpId::min_value() { id.plus(1) } else { id };
            let int = store.get_mut(int_id);
            int.add_range(OpId::min_value(), to);
            int.add_use(id, input.use_kind);
          }
          Operand::Reg(reg) => {
            if config.is_allocatable(reg) {
              let fixed = store.get_or_create_fixed_interval(reg);
              fixed.add_range(id, id.plus(1));
              if input.kind == ValueKind::Reference {
                fixed.add_ref_range(id, id.plus(1));
              }
            }
          }
        }
      }
    }
  }
  debug_assert!(next_id == OpId::min_value());

  call_positions.reverse();
  store.set_call_positions(call_positions);

  info!(
    "lifetime analysis: end, {} intervals over {} instructions",
    store.ids().count(),
    store.numbering().num_insts()
  );
  store
}
