/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Local move resolver: turns a batch of parallel moves pending at one
//! program point into a cycle-free sequence.  A move is blocked while its
//! destination is still the source of another pending move; cycles are
//! broken by parking one member's old value in a scratch spill slot.

use std::env;

use log::trace;

use crate::data_structures::{AllocatedOperand, VarId};
use crate::interface::{FrameBuilder, MoveFactory};

/// One pending move.  The source may be a constant (rematerialization);
/// constants never block anything.
pub(crate) struct MoveOp {
  pub src: AllocatedOperand,
  pub dst: AllocatedOperand,
  /// The variable whose value moves; diagnostic only.
  pub var: VarId,
  cycle_begin: Option<usize>,
  cycle_end: Option<usize>,
}

impl MoveOp {
  pub fn new(dst: AllocatedOperand, src: AllocatedOperand, var: VarId) -> Self {
    MoveOp {
      src,
      dst,
      var,
      cycle_begin: None,
      cycle_end: None,
    }
  }
}

/// Two allocated operands alias when they name the same register or the
/// same stack slot.
fn aliases(a: AllocatedOperand, b: AllocatedOperand) -> bool {
  match (a, b) {
    (AllocatedOperand::Reg(ra, _), AllocatedOperand::Reg(rb, _)) => ra == rb,
    (AllocatedOperand::Stack(sa, _), AllocatedOperand::Stack(sb, _)) => {
      sa == sb
    }
    _ => false,
  }
}

fn find_blocking_move(pending: &[MoveOp], last: &MoveOp) -> Option<usize> {
  pending.iter().position(|other| aliases(other.src, last.dst))
}

fn find_cycled_move<'a>(
  stack: &'a mut Vec<MoveOp>, from: &mut usize, last_dst: AllocatedOperand,
) -> Option<&'a mut MoveOp> {
  while *from < stack.len() {
    let i = *from;
    *from += 1;
    if aliases(stack[i].src, last_dst) {
      return Some(&mut stack[i]);
    }
  }
  None
}

/// Orders a pending batch so that no move clobbers the source of a later
/// one; cycle members are marked for the scratch dance in `emit_moves`.
/// Every input move appears in the output exactly once.
#[inline(never)]
pub(crate) fn schedule_moves(pending: &mut Vec<MoveOp>) -> Vec<MoveOp> {
  let mut ordered_moves = Vec::with_capacity(pending.len());
  let mut cur_cycles = 0;

  let show_debug = env::var("MOVES").is_ok();
  if show_debug {
    for mov in pending.iter() {
      trace!("pending move: {:?} {:?} -> {:?}", mov.var, mov.src, mov.dst);
    }
  }

  while let Some(pm) = pending.pop() {
    debug_assert!(
      !aliases(pm.src, pm.dst),
      "spurious moves should not have been inserted"
    );

    let mut stack = vec![pm];

    while !stack.is_empty() {
      let last_dst = stack.last().unwrap().dst;
      if let Some(blocking_idx) = find_blocking_move(pending, stack.last().unwrap())
      {
        let blocking_dst = pending[blocking_idx].dst;
        let mut stack_cur = 0;

        let mut has_cycles = false;
        while let Some(cycled) =
          find_cycled_move(&mut stack, &mut stack_cur, blocking_dst)
        {
          debug_assert!(cycled.cycle_end.is_none());
          cycled.cycle_end = Some(cur_cycles);
          has_cycles = true;
        }
        if has_cycles {
          let blocking = &mut pending[blocking_idx];
          debug_assert!(blocking.cycle_begin.is_none());
          blocking.cycle_begin = Some(cur_cycles);
          cur_cycles += 1;
        }

        let blocking = pending.remove(blocking_idx);
        if show_debug {
          trace!("blocker of {:?}: {:?}", last_dst, blocking.dst);
        }
        stack.push(blocking);
      } else {
        // Unblocked: its destination is not the source of anything still
        // pending.
        let last = stack.pop().unwrap();
        ordered_moves.push(last);
      }
    }
  }

  ordered_moves
}

/// Renders the ordered moves through the move factory.  At emission time
/// every destination is free; the scratch slot for cycles comes from the
/// frame builder, one per batch.
#[inline(never)]
pub(crate) fn emit_moves<I>(
  ordered_moves: Vec<MoveOp>, factory: &mut dyn MoveFactory<I>,
  frame: &mut dyn FrameBuilder,
) -> Vec<I> {
  let mut insts = Vec::with_capacity(ordered_moves.len());
  let mut scratch = None;
  let mut in_cycle = false;

  let show_debug = env::var("MOVES").is_ok();

  for mov in ordered_moves {
    if mov.cycle_end.is_some() {
      debug_assert!(in_cycle);

      // The last member of a cycle: its source was overwritten, so fill
      // the destination from the parked copy instead.
      let slot = scratch.expect("cycle without a scratch slot");
      let kind = mov
        .dst
        .kind()
        .expect("cycle destination must be a register or slot");
      if show_debug {
        trace!("cycle end: {:?} <- {:?}", mov.dst, slot);
      }
      insts
        .push(factory.make_move(mov.dst, AllocatedOperand::Stack(slot, kind)));
      in_cycle = false;
      continue;
    }

    if mov.cycle_begin.is_some() {
      debug_assert!(!in_cycle);

      // First member of a cycle: park the destination's current value
      // before it is overwritten.
      let kind = mov
        .dst
        .kind()
        .expect("cycle destination must be a register or slot");
      let slot = match scratch {
        Some(slot) => slot,
        None => {
          let slot = frame.allocate_spill_slot(kind);
          scratch = Some(slot);
          slot
        }
      };
      if show_debug {
        trace!("cycle begin: {:?} <- {:?}", slot, mov.dst);
      }
      insts
        .push(factory.make_move(AllocatedOperand::Stack(slot, kind), mov.dst));
      in_cycle = true;
    }

    if show_debug {
      trace!("move {:?}: {:?} -> {:?}", mov.var, mov.src, mov.dst);
    }
    let inst = match mov.src {
      AllocatedOperand::Constant(value) => {
        factory.make_materialize(mov.dst, value)
      }
      AllocatedOperand::Reg(..) => factory.make_move(mov.dst, mov.src),
      AllocatedOperand::Stack(..) => {
        debug_assert!(
          !matches!(mov.dst, AllocatedOperand::Stack(..)),
          "stack to stack moves cannot be resolved locally"
        );
        factory.make_move(mov.dst, mov.src)
      }
    };
    insts.push(inst);
  }

  insts
}

//=============================================================================
// Tests
