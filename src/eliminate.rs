/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Spill-move elimination.
//!
//! Two jobs, both conservative:
//!
//! * drop client move instructions whose source and destination intervals
//!   resolve to the same location at the move's position (coalesced moves,
//!   moves between parts of one spilled family);
//! * for families that spill more than once, store the value a single time
//!   right after its definition instead of at every split gap.

use log::{debug, info};

use crate::data_structures::{
  AllocatedOperand, IntervalStore, Location, OpId, OperandMode, SpillState,
};
use crate::inst_stream::EditSet;
use crate::interface::{Function, MoveFactory, RegAllocError};
use crate::linear_scan::sorted_by_spill_pos;

#[inline(never)]
pub(crate) fn eliminate_spill_moves<F, M>(
  func: &F, store: &IntervalStore, moves: &mut M, edits: &mut EditSet<F::Inst>,
) -> Result<(), RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
{
  info!("eliminate spill moves: begin");
  let mut eliminated = 0usize;

  // Pass 1: same-location moves.
  let numbering = store.numbering();
  let mut id = OpId::min_value();
  for &block in numbering.blocks() {
    for inst in func.insns(block) {
      let cur = id;
      id = id.plus(2);

      let (dst, src) = match F::as_move(inst) {
        Some(pair) => pair,
        None => continue,
      };
      let (dst_var, src_var) = match (dst.as_var(), src.as_var()) {
        (Some(d), Some(s)) => (d, s),
        // Moves involving fixed registers are constraints, not
        // candidates.
        _ => continue,
      };

      let dst_root = store
        .interval_for(dst_var)
        .ok_or(RegAllocError::SplitChildMiss {
          var: dst_var,
          pos: cur,
        })?;
      let src_root = store
        .interval_for(src_var)
        .ok_or(RegAllocError::SplitChildMiss {
          var: src_var,
          pos: cur,
        })?;
      let dst_child = store
        .split_child_at(dst_root, cur, OperandMode::Output)
        .ok_or(RegAllocError::SplitChildMiss {
          var: dst_var,
          pos: cur,
        })?;
      let src_child = store
        .split_child_at(src_root, cur, OperandMode::Input)
        .ok_or(RegAllocError::SplitChildMiss {
          var: src_var,
          pos: cur,
        })?;

      let dst_loc = store.get(dst_child).location;
      let src_loc = store.get(src_child).location;
      if !dst_loc.is_unassigned() && dst_loc == src_loc {
        debug!(
          "eliminating move {:?} <- {:?} at {:?} ({:?})",
          dst_var, src_var, cur, dst_loc
        );
        edits.delete_at(store, cur);
        eliminated += 1;
      }
    }
  }

  // Pass 2: single store at the definition for families that spill more
  // than once.
  for id in sorted_by_spill_pos(store) {
    if id.index() >= store.first_derived_index() {
      continue;
    }
    if store.spill_state(id) != SpillState::StoreAtDefinition {
      continue;
    }
    let def = store
      .spill_definition_pos(id)
      .expect("store-at-definition family without a definition");
    let slot = store
      .spill_slot(id)
      .expect("store-at-definition family without a slot");

    let def_child = match store.split_child_at(id, def, OperandMode::Output) {
      Some(c) => c,
      None => continue,
    };
    let reg = match store.get(def_child).location {
      Location::Reg(reg) => reg,
      // The defining part is not in a register; leave the per-split
      // stores alone.
      _ => continue,
    };
    let kind = store.get(def_child).kind;

    // The walker never hoists a store for a definition at a block end, so
    // the following instruction is in the same block.
    debug_assert!(!numbering.is_block_end(def));
    let at = def.plus(2);
    debug!(
      "storing {:?} once at its definition {:?}: {:?} -> {:?}",
      store.get(id).var,
      def,
      reg,
      slot
    );
    let inst = moves.make_move(
      AllocatedOperand::Stack(slot, kind),
      AllocatedOperand::Reg(reg, kind),
    );
    edits.insert_before_id_front(store, at, vec![inst]);
  }

  info!("eliminate spill moves: end, {} moves dropped", eliminated);
  Ok(())
}
