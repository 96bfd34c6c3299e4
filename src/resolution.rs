/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data-flow resolution.
//!
//! Two producers of pending moves, both drained through the local move
//! resolver:
//!
//! 1. In-block fixups: a split child picks up its value from the preceding
//!    part of its family at the split gap (reload, register move or
//!    rematerialization), and spilled parts get their store.
//! 2. Intra-trace block edges: a value live across the edge between two
//!    consecutive trace blocks may sit in different locations on either
//!    side; the difference is reconciled by parallel moves spliced in
//!    front of the predecessor's terminator.
//!
//! Edges leaving the trace are deliberately not touched; a separate
//! cross-trace fix-up pass owns them.

use log::{debug, info};
use rustc_hash::FxHashMap as HashMap;

use crate::data_structures::{
  AllocatedOperand, IntervalId, IntervalStore, Location, OpId, OperandMode,
  SpillState,
};
use crate::inst_stream::EditSet;
use crate::interface::{FrameBuilder, Function, MoveFactory, RegAllocError};
use crate::move_resolver::{emit_moves, schedule_moves, MoveOp};

#[inline(never)]
pub(crate) fn resolve_data_flow<F, M, B>(
  func: &F, store: &IntervalStore, moves: &mut M, frame: &mut B,
  edits: &mut EditSet<F::Inst>,
) -> Result<(), RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
  B: FrameBuilder,
{
  info!("resolve data flow: begin");
  resolve_split_fixups(store, moves, frame, edits)?;
  resolve_trace_edges(func, store, moves, frame, edits)?;
  info!("resolve data flow: end");
  Ok(())
}

/// The allocated operand of an interval, for building moves.
fn allocated(
  store: &IntervalStore, id: IntervalId,
) -> Option<AllocatedOperand> {
  let int = store.get(id);
  match int.location {
    Location::Reg(reg) => Some(AllocatedOperand::Reg(reg, int.kind)),
    Location::Stack(slot) => Some(AllocatedOperand::Stack(slot, int.kind)),
    Location::Illegal => store.material(id).map(AllocatedOperand::Constant),
    Location::Unassigned => {
      panic!("{:?} has no location after allocation", id)
    }
  }
}

/// The even instruction id a gap position resolves to for insertion.
fn insertion_id(pos: OpId) -> OpId {
  if pos.is_even() {
    pos
  } else {
    pos.plus(1)
  }
}

//=============================================================================
// In-block split fixups

fn resolve_split_fixups<I, M, B>(
  store: &IntervalStore, moves: &mut M, frame: &mut B,
  edits: &mut EditSet<I>,
) -> Result<(), RegAllocError>
where
  M: MoveFactory<I>,
  B: FrameBuilder,
{
  let numbering = store.numbering();
  let mut pending: HashMap<OpId, Vec<MoveOp>> = HashMap::default();

  for index in store.first_derived_index()..store.intervals_len() {
    let child = IntervalId::new(index);
    let child_from = store.get(child).from();
    let root = store.get(child).split_parent;

    // The family member the value comes from: the one right before this
    // child in the family order.
    let children = store.split_children(root);
    let pos = children
      .iter()
      .position(|&c| c == child)
      .expect("split child missing from its family");
    debug_assert!(pos > 0, "family root sorts first");
    let pred = children[pos - 1];

    // Splits at a block boundary are reconciled by the edge resolution
    // below (or by the external cross-trace pass).
    if child_from.is_even() && numbering.is_block_begin(child_from) {
      continue;
    }

    let at = insertion_id(child_from);
    match (store.get(pred).location, store.get(child).location) {
      (a, b) if a == b => {}
      (_, Location::Illegal) => {
        // Rematerialized at its uses; nothing flows.
      }
      (Location::Stack(from_slot), Location::Stack(to_slot)) => {
        debug_assert!(
          from_slot == to_slot,
          "one split family must share its canonical slot"
        );
      }
      (_, Location::Stack(_)) => {
        // The child is the spilled part: store the old value, unless the
        // family stores at its definition (or started in memory).
        match store.spill_state(child) {
          SpillState::StoreAtDefinition | SpillState::StartInMemory => {}
          _ => {
            let src = allocated(store, pred)
              .expect("spill source must have a location");
            let dst = allocated(store, child).unwrap();
            debug!(
              "split store for {:?} at {:?}: {:?} -> {:?}",
              store.get(child).var,
              at,
              src,
              dst
            );
            let inst = match src {
              AllocatedOperand::Constant(value) => {
                moves.make_materialize(dst, value)
              }
              _ => moves.make_move(dst, src),
            };
            edits.insert_before_id_front(store, at, vec![inst]);
          }
        }
      }
      (_, Location::Reg(_)) => {
        // Reload or shuffle into the child's register.
        let src =
          allocated(store, pred).expect("source must have a location");
        let dst = allocated(store, child).unwrap();
        debug!(
          "split fixup for {:?} at {:?}: {:?} -> {:?}",
          store.get(child).var,
          at,
          src,
          dst
        );
        pending
          .entry(at)
          .or_default()
          .push(MoveOp::new(dst, src, store.get(child).var));
      }
      (_, Location::Unassigned) => {
        panic!("{:?} has no location after allocation", child)
      }
    }
  }

  // Flush the register shuffles, one parallel batch per gap.
  let mut at_points: Vec<OpId> = pending.keys().copied().collect();
  at_points.sort();
  for at in at_points {
    let mut batch = pending.remove(&at).unwrap();
    let ordered = schedule_moves(&mut batch);
    let insts = emit_moves(ordered, moves, frame);
    edits.insert_before_id(store, at, insts);
  }

  Ok(())
}

//=============================================================================
// Intra-trace edges

fn resolve_trace_edges<F, M, B>(
  func: &F, store: &IntervalStore, moves: &mut M, frame: &mut B,
  edits: &mut EditSet<F::Inst>,
) -> Result<(), RegAllocError>
where
  F: Function,
  M: MoveFactory<F::Inst>,
  B: FrameBuilder,
{
  let numbering = store.numbering();
  let blocks = numbering.blocks();

  for pair in blocks.windows(2) {
    let (block, next) = (pair[0], pair[1]);
    if !func.block_succs(block).contains(&next) {
      // Consecutive on the trace but not a CFG edge; nothing flows here.
      continue;
    }

    let src_pos = numbering.block_last_id(block);
    let dst_pos = numbering.block_first_id(next);
    let mut batch: Vec<MoveOp> = Vec::new();

    for root in store.root_ids() {
      // A lookup miss on either side means the value is not live across
      // this edge.
      let src_child =
        match store.split_child_at(root, src_pos, OperandMode::Output) {
          Some(c) => c,
          None => continue,
        };
      let dst_child =
        match store.split_child_at(root, dst_pos, OperandMode::Input) {
          Some(c) => c,
          None => continue,
        };
      if src_child == dst_child {
        continue;
      }

      let src_loc = store.get(src_child).location;
      let dst_loc = store.get(dst_child).location;
      if src_loc == dst_loc {
        continue;
      }
      if dst_loc.is_illegal() {
        continue;
      }
      if let (Location::Stack(a), Location::Stack(b)) = (src_loc, dst_loc) {
        debug_assert!(a == b, "split family slots diverged across an edge");
        continue;
      }

      let src = allocated(store, src_child)
        .expect("edge source must have a location");
      let dst = allocated(store, dst_child).unwrap();
      debug!(
        "edge fixup {:?} -> {:?} for {:?}: {:?} -> {:?}",
        block,
        next,
        store.get(root).var,
        src,
        dst
      );
      batch.push(MoveOp::new(dst, src, store.get(root).var));
    }

    if !batch.is_empty() {
      let ordered = schedule_moves(&mut batch);
      let insts = emit_moves(ordered, moves, frame);
      // In front of the predecessor's terminator.
      edits.insert_before_id(store, src_pos, insts);
    }
  }

  Ok(())
}
