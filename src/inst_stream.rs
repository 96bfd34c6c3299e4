/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Location assignment and the final edit of the instruction stream.
//!
//! All passes record their insertions and deletions in an [`EditSet`]
//! keyed by the original numbering; the LIR is only touched at the very
//! end, so id-to-slot lookups stay valid throughout.

use std::collections::VecDeque;

use log::{debug, info};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::data_structures::{
  AllocatedOperand, BlockId, IntervalStore, Location, OpId, Operand,
  OperandMode,
};
use crate::interface::{Function, RegAllocError};

//=============================================================================
// Pending edits

/// Insertions and deletions accumulated against the numbered (unmodified)
/// instruction stream.
pub(crate) struct EditSet<I> {
  /// Instructions to insert just before the slot `(block, index)`.
  inserts: HashMap<(BlockId, usize), VecDeque<I>>,
  /// Slots to drop.
  deletes: HashSet<(BlockId, usize)>,
}

impl<I> EditSet<I> {
  pub fn new() -> EditSet<I> {
    EditSet {
      inserts: HashMap::default(),
      deletes: HashSet::default(),
    }
  }

  /// Queue `insts` in front of the instruction with the given id.
  pub fn insert_before_id(
    &mut self, store: &IntervalStore, id: OpId, insts: Vec<I>,
  ) {
    let slot = store.numbering().inst_slot(id);
    self.inserts.entry(slot).or_default().extend(insts);
  }

  /// Queue `insts` in front of the instruction with the given id, ahead of
  /// anything already queued there.  Stores of vacated registers go first:
  /// a queued move may reuse the register being vacated.
  pub fn insert_before_id_front(
    &mut self, store: &IntervalStore, id: OpId, insts: Vec<I>,
  ) {
    let slot = store.numbering().inst_slot(id);
    let queue = self.inserts.entry(slot).or_default();
    for inst in insts.into_iter().rev() {
      queue.push_front(inst);
    }
  }

  pub fn delete_at(&mut self, store: &IntervalStore, id: OpId) {
    let slot = store.numbering().inst_slot(id);
    self.deletes.insert(slot);
  }

  pub fn is_empty(&self) -> bool {
    self.inserts.is_empty() && self.deletes.is_empty()
  }

  pub fn num_inserted(&self) -> usize {
    self.inserts.values().map(|q| q.len()).sum()
  }

  pub fn num_deleted(&self) -> usize {
    self.deletes.len()
  }
}

//=============================================================================
// Location assignment

/// Rewrites every variable operand to the location of its use-point's split
/// child.  Temps follow the output rule, alives the input rule.
#[inline(never)]
pub(crate) fn assign_locations<F: Function>(
  func: &mut F, store: &IntervalStore,
) -> Result<(), RegAllocError> {
  info!("assign locations: begin");

  let blocks: Vec<BlockId> = func.blocks().to_vec();
  let mut id = OpId::min_value();
  for &block in &blocks {
    let insns = func.insns_mut(block);
    for inst in insns.iter_mut() {
      let mut failed = None;
      F::map_operands(inst, &mut |operand, mode| {
        map_operand(store, operand, id, mode, &mut failed)
      });
      if let Some(err) = failed {
        return Err(err);
      }
      id = id.plus(2);
    }
  }

  info!("assign locations: end");
  Ok(())
}

fn map_operand(
  store: &IntervalStore, operand: Operand, id: OpId, mode: OperandMode,
  failed: &mut Option<RegAllocError>,
) -> Option<AllocatedOperand> {
  let var = match operand {
    // Registers and immediates stay as they are.
    Operand::Reg(_) => return None,
    Operand::Var(v) => v,
  };
  let root = match store.interval_for(var) {
    Some(root) => root,
    None => {
      *failed = Some(RegAllocError::SplitChildMiss { var, pos: id });
      return None;
    }
  };
  let child = match store.split_child_at(root, id, mode) {
    Some(child) => child,
    None => {
      *failed = Some(RegAllocError::SplitChildMiss { var, pos: id });
      return None;
    }
  };
  let kind = store.get(child).kind;
  match store.get(child).location {
    Location::Reg(reg) => Some(AllocatedOperand::Reg(reg, kind)),
    Location::Stack(slot) => Some(AllocatedOperand::Stack(slot, kind)),
    Location::Illegal => {
      let value = store
        .material(child)
        .expect("illegal location without materialization value");
      Some(AllocatedOperand::Constant(value))
    }
    Location::Unassigned => {
      *failed = Some(RegAllocError::Verifier(format!(
        "{:?} has no location at {:?}",
        var, id
      )));
      None
    }
  }
}

//=============================================================================
// Final splice

/// Applies the accumulated edits, block by block.  This is the only place
/// that changes instruction counts; it runs after every id-based lookup is
/// done.
#[inline(never)]
pub(crate) fn apply_edits<F: Function>(
  func: &mut F, store: &IntervalStore, mut edits: EditSet<F::Inst>,
) {
  if edits.is_empty() {
    return;
  }
  debug!(
    "applying edits: {} insertions, {} deletions",
    edits.num_inserted(),
    edits.num_deleted()
  );

  let blocks: Vec<BlockId> = store.numbering().blocks().to_vec();
  for &block in &blocks {
    let touched = edits
      .inserts
      .keys()
      .any(|&(b, _)| b == block)
      || edits.deletes.iter().any(|&(b, _)| b == block);
    if !touched {
      continue;
    }

    let old = std::mem::take(func.insns_mut(block));
    let mut new = Vec::with_capacity(old.len() + 4);
    for (i, inst) in old.into_iter().enumerate() {
      if let Some(queue) = edits.inserts.remove(&(block, i)) {
        new.extend(queue);
      }
      if !edits.deletes.contains(&(block, i)) {
        new.push(inst);
      }
    }
    *func.insns_mut(block) = new;
  }

  debug_assert!(
    edits.inserts.is_empty(),
    "insertions past the end of a block"
  );
}
