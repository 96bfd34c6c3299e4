/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Verifier for the finished allocation, run under the detailed-asserts
//! option.
//!
//! Index corruption in the interval arena is a bug and panics; an
//! allocation that merely violates the register invariants produces a
//! bailout so the caller can retry with a different allocator.

use log::{info, trace};

use crate::data_structures::{IntervalStore, Location, OpId, Operand};
use crate::interface::{Function, RegAllocError, RegisterConfig};
use crate::linear_scan::sorted_fixed_by_from;

pub(crate) fn verify<F: Function>(
  func: &F, store: &IntervalStore, config: &RegisterConfig,
) -> Result<(), RegAllocError> {
  info!("verifying allocation");
  verify_intervals(store, config)?;
  verify_no_refs_in_fixed(func, store)?;
  trace!("no errors found");
  Ok(())
}

fn verify_intervals(
  store: &IntervalStore, config: &RegisterConfig,
) -> Result<(), RegAllocError> {
  let ids: Vec<_> = store.ids().collect();

  for &id in &ids {
    let int = store.get(id);

    assert!(
      int.operand_number as usize == id.index(),
      "interval {:?} is stored at index {}",
      id,
      id.index()
    );

    if int.is_empty() {
      return Err(RegAllocError::Verifier(format!(
        "{:?} has no range",
        id
      )));
    }
    if int.from() >= int.to() {
      return Err(RegAllocError::Verifier(format!(
        "{:?} has a zero-length range",
        id
      )));
    }
    match int.location {
      Location::Unassigned => {
        return Err(RegAllocError::Verifier(format!(
          "{:?} has no location assigned",
          id
        )));
      }
      Location::Reg(reg) => {
        if !config.is_allocatable(reg) {
          return Err(RegAllocError::Verifier(format!(
            "{:?} sits in non-allocatable {:?}",
            id, reg
          )));
        }
      }
      Location::Illegal => {
        if !store.can_materialize(id) {
          return Err(RegAllocError::Verifier(format!(
            "{:?} is marked illegal but cannot rematerialize",
            id
          )));
        }
      }
      Location::Stack(_) => {}
    }
  }

  // No two intersecting variable intervals may share a location.
  for (i, &a) in ids.iter().enumerate() {
    for &b in &ids[i + 1..] {
      let ia = store.get(a);
      let ib = store.get(b);
      if ia.location.is_illegal() || ia.location != ib.location {
        continue;
      }
      if ia.first_intersection(ib).is_some() {
        return Err(RegAllocError::Verifier(format!(
          "{:?} and {:?} overlap in {:?}",
          a, b, ia.location
        )));
      }
    }
  }

  // No fixed interval may intersect a variable interval holding the same
  // register.
  for &id in &ids {
    let int = store.get(id);
    if let Some(reg) = int.location.reg() {
      if let Some(fixed) = store.fixed_interval_for(reg) {
        if int.first_intersection_with_fixed(fixed).is_some() {
          return Err(RegAllocError::Verifier(format!(
            "{:?} overlaps the fixed interval of {:?}",
            id, reg
          )));
        }
      }
    }
  }

  Ok(())
}

/// At every safepoint, a fixed interval holding a reference must belong to
/// the instruction itself: a live reference in a register the state map
/// does not know about would be a stale root at a GC point.
fn verify_no_refs_in_fixed<F: Function>(
  func: &F, store: &IntervalStore,
) -> Result<(), RegAllocError> {
  let numbering = store.numbering();
  let fixed_regs = sorted_fixed_by_from(store);
  if fixed_regs.is_empty() {
    return Ok(());
  }

  let mut id = OpId::min_value();
  for &block in numbering.blocks() {
    for inst in func.insns(block) {
      let cur = id;
      id = id.plus(2);

      if !numbering.has_state(cur) {
        continue;
      }

      for &reg in &fixed_regs {
        let fixed = store.fixed_interval_for(reg).unwrap();
        let live_across = fixed
          .ref_ranges()
          .iter()
          .any(|r| r.covers(cur) && r.to > cur.plus(1));
        if !live_across {
          continue;
        }

        let mut named = false;
        F::visit_operands(inst, &mut |operand, _mode, _use_kind, _kind| {
          if operand == Operand::Reg(reg) {
            named = true;
          }
        });
        if !named {
          return Err(RegAllocError::Verifier(format!(
            "{:?} holds a reference across the safepoint at {:?}",
            reg, cur
          )));
        }
      }
    }
  }

  Ok(())
}

//=============================================================================
// Tests
