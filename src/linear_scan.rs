/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The linear scan walk, following
//!   Optimized Interval Splitting in a Linear Scan Register Allocator,
//!     by Wimmer and Moessenboeck, 2005.
//!
//! Intervals are processed in ascending start order.  Each one either finds
//! a register that is free long enough, grabs a partially free register and
//! splits at the collision, or competes by use distance: the interval whose
//! next register use is furthest away gets spilled.

use log::{debug, info, trace};
use smallvec::SmallVec;

use crate::data_structures::{
  IntervalId, IntervalStore, Location, OpId, RegNum, SpillState,
  UseKind,
};
use crate::interface::{
  AllocationOptions, CachedStackSlots, FrameBuilder, RegAllocError, RegClass,
  RegisterConfig, Stats,
};

//=============================================================================
// Sorting scaffolding

/// Root intervals ordered by `from()`.  Creation order (definition order) is
/// almost sorted already, so one insertion-sort cleanup pass beats a full
/// sort.
pub(crate) fn sort_intervals_before_allocation(
  store: &IntervalStore,
) -> Vec<IntervalId> {
  let mut sorted: Vec<IntervalId> = Vec::new();
  let mut sorted_from_max = OpId::min_value();
  for id in store.root_ids() {
    if store.get(id).is_empty() {
      continue;
    }
    let from = store.get(id).from();
    if sorted_from_max <= from {
      sorted.push(id);
      sorted_from_max = from;
    } else {
      let mut j = sorted.len();
      while j > 0 && from < store.get(sorted[j - 1]).from() {
        j -= 1;
      }
      sorted.insert(j, id);
    }
  }
  sorted
}

/// Fixed intervals ordered by `from()`.
pub(crate) fn sorted_fixed_by_from(store: &IntervalStore) -> Vec<RegNum> {
  let mut regs: Vec<RegNum> =
    store.fixed_intervals().map(|f| f.reg).collect();
  regs.sort_by_key(|&r| store.fixed_interval_for(r).unwrap().from());
  regs
}

/// Merge the split children created during allocation into the sorted list:
/// sort the fresh tail conventionally, then one linear merge.
pub(crate) fn sort_intervals_after_allocation(
  store: &IntervalStore, sorted: &mut Vec<IntervalId>,
) {
  if !store.has_derived_intervals() {
    // No intervals were added during allocation.
    return;
  }
  let mut tail: Vec<IntervalId> = (store.first_derived_index()
    ..store.intervals_len())
    .map(IntervalId::new)
    .collect();
  tail.sort_by_key(|&id| store.get(id).from());

  let old = std::mem::take(sorted);
  let mut merged = Vec::with_capacity(old.len() + tail.len());
  let (mut oi, mut ti) = (0, 0);
  while oi < old.len() || ti < tail.len() {
    if ti >= tail.len()
      || (oi < old.len()
        && store.get(old[oi]).from() <= store.get(tail[ti]).from())
    {
      merged.push(old[oi]);
      oi += 1;
    } else {
      merged.push(tail[ti]);
      ti += 1;
    }
  }
  *sorted = merged;
}

/// All intervals ordered by their family's spill definition position; what
/// the spill-move eliminator walks.
pub(crate) fn sorted_by_spill_pos(store: &IntervalStore) -> Vec<IntervalId> {
  let mut ids: Vec<IntervalId> = store.ids().collect();
  ids.sort_by_key(|&id| {
    store
      .spill_definition_pos(id)
      .unwrap_or_else(OpId::max_value)
  });
  ids
}

//=============================================================================
// Per-class register scratchpad

struct RegMap {
  regs: SmallVec<[(RegNum, OpId); 8]>,
}

impl RegMap {
  fn new(config: &RegisterConfig, class: RegClass, init: OpId) -> RegMap {
    let regs = config.allocatable_regs(class).map(|r| (r, init)).collect();
    RegMap { regs }
  }

  fn is_empty(&self) -> bool {
    self.regs.is_empty()
  }

  fn get(&self, reg: RegNum) -> Option<OpId> {
    self.regs.iter().find(|(r, _)| *r == reg).map(|(_, p)| *p)
  }

  fn shrink(&mut self, reg: RegNum, pos: OpId) {
    if let Some(entry) = self.regs.iter_mut().find(|(r, _)| *r == reg) {
      entry.1 = entry.1.min(pos);
    }
  }

  fn iter(&self) -> impl Iterator<Item = (RegNum, OpId)> + '_ {
    self.regs.iter().copied()
  }
}

//=============================================================================
// The walker

struct Walker<'a, B: FrameBuilder> {
  store: &'a mut IntervalStore,
  config: &'a RegisterConfig,
  frame: &'a mut B,
  cached_slots: &'a mut CachedStackSlots,
  opts: &'a AllocationOptions,
  stats: &'a mut Stats,
  /// Reverse-sorted by `from()`, so the next interval is a pop.
  unhandled: Vec<IntervalId>,
  /// Holding a register and live at the walk position.
  active: Vec<IntervalId>,
  /// Holding a register but currently in a lifetime hole.
  inactive: Vec<IntervalId>,
}

#[inline(never)]
pub(crate) fn run_allocation<B: FrameBuilder>(
  store: &mut IntervalStore, config: &RegisterConfig, frame: &mut B,
  cached_slots: &mut CachedStackSlots, opts: &AllocationOptions,
  stats: &mut Stats,
) -> Result<(), RegAllocError> {
  info!("register allocation walk: begin");

  let mut sorted = sort_intervals_before_allocation(store);
  debug_assert!(
    sorted.windows(2).all(|w| store.get(w[0]).from() <= store.get(w[1]).from()),
    "interval list is not sorted"
  );

  let unhandled: Vec<IntervalId> = sorted.iter().rev().copied().collect();
  let mut walker = Walker {
    store,
    config,
    frame,
    cached_slots,
    opts,
    stats,
    unhandled,
    active: Vec::new(),
    inactive: Vec::new(),
  };

  #[cfg(debug_assertions)]
  let mut prev_start = OpId::min_value();

  while let Some(cur) = walker.unhandled.pop() {
    trace!("walk: {}", walker.store.display(cur));

    #[cfg(debug_assertions)]
    {
      let start = walker.store.get(cur).from();
      debug_assert!(prev_start <= start, "walk must make progress");
      prev_start = start;
    }

    walker.update_state(cur);

    if walker.store.get(cur).location.is_unassigned() {
      if !walker.try_allocate_free_reg(cur) {
        walker.allocate_blocked_reg(cur)?;
      }
    }
    if walker.store.get(cur).location.reg().is_some() {
      walker.active.push(cur);
    }
  }

  sort_intervals_after_allocation(walker.store, &mut sorted);
  debug_assert!(
    sorted
      .windows(2)
      .all(|w| walker.store.get(w[0]).from() <= walker.store.get(w[1]).from()),
    "merged interval list is not sorted"
  );

  info!("register allocation walk: end");
  Ok(())
}

impl<'a, B: FrameBuilder> Walker<'a, B> {
  /// Transitions intervals between active/inactive/handled as the walk
  /// position advances to `cur`'s start.
  fn update_state(&mut self, cur: IntervalId) {
    let position = self.store.get(cur).from();
    let store = &*self.store;

    let mut next_active = Vec::with_capacity(self.active.len());
    let mut next_inactive = Vec::with_capacity(self.inactive.len());

    for &id in self.active.iter().chain(self.inactive.iter()) {
      let int = store.get(id);
      if int.to() <= position {
        // Expired.
      } else if int.covers(position) {
        next_active.push(id);
      } else {
        next_inactive.push(id);
      }
    }

    self.active = next_active;
    self.inactive = next_inactive;
    trace!("active: {:?} inactive: {:?}", self.active, self.inactive);
  }

  /// Step 2 of the walk: allocate without spilling.  Returns false when no
  /// register is free at the interval's start.
  fn try_allocate_free_reg(&mut self, cur: IntervalId) -> bool {
    let (cur_from, cur_to, class) = {
      let int = self.store.get(cur);
      (int.from(), int.to(), RegClass::of(int.kind))
    };

    let mut free_until =
      RegMap::new(self.config, class, OpId::max_value());
    if free_until.is_empty() {
      return false;
    }

    for &id in &self.active {
      if let Some(reg) = self.store.get(id).location.reg() {
        free_until.shrink(reg, OpId::min_value());
      }
    }
    for &id in &self.inactive {
      let int = self.store.get(id);
      if let Some(reg) = int.location.reg() {
        if let Some(x) = int.first_intersection(self.store.get(cur)) {
          free_until.shrink(reg, x);
        }
      }
    }
    for (reg, _) in free_until.iter().collect::<SmallVec<[_; 8]>>() {
      if let Some(fixed) = self.store.fixed_interval_for(reg) {
        if let Some(x) =
          self.store.get(cur).first_intersection_with_fixed(fixed)
        {
          free_until.shrink(reg, x);
        }
      }
    }

    // The move hint wins outright if its register is free for the whole
    // interval.
    let hint_reg = self
      .store
      .get(cur)
      .location_hint
      .and_then(|h| self.store.get(h).location.reg());
    if let Some(hint) = hint_reg {
      if free_until.get(hint).map_or(false, |pos| pos >= cur_to) {
        debug!("{:?} takes hinted {:?}", cur, hint);
        self.store.get_mut(cur).location = Location::Reg(hint);
        return true;
      }
    }

    let best = self.pick_register(&free_until, cur_from, cur_to);
    let (best_reg, best_pos) = match best {
      Some(b) => b,
      None => return false,
    };

    if best_pos <= cur_from {
      // No register free at the start.
      return false;
    }
    if best_pos >= cur_to {
      debug!("{:?} -> {:?} (free)", cur, best_reg);
      self.store.get_mut(cur).location = Location::Reg(best_reg);
      return true;
    }

    // Partially free: take the register and split at the collision.
    let split_at = self.gap_split_pos(best_pos, cur_from);
    if split_at <= cur_from {
      return false;
    }
    debug!(
      "{:?} -> {:?} until {:?}, splitting",
      cur, best_reg, best_pos
    );
    self.store.get_mut(cur).location = Location::Reg(best_reg);
    let tail = self.store.split(cur, split_at);
    self.insert_unhandled(tail);
    true
  }

  /// Step 3 of the walk: all registers are blocked at the start; either
  /// spill `cur` or evict the holder whose next register use is furthest.
  fn allocate_blocked_reg(
    &mut self, cur: IntervalId,
  ) -> Result<(), RegAllocError> {
    let (cur_from, cur_to, kind, class) = {
      let int = self.store.get(cur);
      (int.from(), int.to(), int.kind, RegClass::of(int.kind))
    };

    let first_use = self.store.get(cur).first_use(UseKind::MustHaveRegister);
    let first_use = match first_use {
      Some(pos) => pos,
      None => {
        // No register requirement at all: straight to memory.
        debug!("{:?} has no register use, spilling outright", cur);
        self.assign_spill_slot(cur);
        return Ok(());
      }
    };

    let mut next_use_pos =
      RegMap::new(self.config, class, OpId::max_value());
    let mut block_pos = RegMap::new(self.config, class, OpId::max_value());
    if next_use_pos.is_empty() {
      return Err(RegAllocError::OutOfRegisters {
        kind,
        pos: cur_from,
      });
    }

    for &id in &self.active {
      let int = self.store.get(id);
      if let Some(reg) = int.location.reg() {
        let next = int
          .next_use_after(cur_from, UseKind::MustHaveRegister)
          .unwrap_or_else(OpId::max_value);
        next_use_pos.shrink(reg, next);
      }
    }
    for &id in &self.inactive {
      let int = self.store.get(id);
      if let Some(reg) = int.location.reg() {
        if let Some(x) = int.first_intersection(self.store.get(cur)) {
          let next = int
            .next_use_after(x, UseKind::MustHaveRegister)
            .unwrap_or_else(OpId::max_value);
          next_use_pos.shrink(reg, next);
        }
      }
    }
    for (reg, _) in next_use_pos.iter().collect::<SmallVec<[_; 8]>>() {
      if let Some(fixed) = self.store.fixed_interval_for(reg) {
        if let Some(x) =
          self.store.get(cur).first_intersection_with_fixed(fixed)
        {
          block_pos.shrink(reg, x);
          next_use_pos.shrink(reg, x);
        }
      }
    }

    let (best_reg, best_pos) = self
      .pick_register(&next_use_pos, cur_from, cur_to)
      .expect("register class has no registers");
    debug!(
      "blocked: best {:?} with next use at {:?}, current first use {:?}",
      best_reg, best_pos, first_use
    );

    if best_pos < first_use {
      // All other intervals are used before cur's first register demand:
      // cur itself is the spill victim.
      if first_use == cur_from {
        return Err(RegAllocError::OutOfRegisters {
          kind,
          pos: cur_from,
        });
      }
      debug!("spilling current {:?}", cur);
      self.assign_spill_slot(cur);
      let split_at = self.gap_split_pos(first_use, cur_from);
      if split_at > cur_from && split_at < cur_to {
        let tail = self.store.split(cur, split_at);
        self.insert_unhandled(tail);
      } else {
        // The register demand cannot be isolated from the memory part.
        return Err(RegAllocError::OutOfRegisters {
          kind,
          pos: first_use,
        });
      }
      return Ok(());
    }

    // Evict: take the register, then split every holder around cur's
    // start.
    self.store.get_mut(cur).location = Location::Reg(best_reg);

    let active = self.active.clone();
    for id in active {
      let int = self.store.get(id);
      if int.location.reg() == Some(best_reg) {
        debug!("evicting active {:?}", id);
        self.split_and_spill(id, cur_from)?;
      }
    }
    let inactive = self.inactive.clone();
    for id in inactive {
      let int = self.store.get(id);
      if int.location.reg() == Some(best_reg) {
        if int.first_intersection(self.store.get(cur)).is_some() {
          debug!("evicting inactive {:?}", id);
          // cur_from is inside one of id's holes, so it is a clean split
          // position.
          self.split_and_spill(id, cur_from)?;
        }
      }
    }

    // A fixed range for the chosen register blocks part of cur: split
    // before the collision.
    if let Some(bp) = block_pos.get(best_reg) {
      if bp <= cur_to {
        let split_at = self.gap_split_pos(bp, cur_from);
        if split_at > cur_from && split_at < cur_to {
          debug!("fixed collision at {:?}, splitting {:?}", bp, cur);
          let tail = self.store.split(cur, split_at);
          self.insert_unhandled(tail);
        } else if bp <= first_use {
          return Err(RegAllocError::OutOfRegisters {
            kind,
            pos: cur_from,
          });
        }
      }
    }

    Ok(())
  }

  /// Argmax over the scratchpad with deterministic tie-breaks: prefer the
  /// saved-ness matching whether the interval crosses a call, then the
  /// lowest register number.
  fn pick_register(
    &self, map: &RegMap, cur_from: OpId, cur_to: OpId,
  ) -> Option<(RegNum, OpId)> {
    let crosses = self.store.crosses_call(cur_from, cur_to);
    let mut best: Option<(RegNum, OpId)> = None;
    for (reg, pos) in map.iter() {
      let better = match best {
        None => true,
        Some((best_reg, best_pos)) => {
          if pos != best_pos {
            pos > best_pos
          } else {
            let reg_saved = self.config.is_caller_saved(reg);
            let best_saved = self.config.is_caller_saved(best_reg);
            if reg_saved != best_saved {
              // Call-crossing intervals prefer callee-saved registers;
              // short ones prefer caller-saved.
              reg_saved != crosses
            } else {
              false
            }
          }
        }
      };
      if better {
        best = Some((reg, pos));
      }
    }
    best
  }

  /// Splits inside a block happen in the gap before the instruction; block
  /// boundaries stay put.
  fn gap_split_pos(&self, pos: OpId, min: OpId) -> OpId {
    if !pos.is_even() {
      return pos;
    }
    let numbering = self.store.numbering();
    if pos > numbering.max_op_id() || numbering.is_block_begin(pos) {
      return pos;
    }
    let adjusted = pos.gap_before();
    if adjusted > min {
      adjusted
    } else {
      pos
    }
  }

  fn insert_unhandled(&mut self, id: IntervalId) {
    let from = self.store.get(id).from();
    // The list is reverse-sorted; find the insertion point from the back.
    let store = &*self.store;
    let pos = self
      .unhandled
      .binary_search_by(|&probe| from.cmp(&store.get(probe).from()))
      .unwrap_or_else(|e| e);
    self.unhandled.insert(pos, id);
    trace!("requeued {}", self.store.display(id));
  }

  /// Splits `id` between its last use before `split_pos` and `split_pos`,
  /// spills the tail, and re-queues the part after the tail's next
  /// register demand.
  fn split_and_spill(
    &mut self, id: IntervalId, split_pos: OpId,
  ) -> Result<(), RegAllocError> {
    let int_from = self.store.get(id).from();
    let kind = self.store.get(id).kind;
    debug_assert!(int_from <= split_pos);

    let last_use = self
      .store
      .get(id)
      .use_positions()
      .iter()
      .rev()
      .find(|u| u.pos < split_pos)
      .map(|u| u.pos);

    let spilled = match last_use {
      Some(last) if int_from < split_pos => {
        // Split somewhere in (last use, split_pos]; the gap before the
        // blocking position keeps the move out of the instruction.
        let min_pos = last.plus(1).max(int_from.plus(1));
        let mut at = self.gap_split_pos(split_pos, min_pos.minus(1));
        if at < min_pos {
          at = min_pos;
        }
        debug_assert!(at < self.store.get(id).to());
        let child = self.store.split(id, at);
        self.assign_spill_slot(child);
        child
      }
      _ => {
        // No use before the split position: the whole interval goes to
        // memory.
        self.assign_spill_slot(id);
        id
      }
    };

    // The spilled part must regain a register before its next demand; the
    // spilled middle silently expires on the stack.
    if let Some(next) = self
      .store
      .get(spilled)
      .next_use_after(self.store.get(spilled).from(), UseKind::MustHaveRegister)
    {
      let spilled_from = self.store.get(spilled).from();
      if next <= spilled_from {
        return Err(RegAllocError::OutOfRegisters {
          kind,
          pos: next,
        });
      }
      let at = self.gap_split_pos(next, spilled_from);
      if at > spilled_from && at < self.store.get(spilled).to() {
        let tail = self.store.split(spilled, at);
        self.insert_unhandled(tail);
      } else {
        // A register demand is stuck inside the memory part.
        return Err(RegAllocError::OutOfRegisters {
          kind,
          pos: next,
        });
      }
    }
    Ok(())
  }

  /// Demote an interval to memory: rematerializable families get the
  /// illegal marker, others the family's canonical slot (allocating one on
  /// first demand, possibly from the per-compilation cache).
  fn assign_spill_slot(&mut self, id: IntervalId) {
    if self.store.can_materialize(id) {
      self.store.get_mut(id).location = Location::Illegal;
      self.store.set_spill_state(id, SpillState::NoOptimization);
      debug!("{:?} demoted to rematerialization", id);
      return;
    }

    let slot = match self.store.spill_slot(id) {
      Some(slot) => slot,
      None => {
        let (var, kind) = {
          let int = self.store.get(id);
          (int.var, int.kind)
        };
        let slot = if self.opts.cache_stack_slots {
          match self.cached_slots.get(var, kind) {
            Some(slot) => {
              self.stats.global_stack_slots += 1;
              slot
            }
            None => {
              let slot = self.frame.allocate_spill_slot(kind);
              self.cached_slots.set(var, slot, kind);
              self.stats.allocated_stack_slots += 1;
              slot
            }
          }
        } else {
          self.stats.allocated_stack_slots += 1;
          self.frame.allocate_spill_slot(kind)
        };
        self.store.set_spill_slot(id, slot);
        slot
      }
    };
    self.store.get_mut(id).location = Location::Stack(slot);
    debug!("{:?} demoted to {:?}", id, slot);
    self.change_spill_state(id);
  }

  /// Conservative spill-state machine; see the eliminator.
  fn change_spill_state(&mut self, id: IntervalId) {
    let def = self.store.spill_definition_pos(id);
    let starts_at_def =
      def.map_or(false, |d| self.store.get(id).from() <= d);
    let state = self.store.spill_state(id);
    let next = match state {
      SpillState::NoDefinitionFound => state,
      SpillState::OneDefinitionFound => {
        if starts_at_def {
          // The defining part itself lives in memory; the definition
          // writes straight to the slot.
          SpillState::StartInMemory
        } else {
          SpillState::OneMoveInserted
        }
      }
      SpillState::OneMoveInserted => {
        let def_at_block_end = def.map_or(true, |d| {
          self.store.numbering().is_block_end(d)
        });
        if self.opts.eliminate_spill_moves && !def_at_block_end {
          SpillState::StoreAtDefinition
        } else {
          state
        }
      }
      SpillState::StoreAtDefinition
      | SpillState::StartInMemory
      | SpillState::NoOptimization => state,
    };
    if next != state {
      trace!("spill state of {:?}: {:?} -> {:?}", id, state, next);
      self.store.set_spill_state(id, next);
    }
  }
}

//=============================================================================
// Tests

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::{
    BlockId, Numbering, Operand, ValueKind, VarId,
  };

  fn store_with_vars(n: usize) -> IntervalStore {
    let numbering = Numbering::for_test(
      vec![BlockId::new(0)],
      vec![BlockId::new(0); 16],
      vec![OpId::new(0)],
      vec![OpId::new(30)],
    );
    IntervalStore::new(numbering, n, 2)
  }

  #[test]
  fn near_sorted_cleanup() {
    let mut store = store_with_vars(3);
    for (var, from, to) in [(0u32, 4u32, 10u32), (1, 0, 6), (2, 8, 12)] {
      let id = store.get_or_create_interval(
        Operand::Var(VarId::new(var)),
        ValueKind::Int,
      );
      store.get_mut(id).add_range(OpId::new(from), OpId::new(to));
    }
    let sorted = sort_intervals_before_allocation(&store);
    let froms: Vec<u32> =
      sorted.iter().map(|&id| store.get(id).from().get()).collect();
    assert_eq!(froms, vec![0, 4, 8]);
  }

  #[test]
  fn derived_tail_merge() {
    let mut store = store_with_vars(2);
    for (var, from, to) in [(0u32, 0u32, 20u32), (1, 2, 6)] {
      let id = store.get_or_create_interval(
        Operand::Var(VarId::new(var)),
        ValueKind::Int,
      );
      store.get_mut(id).add_range(OpId::new(from), OpId::new(to));
    }
    let mut sorted = sort_intervals_before_allocation(&store);
    let root = IntervalId::new(0);
    store.split(root, OpId::new(10));
    sort_intervals_after_allocation(&store, &mut sorted);
    let froms: Vec<u32> =
      sorted.iter().map(|&id| store.get(id).from().get()).collect();
    assert_eq!(froms, vec![0, 2, 10]);
  }
}
