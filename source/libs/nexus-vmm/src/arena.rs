// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic heap-backed frame arena for host testing and early bring-up
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameArena
//! INVARIANTS: Frames are handed out lowest-first from a fixed window; freeing a frame
//!             that is not allocated panics (double free); optional allocation budget

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::addr::{PhysAddr, Ppn};
use crate::frame::{FrameAllocator, OutOfMemory, PhysFrame, PhysMap};
use crate::node::PageTableNode;

/// A window of `capacity` frames starting at `base`, each backed by a heap page.
///
/// Implements both collaborator traits, so an [`crate::AddressSpace`] can run
/// entirely on the host. Every free is recorded for later inspection.
pub struct FrameArena {
    base: Ppn,
    slots: Vec<Option<Box<PageTableNode>>>,
    free_list: Vec<usize>,
    budget: Option<usize>,
    freed: Vec<Ppn>,
}

impl FrameArena {
    /// Creates an arena covering `capacity` frames from the page containing `base`.
    pub fn new(base: PhysAddr, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // Reversed so `pop` yields the lowest frame first.
        let free_list = (0..capacity).rev().collect();
        Self { base: base.ppn(), slots, free_list, budget: None, freed: Vec::new() }
    }

    /// Lets the next `allocations` requests succeed, then reports [`OutOfMemory`].
    pub fn fail_after(&mut self, allocations: usize) {
        self.budget = Some(allocations);
    }

    /// Removes any allocation budget.
    pub fn clear_budget(&mut self) {
        self.budget = None;
    }

    /// Number of frames currently handed out.
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_allocated(&self, ppn: Ppn) -> bool {
        self.slot(ppn).map_or(false, |index| self.slots[index].is_some())
    }

    /// Every frame passed to `free_frame`, in order.
    pub fn freed(&self) -> &[Ppn] {
        &self.freed
    }

    fn slot(&self, ppn: Ppn) -> Option<usize> {
        let offset = ppn.raw().checked_sub(self.base.raw())?;
        let index = usize::try_from(offset).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    fn live_slot(&self, ppn: Ppn) -> usize {
        match self.slot(ppn) {
            Some(index) if self.slots[index].is_some() => index,
            _ => panic!("frame {} is not allocated from this arena", ppn),
        }
    }
}

impl FrameAllocator for FrameArena {
    fn alloc_frame(&mut self) -> Result<PhysFrame, OutOfMemory> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return Err(OutOfMemory);
            }
            *budget -= 1;
        }
        let index = self.free_list.pop().ok_or(OutOfMemory)?;
        self.slots[index] = Some(Box::new(PageTableNode::new_empty()));
        let ppn = Ppn::new_truncate(self.base.raw() + index as u64);
        // SAFETY: the slot was on the free list, so no handle or entry refers to it.
        Ok(unsafe { PhysFrame::from_ppn(ppn) })
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        let ppn = frame.ppn();
        let index = self.live_slot(ppn);
        self.slots[index] = None;
        self.free_list.push(index);
        self.freed.push(ppn);
    }
}

impl PhysMap for FrameArena {
    fn node(&self, ppn: Ppn) -> &PageTableNode {
        let index = self.live_slot(ppn);
        match self.slots[index].as_deref() {
            Some(node) => node,
            None => unreachable!(),
        }
    }

    fn node_mut(&mut self, ppn: Ppn) -> &mut PageTableNode {
        let index = self.live_slot(ppn);
        match self.slots[index].as_deref_mut() {
            Some(node) => node,
            None => unreachable!(),
        }
    }
}
