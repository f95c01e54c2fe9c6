// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Collaborator interfaces for physical frames
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysFrame, FrameAllocator, PhysMap, FrameProvider, DirectMap, OutOfMemory
//! DEPENDS_ON: the kernel's physical memory manager
//! INVARIANTS: A PhysFrame is never duplicated; handing one to `free_frame` ends its life
//!
//! The translation core never dereferences a page number on its own. Every
//! access to node memory goes through [`PhysMap`], so a kernel with a linear
//! map, a hypervisor with a remapping window and a host test arena all plug in
//! the same way.

use thiserror::Error;

use crate::addr::{PhysAddr, Ppn};
use crate::node::PageTableNode;

/// Returned by a [`FrameAllocator`] that has no frame left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("physical frame allocator exhausted")]
pub struct OutOfMemory;

/// Exclusive handle to one 4 KiB physical frame.
///
/// Deliberately neither `Copy` nor `Clone`: moving the handle moves ownership.
/// Once a frame is installed in a page-table entry the entry owns it and the
/// handle is consumed; it is only reconstituted when that entry is cleared.
#[derive(Debug, PartialEq, Eq)]
pub struct PhysFrame {
    ppn: Ppn,
}

impl PhysFrame {
    /// Wraps `ppn` as an owned frame.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other `PhysFrame`, page-table entry or
    /// allocator free list currently owns this frame.
    #[inline]
    pub unsafe fn from_ppn(ppn: Ppn) -> Self {
        Self { ppn }
    }

    #[inline]
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }

    #[inline]
    pub fn start(&self) -> PhysAddr {
        self.ppn.base()
    }

    /// Gives up the handle; ownership is now tracked by whatever records the page number.
    #[inline]
    pub(crate) fn into_ppn(self) -> Ppn {
        self.ppn
    }
}

/// Source and sink of physical frames.
pub trait FrameAllocator {
    fn alloc_frame(&mut self) -> Result<PhysFrame, OutOfMemory>;

    fn free_frame(&mut self, frame: PhysFrame);
}

/// Turns a page number into addressable page-table memory.
///
/// Implementations may panic if `ppn` does not name memory they can reach;
/// the walker only asks for frames it installed itself.
pub trait PhysMap {
    fn node(&self, ppn: Ppn) -> &PageTableNode;

    fn node_mut(&mut self, ppn: Ppn) -> &mut PageTableNode;
}

/// Everything a mutating walk needs.
pub trait FrameProvider: FrameAllocator + PhysMap {}

impl<T: FrameAllocator + PhysMap + ?Sized> FrameProvider for T {}

/// [`PhysMap`] for kernels that map all of physical memory at a fixed virtual offset.
pub struct DirectMap<A> {
    alloc: A,
    offset: u64,
}

impl<A> DirectMap<A> {
    /// # Safety
    ///
    /// Every frame handed out by `alloc` must be readable and writable at
    /// `offset + frame address` for as long as this value exists.
    pub unsafe fn new(alloc: A, offset: u64) -> Self {
        Self { alloc, offset }
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn into_inner(self) -> A {
        self.alloc
    }

    #[inline]
    fn node_ptr(&self, ppn: Ppn) -> *mut PageTableNode {
        self.offset.wrapping_add(ppn.base().raw()) as usize as *mut PageTableNode
    }
}

impl<A: FrameAllocator> FrameAllocator for DirectMap<A> {
    fn alloc_frame(&mut self) -> Result<PhysFrame, OutOfMemory> {
        self.alloc.alloc_frame()
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        self.alloc.free_frame(frame)
    }
}

impl<A> PhysMap for DirectMap<A> {
    fn node(&self, ppn: Ppn) -> &PageTableNode {
        // SAFETY: `new` requires every allocated frame to be mapped at `offset`; the pointer is
        // page aligned because `ppn.base()` is, and the borrow is tied to `self`.
        unsafe { &*self.node_ptr(ppn) }
    }

    fn node_mut(&mut self, ppn: Ppn) -> &mut PageTableNode {
        // SAFETY: as above; `&mut self` keeps other accesses through this map out.
        unsafe { &mut *self.node_ptr(ppn) }
    }
}
