// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Three-level Sv39 walker with lazy allocation of intermediate tables
//! OWNERS: @kernel-mm-team
//! PUBLIC API: walk, walk_existing, CreatePolicy, LeafSlot, WalkError
//! DEPENDS_ON: FrameProvider (allocation + node access)
//! INVARIANTS: Never writes a leaf; never overwrites a superpage; every table it creates is
//!             linked into the tree before the next step, so a failure leaves no orphan

use thiserror::Error;

use crate::addr::{Level, Ppn, VirtAddr};
use crate::frame::{FrameProvider, OutOfMemory, PhysMap};
use crate::pte::{EntryKind, PageTableEntry};

/// Whether a walk may allocate missing intermediate tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreatePolicy {
    Create,
    NoCreate,
}

/// Errors produced while descending the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum WalkError {
    /// An intermediate entry is empty and the walk may not create it.
    #[error("no table along the walk path")]
    NotMapped,
    /// A leaf sits at a non-terminal level.
    #[error("superpage at {level:?} blocks the walk")]
    BlockedBySuperpage { level: Level },
    /// The frame allocator could not supply an intermediate table.
    #[error("out of frames for an intermediate table")]
    OutOfMemory,
}

impl From<OutOfMemory> for WalkError {
    fn from(_: OutOfMemory) -> Self {
        WalkError::OutOfMemory
    }
}

/// Location of a level-0 entry: the leaf table and the index inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafSlot {
    table: Ppn,
    index: usize,
}

impl LeafSlot {
    pub fn table(&self) -> Ppn {
        self.table
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn read<M: PhysMap + ?Sized>(&self, mem: &M) -> PageTableEntry {
        mem.node(self.table).entry_at(self.index)
    }

    pub(crate) fn write<M: PhysMap + ?Sized>(&self, mem: &mut M, entry: PageTableEntry) {
        mem.node_mut(self.table).set_entry(self.index, entry);
    }
}

/// Descends from `root` to the level-0 slot for `va`.
///
/// With [`CreatePolicy::Create`], empty intermediate entries get a freshly
/// zeroed table from the allocator. With [`CreatePolicy::NoCreate`] the walk is
/// read-only and behaves like [`walk_existing`].
pub fn walk<M: FrameProvider + ?Sized>(
    root: Ppn,
    va: VirtAddr,
    policy: CreatePolicy,
    mem: &mut M,
) -> Result<LeafSlot, WalkError> {
    if policy == CreatePolicy::NoCreate {
        return walk_existing(root, va, &*mem);
    }
    let mut table = root;
    for level in Level::NON_LEAF {
        let index = va.vpn(level);
        table = match mem.node(table).entry_at(index).kind(level) {
            EntryKind::Branch(next) => next,
            EntryKind::Leaf(..) => return Err(WalkError::BlockedBySuperpage { level }),
            EntryKind::Empty => install_table(mem, table, index, level)?,
        };
    }
    Ok(LeafSlot { table, index: va.vpn(Level::L0) })
}

/// Read-only descent; needs shared access only.
pub fn walk_existing<M: PhysMap + ?Sized>(
    root: Ppn,
    va: VirtAddr,
    mem: &M,
) -> Result<LeafSlot, WalkError> {
    let mut table = root;
    for level in Level::NON_LEAF {
        table = match mem.node(table).entry_at(va.vpn(level)).kind(level) {
            EntryKind::Branch(next) => next,
            EntryKind::Leaf(..) => return Err(WalkError::BlockedBySuperpage { level }),
            EntryKind::Empty => return Err(WalkError::NotMapped),
        };
    }
    Ok(LeafSlot { table, index: va.vpn(Level::L0) })
}

fn install_table<M: FrameProvider + ?Sized>(
    mem: &mut M,
    parent: Ppn,
    index: usize,
    level: Level,
) -> Result<Ppn, WalkError> {
    let child = mem.alloc_frame()?.into_ppn();
    mem.node_mut(child).zero();
    mem.node_mut(parent).set_entry(index, PageTableEntry::branch(child));
    log::trace!(target: "pt", "walk: table {} linked at {:?}[{}]", child, level, index);
    Ok(child)
}
