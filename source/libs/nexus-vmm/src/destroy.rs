// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Post-order teardown of an address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::destroy, TeardownStats
//! INVARIANTS: Each entry is cleared before the frame it names is freed, so no frame reaches
//!             `free_frame` twice; non-owning leaves are cleared but never freed

use crate::addr::{Level, Ppn, ENTRIES_PER_TABLE};
use crate::frame::{FrameProvider, PhysFrame};
use crate::pte::{EntryKind, PageTableEntry, PteFlags};
use crate::space::AddressSpace;

/// What a teardown returned to the allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownStats {
    /// Page-table nodes, root included.
    pub tables_freed: usize,
    /// Owned leaf frames.
    pub frames_freed: usize,
    /// Non-owning leaves and superpages left to their owners.
    pub shared_skipped: usize,
}

impl AddressSpace {
    /// Frees every node of the tree and every owned leaf frame, then the root.
    ///
    /// Consumes the space; the caller must have switched every hart away from it.
    pub fn destroy<M: FrameProvider + ?Sized>(self, mem: &mut M) -> TeardownStats {
        let AddressSpace { root, asid, mapped } = self;
        let mut stats = TeardownStats::default();
        free_subtree(mem, root.ppn(), Level::ROOT, &mut stats);
        mem.free_frame(root);
        stats.tables_freed += 1;
        log::info!(
            target: "as",
            "destroy: asid={} mapped={} tables={} frames={} shared={}",
            asid,
            mapped,
            stats.tables_freed,
            stats.frames_freed,
            stats.shared_skipped
        );
        stats
    }
}

fn free_subtree<M: FrameProvider + ?Sized>(mem: &mut M, table: Ppn, level: Level, stats: &mut TeardownStats) {
    for index in 0..ENTRIES_PER_TABLE {
        let entry = mem.node(table).entry_at(index);
        match entry.kind(level) {
            EntryKind::Empty => continue,
            EntryKind::Branch(child) => {
                if let Some(next) = level.next() {
                    free_subtree(mem, child, next, stats);
                }
                mem.node_mut(table).set_entry(index, PageTableEntry::EMPTY);
                // SAFETY: the branch entry was the node's only owner and has just been cleared.
                mem.free_frame(unsafe { PhysFrame::from_ppn(child) });
                stats.tables_freed += 1;
            }
            EntryKind::Leaf(ppn, flags) => {
                mem.node_mut(table).set_entry(index, PageTableEntry::EMPTY);
                // Superpages are never installed here, so their frames are not ours to free.
                if flags.contains(PteFlags::NON_OWNING) || !level.is_leaf_level() {
                    stats.shared_skipped += 1;
                } else {
                    // SAFETY: an owning leaf is the frame's only owner and has just been cleared.
                    mem.free_frame(unsafe { PhysFrame::from_ppn(ppn) });
                    stats.frames_freed += 1;
                }
            }
        }
    }
}
