// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One radix level of the Sv39 tree: a page-sized array of 512 entries.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::addr::{ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::pte::PageTableEntry;

/// Page-table node. Occupies exactly one 4 KiB frame.
#[repr(C, align(4096))]
pub struct PageTableNode {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const_assert_eq!(size_of::<PageTableNode>() as u64, PAGE_SIZE);
const_assert_eq!(size_of::<PageTableEntry>(), size_of::<u64>());

impl PageTableNode {
    /// A node with every entry empty.
    pub const fn new_empty() -> Self {
        Self { entries: [PageTableEntry::EMPTY; ENTRIES_PER_TABLE] }
    }

    /// Returns the entry at `index`. Panics if `index >= 512`.
    #[inline]
    pub fn entry_at(&self, index: usize) -> PageTableEntry {
        assert!(index < ENTRIES_PER_TABLE, "page-table index {} out of range", index);
        self.entries[index]
    }

    /// Overwrites the entry at `index`. Panics if `index >= 512`.
    #[inline]
    pub fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        assert!(index < ENTRIES_PER_TABLE, "page-table index {} out of range", index);
        self.entries[index] = entry;
    }

    /// Clears every entry in place. Used when a freshly allocated frame becomes a node.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::EMPTY);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_empty())
    }

    /// Iterates `(index, entry)` over present entries only.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate().filter(|(_, entry)| entry.is_present())
    }
}

impl Default for PageTableNode {
    fn default() -> Self {
        Self::new_empty()
    }
}
