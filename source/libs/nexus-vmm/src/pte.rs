// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 page-table entry codec
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PteFlags, PageTableEntry, EntryKind, encode/decode/is_leaf/is_branch/is_empty
//! INVARIANTS: Only this module reads or writes raw PTE bits; reserved bits 54..63 encode as zero
//!
//! Layout: `V R W X U G A D | RSW0 RSW1 | PPN[43:0] | reserved`. RSW0 carries the
//! non-owning marker maintained by the mapper, RSW1 is left to callers.

use core::fmt;

use bitflags::bitflags;

use crate::addr::{Level, PhysAddr, Ppn, PPN_BITS};

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = ((1u64 << PPN_BITS) - 1) << PPN_SHIFT;
const FLAGS_MASK: u64 = (1 << PPN_SHIFT) - 1;
const RESERVED_MASK: u64 = !(PPN_MASK | FLAGS_MASK);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in the low ten bits of an Sv39 PTE.
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Mapped frame belongs to someone else (device memory, shared buffers); never freed here.
        const NON_OWNING = 1 << 8;
        /// Opaque to the core; callers may use it for copy-on-write or similar bookkeeping.
        const SOFTWARE = 1 << 9;
    }
}

impl PteFlags {
    /// Bits that make an entry a leaf.
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
    /// Bits a caller may request through `map`/`remap`.
    pub const PERMISSIONS: Self = Self::RWX
        .union(Self::USER)
        .union(Self::GLOBAL)
        .union(Self::ACCESSED)
        .union(Self::DIRTY)
        .union(Self::SOFTWARE);

    /// Returns true for permission sets the hardware accepts on a leaf: at least one of R/W/X,
    /// and never W without R.
    pub fn is_valid_leaf_permission(self) -> bool {
        let rwx = self & Self::RWX;
        !rwx.is_empty() && !(rwx.contains(Self::WRITE) && !rwx.contains(Self::READ))
    }
}

/// Packs a page number and flags into a raw PTE.
#[inline]
pub fn encode(ppn: Ppn, flags: PteFlags) -> u64 {
    debug_assert!(ppn.raw() <= Ppn::MAX.raw(), "ppn {} exceeds {} bits", ppn, PPN_BITS);
    debug_assert_eq!(flags.bits() & !FLAGS_MASK, 0);
    (ppn.raw() << PPN_SHIFT) | flags.bits()
}

/// Splits a raw PTE into its page number and flags. Reserved bits are discarded.
#[inline]
pub fn decode(raw: u64) -> (Ppn, PteFlags) {
    let ppn = Ppn::new_truncate((raw & PPN_MASK) >> PPN_SHIFT);
    (ppn, PteFlags::from_bits_truncate(raw & FLAGS_MASK))
}

#[inline]
pub fn is_empty(raw: u64) -> bool {
    raw & PteFlags::VALID.bits() == 0
}

/// Present with at least one of R/W/X. Level-0 entries are leaves regardless; see
/// [`PageTableEntry::kind`].
#[inline]
pub fn is_leaf(raw: u64) -> bool {
    !is_empty(raw) && raw & PteFlags::RWX.bits() != 0
}

/// Present without R/W/X: the PPN names the next-level node.
#[inline]
pub fn is_branch(raw: u64) -> bool {
    !is_empty(raw) && raw & PteFlags::RWX.bits() == 0
}

/// Interpretation of an entry at a particular level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Empty,
    /// Points at the node one level down.
    Branch(Ppn),
    /// Terminates translation at this level.
    Leaf(Ppn, PteFlags),
}

/// One 64-bit slot of a page-table node.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn new(ppn: Ppn, flags: PteFlags) -> Self {
        Self(encode(ppn, flags))
    }

    /// Entry pointing at a next-level node: present, no permissions, not user-accessible.
    #[inline]
    pub fn branch(next: Ppn) -> Self {
        Self::new(next, PteFlags::VALID)
    }

    /// Present leaf mapping `frame` with `perms`.
    #[inline]
    pub fn leaf(frame: PhysAddr, perms: PteFlags) -> Self {
        Self::new(frame.ppn(), perms | PteFlags::VALID)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn ppn(self) -> Ppn {
        decode(self.0).0
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        decode(self.0).1
    }

    /// Same page number, new flags.
    #[inline]
    pub fn with_flags(self, flags: PteFlags) -> Self {
        Self::new(self.ppn(), flags)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        !is_empty(self.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        is_empty(self.0)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        is_leaf(self.0)
    }

    #[inline]
    pub fn is_branch(self) -> bool {
        is_branch(self.0)
    }

    /// True when any bit outside the flag and PPN fields is set.
    #[inline]
    pub fn has_reserved_bits(self) -> bool {
        self.0 & RESERVED_MASK != 0
    }

    /// Classifies the entry as it would be read at `level`.
    pub fn kind(self, level: Level) -> EntryKind {
        if self.is_empty() {
            return EntryKind::Empty;
        }
        let (ppn, flags) = decode(self.0);
        if level.is_leaf_level() || flags.intersects(PteFlags::RWX) {
            EntryKind::Leaf(ppn, flags)
        } else {
            EntryKind::Branch(ppn)
        }
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ppn, flags) = decode(self.0);
        f.debug_struct("PageTableEntry").field("ppn", &ppn).field("flags", &flags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ppn(raw: u64) -> Ppn {
        Ppn::new(raw).unwrap()
    }

    #[test]
    fn layout_matches_privileged_architecture() {
        let raw = encode(ppn(0x80201), PteFlags::VALID | PteFlags::READ | PteFlags::DIRTY);
        assert_eq!(raw, (0x80201 << 10) | 0b1000_0011);
        assert_eq!(PteFlags::NON_OWNING.bits(), 1 << 8);
        assert_eq!(PteFlags::SOFTWARE.bits(), 1 << 9);
    }

    #[test]
    fn decode_ignores_reserved_bits() {
        let raw = encode(ppn(0x1234), PteFlags::VALID) | (1 << 63) | (1 << 54);
        assert_eq!(decode(raw), (ppn(0x1234), PteFlags::VALID));
        assert!(PageTableEntry::from_raw(raw).has_reserved_bits());
        assert!(!PageTableEntry::branch(ppn(0x1234)).has_reserved_bits());
    }

    #[test]
    fn classification_predicates() {
        let empty = encode(ppn(0x1234), PteFlags::READ);
        assert!(is_empty(empty));
        assert!(!is_leaf(empty));
        assert!(!is_branch(empty));

        let branch = encode(ppn(0x1234), PteFlags::VALID | PteFlags::ACCESSED);
        assert!(is_branch(branch));
        assert!(!is_leaf(branch));

        let leaf = encode(ppn(0x1234), PteFlags::VALID | PteFlags::EXECUTE);
        assert!(is_leaf(leaf));
        assert!(!is_branch(leaf));
    }

    #[test]
    fn kind_depends_on_level() {
        let pointer = PageTableEntry::branch(ppn(7));
        assert_eq!(pointer.kind(Level::L2), EntryKind::Branch(ppn(7)));
        assert_eq!(pointer.kind(Level::L0), EntryKind::Leaf(ppn(7), PteFlags::VALID));
        assert_eq!(PageTableEntry::EMPTY.kind(Level::L1), EntryKind::Empty);

        let leaf = PageTableEntry::leaf(ppn(9).base(), PteFlags::READ);
        assert_eq!(leaf.kind(Level::L1), EntryKind::Leaf(ppn(9), PteFlags::VALID | PteFlags::READ));
    }

    #[test]
    fn leaf_permission_rules() {
        assert!(PteFlags::READ.is_valid_leaf_permission());
        assert!((PteFlags::READ | PteFlags::WRITE).is_valid_leaf_permission());
        assert!(PteFlags::EXECUTE.is_valid_leaf_permission());
        assert!(!PteFlags::WRITE.is_valid_leaf_permission());
        assert!(!(PteFlags::WRITE | PteFlags::EXECUTE).is_valid_leaf_permission());
        assert!(!(PteFlags::USER | PteFlags::GLOBAL).is_valid_leaf_permission());
    }

    #[test]
    fn with_flags_keeps_ppn() {
        let entry = PageTableEntry::leaf(ppn(0x42).base(), PteFlags::READ | PteFlags::WRITE);
        let updated = entry.with_flags(PteFlags::VALID | PteFlags::READ);
        assert_eq!(updated.ppn(), ppn(0x42));
        assert!(!updated.flags().contains(PteFlags::WRITE));
    }
}

#[cfg(test)]
mod tests_prop;
