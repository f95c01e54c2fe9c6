// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address newtypes for Sv39 (virtual, physical, page numbers, table levels)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, Ppn, Level, is_canonical_sv39
//! INVARIANTS: VirtAddr is canonical by construction; PhysAddr fits 56 bits; Ppn fits 44 bits

use core::fmt;

use static_assertions::const_assert_eq;
use thiserror::Error;

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Number of entries per Sv39 page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;
/// Width of a physical page number.
pub const PPN_BITS: u32 = 44;

const VA_BITS: u32 = 39;
const PA_BITS: u32 = PPN_BITS + PAGE_SHIFT;
const VPN_BITS: u32 = 9;
const VPN_MASK: u64 = (1 << VPN_BITS) - 1;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const_assert_eq!(1u64 << PAGE_SHIFT, PAGE_SIZE);
const_assert_eq!(1usize << VPN_BITS, ENTRIES_PER_TABLE);
const_assert_eq!(PAGE_SHIFT + 3 * VPN_BITS, VA_BITS);

/// Errors raised when constructing typed addresses from raw values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Bits 63:39 are not the sign extension of bit 38.
    #[error("virtual address {0:#x} is not canonical for Sv39")]
    NonCanonical(u64),
    /// Physical address wider than the 56 bits Sv39 can encode.
    #[error("physical address {0:#x} exceeds the Sv39 physical range")]
    OutOfRange(u64),
    /// Address is not aligned to a 4 KiB page boundary.
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
}

/// Returns true if `va` is a canonical Sv39 virtual address.
pub const fn is_canonical_sv39(va: u64) -> bool {
    let sign = (va >> (VA_BITS - 1)) & 1;
    let upper = va >> VA_BITS;
    if sign == 0 {
        upper == 0
    } else {
        upper == u64::MAX >> VA_BITS
    }
}

/// Level of a page-table node; `L2` is the root, `L0` holds 4 KiB leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    L0 = 0,
    L1 = 1,
    L2 = 2,
}

impl Level {
    /// Level of the root node.
    pub const ROOT: Self = Level::L2;

    /// Levels a walk passes through before it reaches the leaf level, root first.
    pub const NON_LEAF: [Self; 2] = [Level::L2, Level::L1];

    /// Position of this level's VPN segment within a virtual address.
    #[inline]
    pub const fn shift(self) -> u32 {
        PAGE_SHIFT + VPN_BITS * self as u32
    }

    /// The level below this one, or `None` at the leaf level.
    #[inline]
    pub const fn next(self) -> Option<Self> {
        match self {
            Level::L2 => Some(Level::L1),
            Level::L1 => Some(Level::L0),
            Level::L0 => None,
        }
    }

    #[inline]
    pub const fn is_leaf_level(self) -> bool {
        matches!(self, Level::L0)
    }

    /// Bytes mapped by a single leaf entry at this level.
    #[inline]
    pub const fn leaf_size(self) -> u64 {
        1 << self.shift()
    }
}

/// A canonical Sv39 virtual address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Returns `None` if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns `None` unless `addr` is canonical and page aligned.
    #[inline]
    pub const fn page_aligned(addr: u64) -> Option<Self> {
        match Self::new(addr) {
            Some(va) if va.is_page_aligned() => Some(va),
            _ => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Index into a node at `level` selected by this address.
    #[inline]
    pub const fn vpn(self, level: Level) -> usize {
        ((self.0 >> level.shift()) & VPN_MASK) as usize
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down to the containing page. Canonical form is preserved since only low bits change.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Advances by `pages` pages, failing on overflow or when the result leaves canonical space.
    pub fn checked_add_pages(self, pages: u64) -> Option<Self> {
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        Self::new(self.0.checked_add(bytes)?)
    }
}

impl TryFrom<u64> for VirtAddr {
    type Error = AddressError;

    fn try_from(addr: u64) -> Result<Self, Self::Error> {
        Self::new(addr).ok_or(AddressError::NonCanonical(addr))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical address within the 56-bit Sv39 physical range.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr >> PA_BITS == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Combines a page number with an offset inside that page.
    #[inline]
    pub const fn from_ppn(ppn: Ppn, offset: u64) -> Self {
        Self((ppn.raw() << PAGE_SHIFT) | (offset & PAGE_OFFSET_MASK))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn ppn(self) -> Ppn {
        Ppn(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub fn checked_add_pages(self, pages: u64) -> Option<Self> {
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        Self::new(self.0.checked_add(bytes)?)
    }
}

impl TryFrom<u64> for PhysAddr {
    type Error = AddressError;

    fn try_from(addr: u64) -> Result<Self, Self::Error> {
        Self::new(addr).ok_or(AddressError::OutOfRange(addr))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical page number: a physical address with the page offset removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Ppn(u64);

impl Ppn {
    /// Largest encodable page number.
    pub const MAX: Self = Self((1 << PPN_BITS) - 1);

    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw <= Self::MAX.0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Keeps only the low [`PPN_BITS`] bits of `raw`.
    #[inline]
    pub const fn new_truncate(raw: u64) -> Self {
        Self(raw & Self::MAX.0)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of this page.
    #[inline]
    pub const fn base(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
