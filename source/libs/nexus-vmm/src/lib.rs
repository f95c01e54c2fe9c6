// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 virtual-address translation core (page-table codec, walker, mapper, teardown)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests per module, integration tests in `tests/`
//! PUBLIC API: AddressSpace, LockedAddressSpace, PageTableEntry, PageTableNode, walk, FrameAllocator, PhysMap
//! DEPENDS_ON: frame allocator and TLB collaborators supplied by the embedding kernel
//! INVARIANTS: One encoding authority for PTEs; every table frame has exactly one owner;
//!             teardown frees each owned frame exactly once
//!
//! The crate owns no memory of its own. Page-table frames come from a
//! [`FrameAllocator`] and are reached through [`PhysMap`]; both are usually
//! implemented by the kernel's physical memory manager ([`DirectMap`] covers
//! the common linear-map case, [`FrameArena`] serves host tests).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

mod addr;
mod arena;
mod destroy;
mod flush;
mod frame;
mod mapper;
mod node;
mod pte;
mod resolve;
mod space;
mod walk;

pub use addr::{
    is_canonical_sv39, AddressError, Level, PhysAddr, Ppn, VirtAddr, ENTRIES_PER_TABLE, PAGE_SHIFT,
    PAGE_SIZE, PPN_BITS,
};
pub use arena::FrameArena;
pub use destroy::TeardownStats;
pub use flush::{Flush, Invalidation, TlbInvalidate};
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use flush::Sfence;
pub use frame::{DirectMap, FrameAllocator, FrameProvider, OutOfMemory, PhysFrame, PhysMap};
pub use mapper::{MapError, Ownership, UnmapError};
pub use node::PageTableNode;
pub use pte::{decode, encode, is_branch, is_empty, is_leaf, EntryKind, PageTableEntry, PteFlags};
pub use resolve::{TranslateError, Translation};
pub use space::{AddressSpace, LockedAddressSpace, SpaceState, VerifyError, SATP_MODE_SV39};
pub use walk::{walk, walk_existing, CreatePolicy, LeafSlot, WalkError};
