// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 address space: root ownership, ASID/SATP, structural verifier, locked wrapper
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, LockedAddressSpace, SpaceState, VerifyError, SATP_MODE_SV39
//! DEPENDS_ON: FrameProvider for every operation touching node memory
//! INVARIANTS: The space owns its root frame and everything reachable from it;
//!             `mapped_pages` equals the number of level-0 leaves installed through the mapper
//!
//! Mapping, translation and teardown live in `mapper`, `resolve` and `destroy`
//! as further `impl AddressSpace` blocks.

use alloc::collections::BTreeSet;

use spin::RwLock;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::addr::{Level, PhysAddr, Ppn, VirtAddr, PPN_BITS};
use crate::destroy::TeardownStats;
use crate::flush::Flush;
use crate::frame::{FrameProvider, OutOfMemory, PhysFrame, PhysMap};
use crate::mapper::{MapError, Ownership, UnmapError};
use crate::pte::{EntryKind, PteFlags};
use crate::resolve::{TranslateError, Translation};

/// SATP.MODE value selecting Sv39.
pub const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SHIFT: u32 = 60;
const SATP_ASID_SHIFT: u32 = 44;

const_assert_eq!(SATP_ASID_SHIFT, PPN_BITS);

/// Lifecycle of an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceState {
    /// Only the root exists or every mapping has been removed again.
    Empty,
    Populated,
    /// Torn down; only observable through [`LockedAddressSpace`].
    Destroyed,
}

/// First structural violation found by [`AddressSpace::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("table {ppn} is referenced by more than one branch")]
    TableAliased { ppn: Ppn },
    #[error("branch at {level:?}[{index}] points back at the root")]
    RootReferenced { level: Level, index: usize },
    #[error("entry at {level:?}[{index}] has reserved bits set")]
    ReservedBits { level: Level, index: usize },
    #[error("level-0 entry {index} is present without R/W/X")]
    BranchAtLeafLevel { index: usize },
    #[error("found {found} leaves, bookkeeping says {expected}")]
    LeafCountMismatch { expected: usize, found: usize },
}

/// One Sv39 translation tree.
///
/// Not `Clone`: the root frame handle is unique. Dropping the value without
/// calling [`AddressSpace::destroy`] leaks every frame of the tree.
pub struct AddressSpace {
    pub(crate) root: PhysFrame,
    pub(crate) asid: u16,
    pub(crate) mapped: usize,
}

impl AddressSpace {
    /// Allocates and zeroes a root node; ASID 0.
    pub fn new<M: FrameProvider + ?Sized>(mem: &mut M) -> Result<Self, OutOfMemory> {
        Self::with_asid(0, mem)
    }

    pub fn with_asid<M: FrameProvider + ?Sized>(asid: u16, mem: &mut M) -> Result<Self, OutOfMemory> {
        let root = mem.alloc_frame()?;
        mem.node_mut(root.ppn()).zero();
        log::info!(target: "as", "create: root={} asid={}", root.ppn(), asid);
        Ok(Self { root, asid, mapped: 0 })
    }

    #[inline]
    pub fn root(&self) -> Ppn {
        self.root.ppn()
    }

    #[inline]
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Value for the `satp` CSR that activates this space.
    pub fn satp(&self) -> u64 {
        (SATP_MODE_SV39 << SATP_MODE_SHIFT)
            | (u64::from(self.asid) << SATP_ASID_SHIFT)
            | self.root.ppn().raw()
    }

    /// Number of 4 KiB leaves currently installed.
    #[inline]
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    pub fn state(&self) -> SpaceState {
        if self.mapped == 0 {
            SpaceState::Empty
        } else {
            SpaceState::Populated
        }
    }

    /// Checks the tree for aliasing, corrupt entries and bookkeeping drift.
    pub fn verify<M: PhysMap + ?Sized>(&self, mem: &M) -> Result<(), VerifyError> {
        let mut tables = BTreeSet::new();
        let mut leaves = 0usize;
        self.verify_table(mem, self.root(), Level::ROOT, &mut tables, &mut leaves)?;
        if leaves != self.mapped {
            return Err(VerifyError::LeafCountMismatch { expected: self.mapped, found: leaves });
        }
        Ok(())
    }

    fn verify_table<M: PhysMap + ?Sized>(
        &self,
        mem: &M,
        table: Ppn,
        level: Level,
        tables: &mut BTreeSet<Ppn>,
        leaves: &mut usize,
    ) -> Result<(), VerifyError> {
        for (index, entry) in mem.node(table).present_entries() {
            if entry.has_reserved_bits() {
                return Err(VerifyError::ReservedBits { level, index });
            }
            match entry.kind(level) {
                EntryKind::Leaf(_, flags) => {
                    if level.is_leaf_level() && !flags.intersects(PteFlags::RWX) {
                        return Err(VerifyError::BranchAtLeafLevel { index });
                    }
                    *leaves += 1;
                }
                EntryKind::Branch(child) => {
                    if child == self.root() {
                        return Err(VerifyError::RootReferenced { level, index });
                    }
                    if !tables.insert(child) {
                        return Err(VerifyError::TableAliased { ppn: child });
                    }
                    if let Some(next) = level.next() {
                        self.verify_table(mem, child, next, tables, leaves)?;
                    }
                }
                EntryKind::Empty => {}
            }
        }
        Ok(())
    }

    /// Runs the verifier after a successful mutation when `debug_pt_verify` is enabled.
    #[inline]
    pub(crate) fn check_after_mutation<M: PhysMap + ?Sized>(&self, mem: &M) {
        #[cfg(feature = "debug_pt_verify")]
        {
            if let Err(err) = self.verify(mem) {
                log::error!(target: "pt", "PT-VERIFY: {} (asid={})", err, self.asid);
            }
        }
        #[cfg(not(feature = "debug_pt_verify"))]
        let _ = mem;
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root())
            .field("asid", &self.asid)
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// An [`AddressSpace`] shared between harts.
///
/// Translations take the read lock and may overlap; mutations and teardown take
/// the write lock. Touching the space after [`LockedAddressSpace::destroy`]
/// panics.
pub struct LockedAddressSpace {
    inner: RwLock<Option<AddressSpace>>,
}

impl LockedAddressSpace {
    pub fn new(space: AddressSpace) -> Self {
        Self { inner: RwLock::new(Some(space)) }
    }

    pub fn create<M: FrameProvider + ?Sized>(asid: u16, mem: &mut M) -> Result<Self, OutOfMemory> {
        AddressSpace::with_asid(asid, mem).map(Self::new)
    }

    pub fn state(&self) -> SpaceState {
        self.inner.read().as_ref().map_or(SpaceState::Destroyed, AddressSpace::state)
    }

    pub fn satp(&self) -> u64 {
        self.with(|space| space.satp())
    }

    pub fn map<M: FrameProvider + ?Sized>(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        perms: PteFlags,
        ownership: Ownership,
        mem: &mut M,
    ) -> Result<Flush, MapError> {
        self.with_mut(|space| space.map(va, pa, perms, ownership, mem))
    }

    pub fn map_range<M: FrameProvider + ?Sized>(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        pages: usize,
        perms: PteFlags,
        ownership: Ownership,
        mem: &mut M,
    ) -> Result<Flush, MapError> {
        self.with_mut(|space| space.map_range(va, pa, pages, perms, ownership, mem))
    }

    pub fn unmap<M: FrameProvider + ?Sized>(
        &self,
        va: VirtAddr,
        mem: &mut M,
    ) -> Result<(PhysAddr, Flush), UnmapError> {
        self.with_mut(|space| space.unmap(va, mem))
    }

    pub fn unmap_range<M: FrameProvider + ?Sized>(
        &self,
        va: VirtAddr,
        pages: usize,
        mem: &mut M,
    ) -> Result<(usize, Flush), UnmapError> {
        self.with_mut(|space| space.unmap_range(va, pages, mem))
    }

    pub fn remap<M: FrameProvider + ?Sized>(
        &self,
        va: VirtAddr,
        perms: PteFlags,
        mem: &mut M,
    ) -> Result<Flush, UnmapError> {
        self.with_mut(|space| space.remap(va, perms, mem))
    }

    pub fn translate<M: PhysMap + ?Sized>(
        &self,
        va: VirtAddr,
        mem: &M,
    ) -> Result<Translation, TranslateError> {
        self.with(|space| space.translate(va, mem))
    }

    pub fn verify<M: PhysMap + ?Sized>(&self, mem: &M) -> Result<(), VerifyError> {
        self.with(|space| space.verify(mem))
    }

    /// Tears the space down. Every later call on `self` panics.
    pub fn destroy<M: FrameProvider + ?Sized>(&self, mem: &mut M) -> TeardownStats {
        let space = self.inner.write().take();
        match space {
            Some(space) => space.destroy(mem),
            None => use_after_destroy(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&AddressSpace) -> R) -> R {
        match self.inner.read().as_ref() {
            Some(space) => f(space),
            None => use_after_destroy(),
        }
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        match self.inner.write().as_mut() {
            Some(space) => f(space),
            None => use_after_destroy(),
        }
    }
}

#[cold]
#[track_caller]
fn use_after_destroy() -> ! {
    panic!("address space used after destroy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FrameArena;
    use crate::pte::PageTableEntry;

    fn arena() -> FrameArena {
        FrameArena::new(PhysAddr::new(0x8000_0000).unwrap(), 32)
    }

    fn va(raw: u64) -> VirtAddr {
        VirtAddr::new(raw).unwrap()
    }

    fn pa(raw: u64) -> PhysAddr {
        PhysAddr::new(raw).unwrap()
    }

    #[test]
    fn new_space_is_empty_with_zeroed_root() {
        let mut mem = arena();
        let space = AddressSpace::new(&mut mem).unwrap();
        assert_eq!(space.state(), SpaceState::Empty);
        assert!(mem.node(space.root()).is_empty());
        assert_eq!(space.verify(&mem), Ok(()));
    }

    #[test]
    fn satp_encodes_mode_asid_and_root() {
        let mut mem = arena();
        let space = AddressSpace::with_asid(7, &mut mem).unwrap();
        let satp = space.satp();
        assert_eq!(satp >> 60, SATP_MODE_SV39);
        assert_eq!((satp >> 44) & 0xffff, 7);
        assert_eq!(satp & Ppn::MAX.raw(), space.root().raw());
    }

    #[test]
    fn creation_fails_cleanly_without_frames() {
        let mut mem = arena();
        mem.fail_after(0);
        assert_eq!(AddressSpace::new(&mut mem).unwrap_err(), OutOfMemory);
        assert_eq!(mem.allocated(), 0);
    }

    #[test]
    fn verify_detects_aliased_table() {
        let mut mem = arena();
        let mut space = AddressSpace::new(&mut mem).unwrap();
        space.map(va(0x1000), pa(0x1000_0000), PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();
        let shared = mem.node(space.root()).entry_at(0);
        mem.node_mut(space.root()).set_entry(1, shared);
        assert_eq!(space.verify(&mem), Err(VerifyError::TableAliased { ppn: shared.ppn() }));
    }

    #[test]
    fn verify_detects_root_cycle_and_reserved_bits() {
        let mut mem = arena();
        let space = AddressSpace::new(&mut mem).unwrap();
        let root = space.root();
        mem.node_mut(root).set_entry(4, PageTableEntry::branch(root));
        assert_eq!(
            space.verify(&mem),
            Err(VerifyError::RootReferenced { level: Level::L2, index: 4 })
        );

        let poisoned = PageTableEntry::from_raw(PageTableEntry::branch(root).raw() | 1 << 60);
        mem.node_mut(root).set_entry(4, poisoned);
        assert_eq!(space.verify(&mem), Err(VerifyError::ReservedBits { level: Level::L2, index: 4 }));
    }

    #[test]
    fn verify_detects_bookkeeping_drift() {
        let mut mem = arena();
        let mut space = AddressSpace::new(&mut mem).unwrap();
        space.map(va(0x2000), pa(0x1000_0000), PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();
        space.mapped = 0;
        assert_eq!(
            space.verify(&mem),
            Err(VerifyError::LeafCountMismatch { expected: 0, found: 1 })
        );
    }

    #[test]
    fn verify_rejects_permissionless_level0_entry() {
        let mut mem = arena();
        let mut space = AddressSpace::new(&mut mem).unwrap();
        space.map(va(0x3000), pa(0x1000_0000), PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();
        let l1 = mem.node(space.root()).entry_at(0).ppn();
        let l0 = mem.node(l1).entry_at(0).ppn();
        let leaf = mem.node(l0).entry_at(3);
        mem.node_mut(l0).set_entry(3, leaf.with_flags(PteFlags::VALID));
        assert_eq!(space.verify(&mem), Err(VerifyError::BranchAtLeafLevel { index: 3 }));
    }

    #[test]
    fn locked_space_reports_destroyed() {
        let mut mem = arena();
        let space = LockedAddressSpace::create(1, &mut mem).unwrap();
        assert_eq!(space.state(), SpaceState::Empty);
        space.map(va(0x4000), pa(0x1000_0000), PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();
        assert_eq!(space.state(), SpaceState::Populated);
        space.destroy(&mut mem);
        assert_eq!(space.state(), SpaceState::Destroyed);
        assert_eq!(mem.allocated(), 0);
    }

    #[test]
    fn readers_overlap_and_writers_exclude() {
        let mut mem = arena();
        let space = LockedAddressSpace::create(3, &mut mem).unwrap();
        space.map(va(0x5000), pa(0x1000_0000), PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();

        let held = space.inner.read();
        std::thread::scope(|s| {
            let reader = s.spawn(|| space.translate(va(0x5010), &mem));
            assert_eq!(reader.join().unwrap().unwrap().phys, pa(0x1000_0010));
        });
        assert!(space.inner.try_write().is_none());
        drop(held);

        let held = space.inner.write();
        assert!(space.inner.try_read().is_none());
        drop(held);
        space.destroy(&mut mem);
    }

    #[test]
    fn separate_spaces_do_not_share_a_lock() {
        let mut mem_a = arena();
        let mut mem_b = arena();
        let a = LockedAddressSpace::create(1, &mut mem_a).unwrap();
        let b = LockedAddressSpace::create(2, &mut mem_b).unwrap();

        let held = a.inner.write();
        std::thread::scope(|s| {
            s.spawn(|| {
                b.map(va(0x6000), pa(0x2000), PteFlags::READ, Ownership::Shared, &mut mem_b)
                    .unwrap()
                    .ignore();
                assert_eq!(b.translate(va(0x6000), &mem_b).unwrap().phys, pa(0x2000));
            })
            .join()
            .unwrap();
        });
        drop(held);

        a.destroy(&mut mem_a);
        b.destroy(&mut mem_b);
        assert_eq!(mem_a.allocated(), 0);
        assert_eq!(mem_b.allocated(), 0);
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn locked_translate_after_destroy_panics() {
        let mut mem = arena();
        let space = LockedAddressSpace::create(1, &mut mem).unwrap();
        space.destroy(&mut mem);
        let _ = space.translate(va(0x4000), &mem);
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn locked_double_destroy_panics() {
        let mut mem = arena();
        let space = LockedAddressSpace::create(1, &mut mem).unwrap();
        space.destroy(&mut mem);
        space.destroy(&mut mem);
    }
}
