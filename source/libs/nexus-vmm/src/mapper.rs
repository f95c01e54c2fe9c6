// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Leaf installation, removal and permission updates
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::{map, map_frame, map_range, unmap, unmap_range, remap}, MapError, UnmapError, Ownership
//! DEPENDS_ON: walk (Create for map, read-only for unmap/remap)
//! INVARIANTS: Existing leaves are never overwritten; a frame is freed only by the entry that owns it;
//!             failed operations leave every installed leaf untouched

use thiserror::Error;

use crate::addr::{AddressError, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::flush::{Flush, Invalidation};
use crate::frame::{FrameProvider, PhysFrame, PhysMap};
use crate::pte::{PageTableEntry, PteFlags};
use crate::space::AddressSpace;
use crate::walk::{walk, walk_existing, CreatePolicy, LeafSlot, WalkError};

/// Who frees the mapped frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ownership {
    /// The mapping owns the frame; unmap and destroy return it to the allocator.
    #[default]
    Owned,
    /// Device memory or a frame owned elsewhere; never freed by this space.
    Shared,
}

/// Error returned when installing mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("invalid address: {0}")]
    InvalidAddress(AddressError),
    /// Target page already has a present leaf; the existing mapping is unchanged.
    #[error("page already mapped")]
    AlreadyMapped,
    #[error("a superpage covers the target")]
    BlockedBySuperpage,
    #[error("out of frames for page-table nodes")]
    OutOfMemory,
    /// Permission set the hardware would reject (no R/W/X, or W without R).
    #[error("invalid leaf permissions")]
    InvalidFlags,
}

impl From<AddressError> for MapError {
    fn from(err: AddressError) -> Self {
        MapError::InvalidAddress(err)
    }
}

impl From<WalkError> for MapError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::BlockedBySuperpage { .. } => MapError::BlockedBySuperpage,
            // A creating walk only stops short when the allocator is empty.
            WalkError::OutOfMemory | WalkError::NotMapped => MapError::OutOfMemory,
        }
    }
}

/// Error returned when removing or changing mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UnmapError {
    #[error("invalid address: {0}")]
    InvalidAddress(AddressError),
    #[error("page not mapped")]
    NotMapped,
    #[error("a superpage covers the target")]
    BlockedBySuperpage,
    #[error("invalid leaf permissions")]
    InvalidFlags,
}

impl From<AddressError> for UnmapError {
    fn from(err: AddressError) -> Self {
        UnmapError::InvalidAddress(err)
    }
}

impl From<WalkError> for UnmapError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::BlockedBySuperpage { .. } => UnmapError::BlockedBySuperpage,
            WalkError::NotMapped | WalkError::OutOfMemory => UnmapError::NotMapped,
        }
    }
}

fn check_va(va: VirtAddr) -> Result<(), AddressError> {
    if va.is_page_aligned() {
        Ok(())
    } else {
        log::warn!(target: "pt", "rejecting misaligned va {}", va);
        Err(AddressError::Misaligned(va.raw()))
    }
}

fn check_pa(pa: PhysAddr) -> Result<(), AddressError> {
    if pa.is_page_aligned() {
        Ok(())
    } else {
        log::warn!(target: "pt", "rejecting misaligned pa {}", pa);
        Err(AddressError::Misaligned(pa.raw()))
    }
}

/// Bits `remap` replaces. Validity, ownership, accessed/dirty and the software bit stay
/// with the entry.
const REMAP_BITS: PteFlags = PteFlags::RWX.union(PteFlags::USER).union(PteFlags::GLOBAL);

fn leaf_permissions(perms: PteFlags) -> Option<PteFlags> {
    let perms = perms & PteFlags::PERMISSIONS;
    perms.is_valid_leaf_permission().then_some(perms)
}

/// The last page of the run must still be canonical.
fn check_range(va: VirtAddr, pages: usize) -> Result<(), AddressError> {
    let span = (pages.saturating_sub(1) as u64).saturating_mul(PAGE_SIZE);
    match va.checked_add_pages(pages.saturating_sub(1) as u64) {
        Some(_) => Ok(()),
        None => Err(AddressError::NonCanonical(va.raw().saturating_add(span))),
    }
}

impl AddressSpace {
    /// Installs a 4 KiB leaf mapping `va` to `pa`.
    ///
    /// Only bits of [`PteFlags::PERMISSIONS`] are taken from `perms`. Missing
    /// intermediate tables are allocated; they stay linked even if a later
    /// allocation fails.
    pub fn map<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perms: PteFlags,
        ownership: Ownership,
        mem: &mut M,
    ) -> Result<Flush, MapError> {
        check_va(va)?;
        check_pa(pa)?;
        let perms = leaf_permissions(perms).ok_or(MapError::InvalidFlags)?;
        self.install_leaf(va, pa, perms, ownership, mem)?;
        self.check_after_mutation(&*mem);
        Ok(Flush::new(Invalidation::Page(va), Some(self.asid)))
    }

    /// Maps an owned frame. On failure the frame is handed back untouched.
    pub fn map_frame<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        frame: PhysFrame,
        perms: PteFlags,
        mem: &mut M,
    ) -> Result<Flush, (MapError, PhysFrame)> {
        match self.map(va, frame.start(), perms, Ownership::Owned, mem) {
            Ok(flush) => {
                // The leaf entry owns the frame from here on.
                let _ = frame.into_ppn();
                Ok(flush)
            }
            Err(err) => Err((err, frame)),
        }
    }

    /// Maps `pages` consecutive pages. All or nothing: the whole range is checked first and
    /// a mid-range allocation failure removes the leaves already installed (without freeing
    /// their frames, which still belong to the caller).
    pub fn map_range<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        pages: usize,
        perms: PteFlags,
        ownership: Ownership,
        mem: &mut M,
    ) -> Result<Flush, MapError> {
        check_va(va)?;
        check_pa(pa)?;
        let perms = leaf_permissions(perms).ok_or(MapError::InvalidFlags)?;
        check_range(va, pages)?;
        pa.checked_add_pages(pages.saturating_sub(1) as u64)
            .ok_or(MapError::InvalidAddress(AddressError::OutOfRange(pa.raw())))?;

        for page_va in pages_from(va, pages) {
            match walk_existing(self.root(), page_va, &*mem) {
                Ok(slot) if slot.read(&*mem).is_present() => return Err(MapError::AlreadyMapped),
                Err(err @ WalkError::BlockedBySuperpage { .. }) => {
                    log::warn!(target: "pt", "map_range: {} blocked by superpage", page_va);
                    return Err(err.into());
                }
                _ => {}
            }
        }

        let frames = (0..pages as u64).map_while(|page| pa.checked_add_pages(page));
        for (done, (page_va, page_pa)) in pages_from(va, pages).zip(frames).enumerate() {
            if let Err(err) = self.install_leaf(page_va, page_pa, perms, ownership, mem) {
                for undo_va in pages_from(va, done) {
                    self.clear_leaf(undo_va, mem);
                }
                log::debug!(target: "pt", "map_range: rolled back {} pages at {}", done, va);
                return Err(err);
            }
        }
        self.check_after_mutation(&*mem);
        Ok(Flush::new(Invalidation::Range { start: va, pages }, Some(self.asid)))
    }

    /// Removes the leaf at `va` and returns the physical address it mapped.
    ///
    /// An owned frame goes back to the allocator right away; callers that keep
    /// other harts running on this space must apply the returned flush before
    /// the allocator hands the frame out again.
    pub fn unmap<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        mem: &mut M,
    ) -> Result<(PhysAddr, Flush), UnmapError> {
        check_va(va)?;
        let slot = self.mapped_slot(va, &*mem)?;
        let (pa, _) = self.release_leaf(slot, mem);
        log::debug!(target: "pt", "unmap: va={} pa={}", va, pa);
        self.check_after_mutation(&*mem);
        Ok((pa, Flush::new(Invalidation::Page(va), Some(self.asid))))
    }

    /// Unmaps `pages` consecutive pages, all of which must be mapped. Returns how many
    /// owned frames were released.
    pub fn unmap_range<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        pages: usize,
        mem: &mut M,
    ) -> Result<(usize, Flush), UnmapError> {
        check_va(va)?;
        check_range(va, pages)?;
        for page_va in pages_from(va, pages) {
            self.mapped_slot(page_va, &*mem)?;
        }
        let mut released = 0;
        for page_va in pages_from(va, pages) {
            let slot = self.mapped_slot(page_va, &*mem)?;
            if self.release_leaf(slot, mem).1 {
                released += 1;
            }
        }
        log::debug!(target: "pt", "unmap_range: va={} pages={} released={}", va, pages, released);
        self.check_after_mutation(&*mem);
        Ok((released, Flush::new(Invalidation::Range { start: va, pages }, Some(self.asid))))
    }

    /// Replaces the R/W/X/U/G bits of an existing leaf. Other bits of `perms` are ignored;
    /// validity, ownership, accessed/dirty and the software bit keep their current value.
    pub fn remap<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        perms: PteFlags,
        mem: &mut M,
    ) -> Result<Flush, UnmapError> {
        check_va(va)?;
        let perms = leaf_permissions(perms & REMAP_BITS).ok_or(UnmapError::InvalidFlags)?;
        let slot = self.mapped_slot(va, &*mem)?;
        let entry = slot.read(&*mem);
        let kept = entry.flags().difference(REMAP_BITS);
        slot.write(mem, entry.with_flags(kept | perms));
        log::debug!(target: "pt", "remap: va={} perms={:?}", va, perms);
        self.check_after_mutation(&*mem);
        Ok(Flush::new(Invalidation::Page(va), Some(self.asid)))
    }

    fn install_leaf<M: FrameProvider + ?Sized>(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perms: PteFlags,
        ownership: Ownership,
        mem: &mut M,
    ) -> Result<(), MapError> {
        let slot = match walk(self.root(), va, CreatePolicy::Create, mem) {
            Ok(slot) => slot,
            Err(err @ WalkError::BlockedBySuperpage { level }) => {
                log::warn!(target: "pt", "map: {} blocked by superpage at {:?}", va, level);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        if slot.read(&*mem).is_present() {
            log::debug!(target: "pt", "map: {} already mapped", va);
            return Err(MapError::AlreadyMapped);
        }
        let mut flags = perms;
        if ownership == Ownership::Shared {
            flags |= PteFlags::NON_OWNING;
        }
        slot.write(mem, PageTableEntry::leaf(pa, flags));
        self.mapped += 1;
        log::debug!(target: "pt", "map: va={} pa={} flags={:?}", va, pa, flags);
        Ok(())
    }

    fn mapped_slot<M: PhysMap + ?Sized>(&self, va: VirtAddr, mem: &M) -> Result<LeafSlot, UnmapError> {
        let slot = walk_existing(self.root(), va, mem).map_err(|err| {
            if let WalkError::BlockedBySuperpage { level } = err {
                log::warn!(target: "pt", "{} blocked by superpage at {:?}", va, level);
            }
            UnmapError::from(err)
        })?;
        if slot.read(&*mem).is_present() {
            Ok(slot)
        } else {
            Err(UnmapError::NotMapped)
        }
    }

    /// Clears a present leaf, frees its frame if owned. Returns the mapped address and
    /// whether a frame went back to the allocator.
    fn release_leaf<M: FrameProvider + ?Sized>(&mut self, slot: LeafSlot, mem: &mut M) -> (PhysAddr, bool) {
        let entry = slot.read(&*mem);
        slot.write(mem, PageTableEntry::EMPTY);
        self.mapped = self.mapped.saturating_sub(1);
        let ppn = entry.ppn();
        if entry.flags().contains(PteFlags::NON_OWNING) {
            return (ppn.base(), false);
        }
        // SAFETY: the cleared entry was the frame's only owner.
        mem.free_frame(unsafe { PhysFrame::from_ppn(ppn) });
        (ppn.base(), true)
    }

    /// Drops a leaf installed during a failed range operation without freeing its frame.
    fn clear_leaf<M: FrameProvider + ?Sized>(&mut self, va: VirtAddr, mem: &mut M) {
        if let Ok(slot) = walk_existing(self.root(), va, &*mem) {
            if slot.read(&*mem).is_present() {
                slot.write(mem, PageTableEntry::EMPTY);
                self.mapped = self.mapped.saturating_sub(1);
            }
        }
    }
}

/// Consecutive page addresses from `va`. Callers validate the range with `check_range` first.
fn pages_from(va: VirtAddr, pages: usize) -> impl Iterator<Item = VirtAddr> {
    (0..pages as u64).map_while(move |page| va.checked_add_pages(page))
}


#[cfg(test)]
mod tests_prop;
