// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for map/translate/unmap/destroy on random page sets
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - every mapped page translates to its frame with the requested permissions
//!   - unmapping releases exactly the owned frames, once
//!   - teardown leaves the arena empty whatever was mapped
//!
//! TEST_SCENARIOS:
//!   - map_then_translate(): random distinct pages resolve to their frames, offsets preserved
//!   - unmap_then_translate_fails(): unmapped pages stop resolving, the rest keep resolving
//!   - destroy_returns_every_frame(): no frame freed twice, nothing left allocated

use std::collections::BTreeSet;
use std::vec::Vec;

use proptest::prelude::*;

use crate::addr::{PhysAddr, VirtAddr};
use crate::arena::FrameArena;
use crate::frame::FrameAllocator;
use crate::mapper::Ownership;
use crate::pte::PteFlags;
use crate::resolve::TranslateError;
use crate::space::AddressSpace;

const ARENA_FRAMES: usize = 256;

/// Distinct canonical page addresses drawn from both halves of the address space.
fn arb_pages() -> impl Strategy<Value = Vec<VirtAddr>> {
    prop::collection::btree_set((0u64..1 << 26, any::<bool>()), 1..24).prop_map(|set| {
        set.into_iter()
            .map(|(vpn, high)| {
                let raw = vpn << 12;
                let raw = if high { raw | 0xFFFF_FFC0_0000_0000 } else { raw };
                VirtAddr::new(raw).unwrap()
            })
            .collect()
    })
}

fn arb_perms() -> impl Strategy<Value = PteFlags> {
    prop_oneof![
        Just(PteFlags::READ),
        Just(PteFlags::READ | PteFlags::WRITE),
        Just(PteFlags::READ | PteFlags::EXECUTE),
        Just(PteFlags::EXECUTE | PteFlags::USER),
    ]
}

fn setup() -> (FrameArena, AddressSpace) {
    let mut mem = FrameArena::new(PhysAddr::new(0x8000_0000).unwrap(), ARENA_FRAMES);
    let space = AddressSpace::new(&mut mem).unwrap();
    (mem, space)
}

proptest! {
    #[test]
    fn map_then_translate(pages in arb_pages(), perms in arb_perms(), offset in 0u64..4096) {
        let (mut mem, mut space) = setup();
        for (i, va) in pages.iter().enumerate() {
            let pa = PhysAddr::new(0x1_0000_0000 + (i as u64) * 0x1000).unwrap();
            space.map(*va, pa, perms, Ownership::Shared, &mut mem).unwrap().ignore();
        }
        prop_assert_eq!(space.mapped_pages(), pages.len());
        prop_assert_eq!(space.verify(&mem), Ok(()));
        for (i, va) in pages.iter().enumerate() {
            let probe = VirtAddr::new(va.raw() + offset).unwrap();
            let t = space.translate(probe, &mem).unwrap();
            prop_assert_eq!(t.phys.raw(), 0x1_0000_0000 + (i as u64) * 0x1000 + offset);
            prop_assert_eq!(t.flags & PteFlags::PERMISSIONS, perms);
        }
        space.destroy(&mut mem);
    }

    #[test]
    fn unmap_then_translate_fails(pages in arb_pages(), split in 0usize..24) {
        let (mut mem, mut space) = setup();
        for (i, va) in pages.iter().enumerate() {
            let pa = PhysAddr::new(0x1_0000_0000 + (i as u64) * 0x1000).unwrap();
            space.map(*va, pa, PteFlags::READ, Ownership::Shared, &mut mem).unwrap().ignore();
        }
        let split = split.min(pages.len());
        let tables = mem.allocated();
        for va in &pages[..split] {
            space.unmap(*va, &mut mem).unwrap().1.ignore();
        }
        prop_assert!(mem.freed().is_empty());
        prop_assert_eq!(mem.allocated(), tables);
        for va in &pages[..split] {
            prop_assert_eq!(space.translate(*va, &mem), Err(TranslateError::Unmapped));
        }
        for va in &pages[split..] {
            prop_assert!(space.translate(*va, &mem).is_ok());
        }
        space.destroy(&mut mem);
    }

    #[test]
    fn destroy_returns_every_frame(pages in arb_pages()) {
        let (mut mem, mut space) = setup();
        for va in &pages {
            let frame = mem.alloc_frame().unwrap();
            space.map_frame(*va, frame, PteFlags::READ, &mut mem).unwrap().ignore();
        }
        let stats = space.destroy(&mut mem);
        prop_assert_eq!(stats.frames_freed, pages.len());
        prop_assert_eq!(mem.allocated(), 0);
        let unique: BTreeSet<_> = mem.freed().iter().copied().collect();
        prop_assert_eq!(unique.len(), mem.freed().len());
    }
}
