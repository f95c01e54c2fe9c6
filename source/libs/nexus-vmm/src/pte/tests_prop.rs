// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the PTE codec
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - encode/decode agree for every page number and flag combination
//!   - classification predicates partition present entries
//!
//! TEST_SCENARIOS:
//!   - codec_roundtrip(): decode(encode(ppn, flags)) == (ppn, flags)
//!   - present_entry_is_leaf_xor_branch(): exactly one of is_leaf/is_branch for present entries
//!   - reserved_bits_never_leak(): encoded entries never set bits 54..63

use super::{decode, encode, is_branch, is_empty, is_leaf, PageTableEntry, PteFlags};
use crate::addr::Ppn;
use proptest::prelude::*;

fn arb_ppn() -> impl Strategy<Value = Ppn> {
    (0u64..=Ppn::MAX.raw()).prop_map(Ppn::new_truncate)
}

fn arb_flags() -> impl Strategy<Value = PteFlags> {
    (0u64..1024).prop_map(PteFlags::from_bits_truncate)
}

proptest! {
    #[test]
    fn codec_roundtrip(ppn in arb_ppn(), flags in arb_flags()) {
        prop_assert_eq!(decode(encode(ppn, flags)), (ppn, flags));
    }

    #[test]
    fn present_entry_is_leaf_xor_branch(ppn in arb_ppn(), flags in arb_flags()) {
        let raw = encode(ppn, flags);
        if flags.contains(PteFlags::VALID) {
            prop_assert!(!is_empty(raw));
            prop_assert!(is_leaf(raw) != is_branch(raw));
            prop_assert_eq!(is_leaf(raw), flags.intersects(PteFlags::RWX));
        } else {
            prop_assert!(is_empty(raw));
            prop_assert!(!is_leaf(raw) && !is_branch(raw));
        }
    }

    #[test]
    fn reserved_bits_never_leak(ppn in arb_ppn(), flags in arb_flags()) {
        prop_assert!(!PageTableEntry::new(ppn, flags).has_reserved_bits());
    }
}
