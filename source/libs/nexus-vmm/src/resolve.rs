// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only VA to PA translation.

use thiserror::Error;

use crate::addr::{Level, PhysAddr, VirtAddr};
use crate::frame::PhysMap;
use crate::pte::PteFlags;
use crate::space::AddressSpace;
use crate::walk::{walk_existing, WalkError};

/// Result of a successful translation. Permissions are reported, not enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysAddr,
    pub flags: PteFlags,
}

impl Translation {
    pub fn readable(&self) -> bool {
        self.flags.contains(PteFlags::READ)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITE)
    }

    pub fn executable(&self) -> bool {
        self.flags.contains(PteFlags::EXECUTE)
    }

    pub fn user(&self) -> bool {
        self.flags.contains(PteFlags::USER)
    }

    /// False for device and shared mappings.
    pub fn is_owning(&self) -> bool {
        !self.flags.contains(PteFlags::NON_OWNING)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("address not mapped")]
    Unmapped,
    /// The path ends in a superpage leaf; superpages are not resolved.
    #[error("superpage at {level:?} covers the address")]
    BlockedBySuperpage { level: Level },
}

impl From<WalkError> for TranslateError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::BlockedBySuperpage { level } => TranslateError::BlockedBySuperpage { level },
            WalkError::NotMapped | WalkError::OutOfMemory => TranslateError::Unmapped,
        }
    }
}

impl AddressSpace {
    /// Resolves `va`, keeping its page offset. Never allocates, never logs.
    pub fn translate<M: PhysMap + ?Sized>(
        &self,
        va: VirtAddr,
        mem: &M,
    ) -> Result<Translation, TranslateError> {
        let entry = walk_existing(self.root(), va, mem)?.read(mem);
        if entry.is_empty() {
            return Err(TranslateError::Unmapped);
        }
        Ok(Translation { phys: PhysAddr::from_ppn(entry.ppn(), va.page_offset()), flags: entry.flags() })
    }
}
