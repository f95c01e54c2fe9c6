// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: "Translation changed" notifications and the TLB collaborator interface
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Flush, Invalidation, TlbInvalidate, Sfence (riscv64 only)
//! INVARIANTS: The core never executes a fence itself; every mutation hands back a Flush

use crate::addr::VirtAddr;

/// What a mutation invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invalidation {
    Page(VirtAddr),
    Range { start: VirtAddr, pages: usize },
    All,
}

/// TLB/cache maintenance supplied by the embedding kernel.
pub trait TlbInvalidate {
    /// Drops cached translations covered by `what`, restricted to `asid` when given.
    fn invalidate(&mut self, what: Invalidation, asid: Option<u16>);
}

/// Proof that a translation changed. Must be flushed or explicitly ignored.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "translation changed; flush the TLB or call `ignore`"]
pub struct Flush {
    what: Invalidation,
    asid: Option<u16>,
}

impl Flush {
    pub(crate) fn new(what: Invalidation, asid: Option<u16>) -> Self {
        Self { what, asid }
    }

    pub fn invalidation(&self) -> Invalidation {
        self.what
    }

    pub fn asid(&self) -> Option<u16> {
        self.asid
    }

    pub fn flush<T: TlbInvalidate + ?Sized>(self, tlb: &mut T) {
        tlb.invalidate(self.what, self.asid);
    }

    /// Discards the notification, e.g. when the space is not active on any hart.
    pub fn ignore(self) {}
}

/// Local-hart `sfence.vma`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct Sfence;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl TlbInvalidate for Sfence {
    fn invalidate(&mut self, what: Invalidation, asid: Option<u16>) {
        use crate::addr::PAGE_SIZE;

        let asid = asid.map(usize::from);
        match what {
            Invalidation::Page(va) => sfence_vma(Some(va.raw() as usize), asid),
            Invalidation::Range { start, pages } => {
                let base = start.raw() as usize;
                for page in 0..pages {
                    sfence_vma(Some(base + page * PAGE_SIZE as usize), asid);
                }
            }
            Invalidation::All => sfence_vma(None, asid),
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn sfence_vma(vaddr: Option<usize>, asid: Option<usize>) {
    // SAFETY: SFENCE.VMA only orders page-table updates and drops cached translations.
    unsafe {
        match (vaddr, asid) {
            (Some(addr), Some(id)) => {
                core::arch::asm!("sfence.vma {0}, {1}", in(reg) addr, in(reg) id, options(nostack))
            }
            (Some(addr), None) => {
                core::arch::asm!("sfence.vma {0}, zero", in(reg) addr, options(nostack))
            }
            (None, Some(id)) => {
                core::arch::asm!("sfence.vma zero, {0}", in(reg) id, options(nostack))
            }
            (None, None) => core::arch::asm!("sfence.vma", options(nostack)),
        }
    }
}
