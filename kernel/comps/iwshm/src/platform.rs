// SPDX-License-Identifier: MPL-2.0

//! The services this component consumes from the rest of the kernel.
//!
//! Every collaborator outside of the inter-world memory core is reached
//! through one of the traits below. A [`TzDev`] instance holds one object per
//! trait, so that independent instances (e.g., in tests) never share state.
//!
//! [`TzDev`]: crate::TzDev

use alloc::vec::Vec;
use core::time::Duration;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::prelude::Result;

/// Physical addresses.
pub type Paddr = usize;

/// Virtual addresses.
pub type Vaddr = usize;

/// The size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The page-frame number of a physical address.
pub const fn paddr_to_pfn(paddr: Paddr) -> usize {
    paddr / PAGE_SIZE
}

/// The ID of a CPU.
pub type CpuId = usize;

/// CPU topology, time and scheduling.
pub trait Platform: Send + Sync {
    /// Returns the number of CPUs in the system.
    fn nr_cpus(&self) -> usize;

    /// Returns the CPU that the caller currently runs on.
    fn current_cpu(&self) -> CpuId;

    /// Returns the monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;

    /// Gives up the CPU for a moment while waiting for a condition.
    fn yield_now(&self);

    /// Returns the credential of the current process.
    fn credential(&self) -> Credential;
}

/// The credential record attached to a registration.
///
/// How the hash is computed is up to the credential layer; this component
/// only forwards it to the peer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Credential {
    pub pid: u32,
    pub uid: u32,
    pub hash: [u8; 32],
}

/// Page-granular physical memory.
pub trait PhysMem: Send + Sync {
    /// Allocates one zero-filled page.
    fn alloc_page(&self) -> Result<Paddr>;

    /// Frees a page allocated with [`PhysMem::alloc_page`].
    fn free_page(&self, paddr: Paddr);

    /// Reads `buf.len()` bytes at `offset` within the page at `paddr`.
    ///
    /// The access never crosses the page boundary.
    fn read(&self, paddr: Paddr, offset: usize, buf: &mut [u8]);

    /// Writes `buf` at `offset` within the page at `paddr`.
    ///
    /// The access never crosses the page boundary.
    fn write(&self, paddr: Paddr, offset: usize, buf: &[u8]);

    /// Resolves the page backing a kernel virtual address.
    fn resolve(&self, vaddr: Vaddr) -> Option<Paddr>;

    /// Maps the pages virtually contiguous in the kernel address space.
    fn vmap(&self, pages: &[Paddr]) -> Result<Vaddr>;

    /// Removes a mapping created by [`PhysMem::vmap`].
    fn vunmap(&self, vaddr: Vaddr, nr_pages: usize);
}

/// The address space of a user process.
pub trait UserSpace: Send + Sync {
    /// Inserts one page into the address space at `vaddr`.
    fn insert_page(&self, vaddr: Vaddr, paddr: Paddr, writable: bool) -> Result<()>;

    /// Pins the pages backing `nr_pages` pages starting at `vaddr`.
    fn pin_pages(&self, vaddr: Vaddr, nr_pages: usize, writable: bool) -> Result<Vec<Paddr>>;

    /// Releases pages pinned with [`UserSpace::pin_pages`].
    fn unpin_pages(&self, pages: &[Paddr]);
}

/// The register set of the peer-invocation primitive.
///
/// Register 0 carries the command on the way in and the signed status on
/// the way out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerRegs {
    pub regs: [u64; 4],
}

impl PeerRegs {
    pub fn new(cmd: u32, args: [u64; 3]) -> Self {
        Self {
            regs: [cmd as u64, args[0], args[1], args[2]],
        }
    }

    pub fn cmd(&self) -> u32 {
        self.regs[0] as u32
    }

    pub fn arg(&self, idx: usize) -> u64 {
        self.regs[idx + 1]
    }

    pub fn status(&self) -> i32 {
        self.regs[0] as i64 as i32
    }

    pub fn set_status(&mut self, status: i32) {
        self.regs[0] = status as i64 as u64;
    }
}

/// The synchronous call into the trusted peer.
pub trait PeerInvoke: Send + Sync {
    /// Switches to the peer with `regs` and returns when it answers.
    fn invoke(&self, regs: &mut PeerRegs);
}
