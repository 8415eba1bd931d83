// SPDX-License-Identifier: MPL-2.0

//! Memory sharing mediated by the hypervisor's resource manager.
//!
//! When the trusted peer runs in its own virtual machine, it cannot address
//! the memory of this VM. Instead, batches of pages are handed over
//! explicitly: the access rights are reassigned to include the peer VM, the
//! hypervisor issues an opaque handle for the batch, and the peer accepts
//! the handle before touching the memory. Releasing walks the same steps
//! backwards.

// The `TryFromInt` derive emits `Self::Error`, which clashes with `BatchState::Error`.
#[expect(ambiguous_associated_items)]
mod allocator;
mod batch;

pub use allocator::{BatchState, HypAllocator};
pub use batch::{Chunk, group_batches, split_chunks};

use alloc::{sync::Weak, vec::Vec};

use crate::platform::Paddr;

/// A handle identifying a batch of shared pages.
pub type MemHandle = u32;

/// The ID of a virtual machine.
pub type VmId = u16;

/// The virtual machines taking part in the sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmName {
    /// The VM this kernel runs in.
    Current,
    /// The VM hosting the trusted peer.
    Peer,
}

bitflags::bitflags! {
    /// Access permissions of a VM on a batch of pages.
    pub struct Perm: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const RW    = Self::READ.bits | Self::WRITE.bits;
        const RWX   = Self::RW.bits | Self::EXEC.bits;
    }
}

/// One physically contiguous entry of a scatter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub paddr: Paddr,
    pub size: usize,
}

/// What a memory notification tells the receiving VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemNotifyKind {
    /// The batch has been shared and may be accepted.
    Shared,
    /// The sharer asks for the batch back.
    Released,
}

/// The state of a VM, as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Stopped,
    Crashed,
}

/// Errors reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypError {
    /// The memory or the VM is no longer available to this VM.
    Unavailable,
    NoMemory,
    InvalidArgs,
    Failed(i32),
}

/// The resource-manager API of the hypervisor.
///
/// Asynchronous notifications (batch accepted, batch released, VM status)
/// are delivered by calling the `on_*` methods of the [`HypAllocator`]
/// registered with [`HypervisorRm::register_notifier`].
pub trait HypervisorRm: Send + Sync {
    /// Registers the receiver of asynchronous notifications.
    fn register_notifier(&self, allocator: Weak<HypAllocator>);

    /// Looks up the ID of a VM.
    fn vmid(&self, vm: VmName) -> Result<VmId, HypError>;

    /// Reassigns the access rights of the pages in `sgl` from the `src`
    /// VMs to the `dst` VMs.
    fn assign(&self, sgl: &[SgEntry], src: &[VmId], dst: &[(VmId, Perm)])
    -> Result<(), HypError>;

    /// Creates a memory parcel for the pages in `sgl` and returns its handle.
    fn mem_share(&self, sgl: &[SgEntry], acl: &[(VmId, Perm)]) -> Result<MemHandle, HypError>;

    /// Notifies `target` about the parcel `handle`.
    fn mem_notify(
        &self,
        handle: MemHandle,
        kind: MemNotifyKind,
        target: VmId,
    ) -> Result<(), HypError>;

    /// Takes the parcel `handle` back.
    fn mem_reclaim(&self, handle: MemHandle) -> Result<(), HypError>;
}

/// The scatter list describing the pages of a batch.
pub(crate) fn scatter_list(pages: &[Paddr], chunks: &[Chunk]) -> Vec<SgEntry> {
    chunks
        .iter()
        .map(|chunk| SgEntry {
            paddr: pages[chunk.start],
            size: chunk.size(),
        })
        .collect()
}
