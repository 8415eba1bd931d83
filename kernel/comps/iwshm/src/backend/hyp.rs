// SPDX-License-Identifier: MPL-2.0

use super::{MemBackend, SharingDescriptor};
use crate::{config::BackendKind, hyp::HypAllocator, prelude::*};

/// The backend transferring page ownership to the peer VM.
///
/// The descriptor lists one handle per batch.
#[derive(Debug)]
pub struct HypBackend {
    allocator: Arc<HypAllocator>,
    sort_pages: bool,
}

impl HypBackend {
    pub fn new(allocator: Arc<HypAllocator>, sort_pages: bool) -> Self {
        Self {
            allocator,
            sort_pages,
        }
    }

    pub fn allocator(&self) -> &Arc<HypAllocator> {
        &self.allocator
    }
}

impl MemBackend for HypBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hypervisor
    }

    fn init(&self, pages: &mut [Paddr], may_reorder: bool) -> Result<SharingDescriptor> {
        // Sorted pages merge into fewer chunks, hence fewer batches.
        if may_reorder && self.sort_pages {
            pages.sort_unstable();
        }
        let handles = self.allocator.share(pages)?;
        Ok(SharingDescriptor::new(BackendKind::Hypervisor, handles))
    }

    fn deinit(&self, desc: &SharingDescriptor) -> Result<()> {
        self.allocator.release(desc.entries())
    }
}
