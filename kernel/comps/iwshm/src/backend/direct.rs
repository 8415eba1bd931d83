// SPDX-License-Identifier: MPL-2.0

use super::{MemBackend, SharingDescriptor};
use crate::{config::BackendKind, platform::paddr_to_pfn, prelude::*};

/// The backend for peers that address physical memory directly.
///
/// Nothing is transferred; the descriptor lists the page-frame numbers.
#[derive(Debug, Default)]
pub struct DirectBackend;

impl MemBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn init(&self, pages: &mut [Paddr], _may_reorder: bool) -> Result<SharingDescriptor> {
        let entries = pages
            .iter()
            .map(|paddr| u32::try_from(paddr_to_pfn(*paddr)))
            .collect::<core::result::Result<Vec<_>, _>>()
            .map_err(|_| {
                Error::with_message(ErrorKind::InvalidArgument, "the frame number exceeds 32 bits")
            })?;
        Ok(SharingDescriptor::new(BackendKind::Direct, entries))
    }

    fn deinit(&self, _desc: &SharingDescriptor) -> Result<()> {
        Ok(())
    }
}
