// SPDX-License-Identifier: MPL-2.0

//! The strategies that describe memory regions to the trusted peer.
//!
//! A backend turns the page list of a region into a [`SharingDescriptor`]
//! and packs that descriptor into a channel. The wire format is the same for
//! every backend: a 4-byte count followed by `count` 4-byte entries. Only
//! the meaning of an entry differs:
//!
//! | Backend      | Entry                     |
//! |--------------|---------------------------|
//! | Direct       | the page-frame number     |
//! | Hypervisor   | the handle of one batch   |
//!
//! The backend is chosen once when the subsystem starts. Callers only see
//! the [`MemBackend`] trait.

mod direct;
mod hyp;

use zerocopy::{
    IntoBytes,
    byteorder::{LittleEndian, U32},
};

pub use self::{direct::DirectBackend, hyp::HypBackend};
use crate::{channel::Channel, config::BackendKind, prelude::*};

/// A `u32` in the byte order of the wire.
pub type U32Le = U32<LittleEndian>;

/// The wire descriptor of a region, as produced by [`MemBackend::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharingDescriptor {
    kind: BackendKind,
    entries: Vec<u32>,
}

impl SharingDescriptor {
    pub(crate) fn new(kind: BackendKind, entries: Vec<u32>) -> Self {
        Self { kind, entries }
    }

    /// Returns the backend that produced the descriptor.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Returns the size of the packed descriptor in bytes.
    pub fn packed_len(&self) -> usize {
        (1 + self.entries.len()) * size_of::<u32>()
    }
}

/// A strategy to describe memory regions to the trusted peer.
pub trait MemBackend: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;

    /// Prepares the descriptor of `pages`.
    ///
    /// If `may_reorder` is true, the backend may permute `pages`; callers
    /// that depend on the layout of existing memory pass `false`.
    fn init(&self, pages: &mut [Paddr], may_reorder: bool) -> Result<SharingDescriptor>;

    /// Writes the descriptor into `channel`.
    fn pack(&self, desc: &SharingDescriptor, channel: &mut Channel) -> Result<()> {
        write_descriptor(channel, desc.entries())
    }

    /// Disposes of the descriptor.
    ///
    /// If this fails, the peer may still be able to access the pages.
    fn deinit(&self, desc: &SharingDescriptor) -> Result<()>;
}

/// Writes `entries` in the packed descriptor format.
pub(crate) fn write_descriptor(channel: &mut Channel, entries: &[u32]) -> Result<()> {
    let count = u32::try_from(entries.len())
        .map_err(|_| Error::with_message(ErrorKind::InvalidArgument, "too many entries"))?;
    channel.reserve((1 + entries.len()) * size_of::<u32>())?;
    channel.write_val(&U32Le::new(count))?;
    channel.write(wire_entries(entries).as_bytes())
}

/// Converts descriptor entries to wire order.
pub(crate) fn wire_entries(entries: &[u32]) -> Vec<U32Le> {
    entries.iter().map(|&entry| U32Le::new(entry)).collect()
}
