// SPDX-License-Identifier: MPL-2.0

//! Inter-world memory.
//!
//! An [`IwMem`] is a page-backed region whose layout is described to the
//! trusted peer through the active [`MemBackend`]. The pages either come
//! from the physical allocator, from an existing kernel buffer or from a
//! pinned user buffer; the origin decides what happens to them on teardown.
//!
//! Teardown asks the backend to dispose of the descriptor first. If that
//! fails, the peer may still be able to access the pages, so they are
//! leaked instead of being returned.

use align_ext::AlignExt;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    backend::{MemBackend, SharingDescriptor},
    channel::Channel,
    platform::{PhysMem, UserSpace},
    prelude::*,
};

/// The collaborators every [`IwMem`] needs.
#[derive(Clone)]
pub struct MemContext {
    pub phys: Arc<dyn PhysMem>,
    pub backend: Arc<dyn MemBackend>,
}

impl Debug for MemContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemContext")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// Where the pages of an [`IwMem`] come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    /// Allocated by the region, freed on teardown.
    Owned,
    /// Part of an existing kernel buffer, left alone on teardown.
    Adopted,
    /// Pinned from a user buffer, unpinned on teardown.
    User,
}

enum Origin {
    Owned,
    Adopted,
    User(Arc<dyn UserSpace>),
}

impl Origin {
    fn kind(&self) -> OriginKind {
        match self {
            Origin::Owned => OriginKind::Owned,
            Origin::Adopted => OriginKind::Adopted,
            Origin::User(_) => OriginKind::User,
        }
    }
}

/// A range of a region to map into a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRegion {
    /// The page-aligned user address of the first page.
    pub vaddr: Vaddr,
    /// The page-aligned offset of the range within the region.
    pub offset: usize,
    pub len: usize,
    pub writable: bool,
}

/// A region of inter-world memory.
pub struct IwMem {
    ctx: MemContext,
    pages: Vec<Paddr>,
    size: usize,
    origin: Origin,
    local_mapping: Mutex<Option<Vaddr>>,
    /// `None` once the region is torn down.
    desc: Option<SharingDescriptor>,
}

impl IwMem {
    /// Allocates a zero-filled region of `size` bytes.
    ///
    /// The backend may reorder the fresh pages.
    pub fn create(ctx: &MemContext, size: usize) -> Result<Self> {
        let nr_pages = nr_pages_of(size)?;

        let mut pages = Vec::with_capacity(nr_pages);
        for _ in 0..nr_pages {
            match ctx.phys.alloc_page() {
                Ok(paddr) => pages.push(paddr),
                Err(err) => {
                    free_pages(&*ctx.phys, &pages);
                    return Err(err);
                }
            }
        }

        let desc = match ctx.backend.init(&mut pages, true) {
            Ok(desc) => desc,
            Err(err) => {
                if err.leaves_memory_shared() {
                    error!("leaking {} pages after {}", pages.len(), err);
                } else {
                    free_pages(&*ctx.phys, &pages);
                }
                return Err(err);
            }
        };

        Ok(Self::new(ctx, pages, size, Origin::Owned, desc))
    }

    /// Adopts the existing kernel buffer of `size` bytes at `vaddr`.
    ///
    /// Nothing is copied or allocated, and the page order is kept.
    pub fn create_over_existing(ctx: &MemContext, vaddr: Vaddr, size: usize) -> Result<Self> {
        if vaddr % PAGE_SIZE != 0 {
            return_errno_with_message!(ErrorKind::InvalidArgument, "the buffer is not page-aligned");
        }
        let nr_pages = nr_pages_of(size)?;

        let mut pages = (0..nr_pages)
            .map(|i| {
                ctx.phys.resolve(vaddr + i * PAGE_SIZE).ok_or(Error::with_message(
                    ErrorKind::InvalidArgument,
                    "the buffer is not mapped",
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let desc = ctx.backend.init(&mut pages, false)?;
        Ok(Self::new(ctx, pages, size, Origin::Adopted, desc))
    }

    /// Pins the user buffer of `size` bytes at `vaddr` in `space`.
    pub fn create_from_user(
        ctx: &MemContext,
        space: Arc<dyn UserSpace>,
        vaddr: Vaddr,
        size: usize,
        writable: bool,
    ) -> Result<Self> {
        if vaddr % PAGE_SIZE != 0 {
            return_errno_with_message!(ErrorKind::InvalidArgument, "the buffer is not page-aligned");
        }
        let nr_pages = nr_pages_of(size)?;

        let mut pages = space.pin_pages(vaddr, nr_pages, writable)?;
        let desc = match ctx.backend.init(&mut pages, false) {
            Ok(desc) => desc,
            Err(err) => {
                if !err.leaves_memory_shared() {
                    space.unpin_pages(&pages);
                }
                return Err(err);
            }
        };

        Ok(Self::new(ctx, pages, size, Origin::User(space), desc))
    }

    fn new(
        ctx: &MemContext,
        pages: Vec<Paddr>,
        size: usize,
        origin: Origin,
        desc: SharingDescriptor,
    ) -> Self {
        debug!(
            "iw mem of {} pages ({:?}), {} descriptor entries",
            pages.len(),
            origin.kind(),
            desc.entries().len()
        );
        Self {
            ctx: ctx.clone(),
            pages,
            size,
            origin,
            local_mapping: Mutex::new(None),
            desc: Some(desc),
        }
    }

    /// Returns the size requested on creation.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Paddr] {
        &self.pages
    }

    pub fn origin(&self) -> OriginKind {
        self.origin.kind()
    }

    /// Returns the descriptor, or `None` if the region is torn down.
    pub fn descriptor(&self) -> Option<&SharingDescriptor> {
        self.desc.as_ref()
    }

    /// Maps the region into the kernel address space.
    ///
    /// A region has at most one local mapping.
    pub fn map(&self) -> Result<Vaddr> {
        let mut mapping = self.local_mapping.lock();
        if mapping.is_some() {
            return_errno_with_message!(ErrorKind::InvalidArgument, "already mapped");
        }
        if self.desc.is_none() {
            return_errno_with_message!(ErrorKind::InvalidArgument, "the region is torn down");
        }
        let vaddr = self.ctx.phys.vmap(&self.pages)?;
        *mapping = Some(vaddr);
        Ok(vaddr)
    }

    pub fn unmap(&self) -> Result<()> {
        let Some(vaddr) = self.local_mapping.lock().take() else {
            return_errno_with_message!(ErrorKind::InvalidArgument, "not mapped");
        };
        self.ctx.phys.vunmap(vaddr, self.pages.len());
        Ok(())
    }

    /// Returns the address of the local mapping.
    pub fn local_mapping(&self) -> Option<Vaddr> {
        *self.local_mapping.lock()
    }

    /// Inserts the pages covering `region` into `space`, one by one.
    ///
    /// On failure, the pages inserted so far stay in `space`; the owner of
    /// the address space removes them with the rest of the mapping.
    pub fn map_into_user(&self, space: &dyn UserSpace, region: &UserRegion) -> Result<()> {
        if region.len == 0 || region.vaddr % PAGE_SIZE != 0 || region.offset % PAGE_SIZE != 0 {
            return_errno_with_message!(ErrorKind::InvalidArgument, "malformed user region");
        }
        let end = region
            .offset
            .checked_add(region.len)
            .filter(|end| *end <= self.pages.len() * PAGE_SIZE)
            .ok_or(Error::with_message(
                ErrorKind::InvalidArgument,
                "the user region exceeds the memory",
            ))?;

        let first = region.offset / PAGE_SIZE;
        let last = end.align_up(PAGE_SIZE) / PAGE_SIZE;
        for (i, paddr) in self.pages[first..last].iter().enumerate() {
            space.insert_page(region.vaddr + i * PAGE_SIZE, *paddr, region.writable)?;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        read_pages(&*self.ctx.phys, &self.pages, offset, buf);
        Ok(())
    }

    /// Writes `buf` at `offset`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        write_pages(&*self.ctx.phys, &self.pages, offset, buf);
        Ok(())
    }

    pub fn read_val<T: FromBytes + IntoBytes>(&self, offset: usize) -> Result<T> {
        let mut val = T::new_zeroed();
        self.read_bytes(offset, val.as_mut_bytes())?;
        Ok(val)
    }

    pub fn write_val<T: IntoBytes + Immutable>(&self, offset: usize, val: &T) -> Result<()> {
        self.write_bytes(offset, val.as_bytes())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.pages.len() * PAGE_SIZE => Ok(()),
            _ => return_errno_with_message!(ErrorKind::InvalidArgument, "access out of range"),
        }
    }

    /// Packs the descriptor of the region into `channel`.
    pub fn pack(&self, channel: &mut Channel) -> Result<()> {
        let Some(desc) = self.desc.as_ref() else {
            return_errno_with_message!(ErrorKind::InvalidArgument, "the region is torn down");
        };
        self.ctx.backend.pack(desc, channel)
    }

    /// Tears the region down.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if the region is still
    /// mapped locally; the region is then left untouched. Any other failure
    /// leaves the pages leaked.
    pub fn destroy(&mut self) -> Result<()> {
        if self.local_mapping.get_mut().is_some() {
            return_errno_with_message!(ErrorKind::InvalidArgument, "the region is still mapped");
        }
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(vaddr) = self.local_mapping.get_mut().take() {
            self.ctx.phys.vunmap(vaddr, self.pages.len());
        }
        let Some(desc) = self.desc.take() else {
            return Ok(());
        };
        let pages = core::mem::take(&mut self.pages);

        if let Err(err) = self.ctx.backend.deinit(&desc) {
            error!(
                "leaking {} pages that the peer may still access: {}",
                pages.len(),
                err
            );
            return Err(err);
        }

        match &self.origin {
            Origin::Owned => free_pages(&*self.ctx.phys, &pages),
            Origin::Adopted => {}
            Origin::User(space) => space.unpin_pages(&pages),
        }
        Ok(())
    }
}

impl Drop for IwMem {
    fn drop(&mut self) {
        // Failures are logged by the teardown itself.
        let _ = self.teardown();
    }
}

impl Debug for IwMem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IwMem")
            .field("size", &self.size)
            .field("nr_pages", &self.pages.len())
            .field("origin", &self.origin.kind())
            .field("local_mapping", &self.local_mapping())
            .field("desc", &self.desc)
            .finish()
    }
}

fn nr_pages_of(size: usize) -> Result<usize> {
    if size == 0 {
        return_errno_with_message!(ErrorKind::InvalidArgument, "zero-sized memory");
    }
    if size > isize::MAX as usize {
        return_errno_with_message!(ErrorKind::InvalidArgument, "oversized memory");
    }
    Ok(size.align_up(PAGE_SIZE) / PAGE_SIZE)
}

fn free_pages(phys: &dyn PhysMem, pages: &[Paddr]) {
    for paddr in pages {
        phys.free_page(*paddr);
    }
}

/// Reads bytes at `offset` of the memory formed by `pages`, crossing page
/// boundaries as needed.
pub(crate) fn read_pages(phys: &dyn PhysMem, pages: &[Paddr], offset: usize, buf: &mut [u8]) {
    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done;
        let in_page = pos % PAGE_SIZE;
        let len = (PAGE_SIZE - in_page).min(buf.len() - done);
        phys.read(pages[pos / PAGE_SIZE], in_page, &mut buf[done..done + len]);
        done += len;
    }
}

/// Writes bytes at `offset` of the memory formed by `pages`, crossing page
/// boundaries as needed.
pub(crate) fn write_pages(phys: &dyn PhysMem, pages: &[Paddr], offset: usize, buf: &[u8]) {
    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done;
        let in_page = pos % PAGE_SIZE;
        let len = (PAGE_SIZE - in_page).min(buf.len() - done);
        phys.write(pages[pos / PAGE_SIZE], in_page, &buf[done..done + len]);
        done += len;
    }
}
