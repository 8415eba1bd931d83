// SPDX-License-Identifier: MPL-2.0

//! Communication channels to the trusted peer.
//!
//! A channel is a growable buffer of inter-world memory that carries
//! requests (e.g., packed descriptors) to the peer. Each CPU owns one
//! channel, unless per-CPU channels are disabled and a single channel is
//! shared. A holder checks a channel out with [`ChannelSet::acquire`], writes
//! and reads it, and gives it back by dropping the [`ChannelGuard`].
//!
//! The peer locates the data of a channel through its metadata page:
//!
//! ```text
//! +--------------+-------+----------+----------+-----+
//! | write offset | count | entry 0  | entry 1  | ... |
//! +--------------+-------+----------+----------+-----+
//!      u32          u32      u32        u32
//! ```
//!
//! The entries are the descriptor entries of the data pages, in order. A
//! channel keeps a baseline of data pages across transactions; pages added
//! during a transaction are freed when the channel is given back.

use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use align_ext::AlignExt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    backend::{U32Le, wire_entries},
    config::IwConfig,
    invoke::{self, PeerCmd},
    mem::{IwMem, MemContext, read_pages, write_pages},
    platform::{PeerInvoke, Platform},
    prelude::*,
    sync::wait_until,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ChannelMeta {
    write_offset: U32Le,
    count: U32Le,
}

const ENTRY_SIZE: usize = size_of::<u32>();

/// The maximum number of data descriptor entries of a channel.
pub const MAX_CHANNEL_ENTRIES: usize = (PAGE_SIZE - size_of::<ChannelMeta>()) / ENTRY_SIZE;

/// The channels of all CPUs.
pub struct ChannelSet {
    platform: Arc<dyn Platform>,
    slots: Vec<Mutex<Channel>>,
    /// The page counts of the channels, readable while a channel is held.
    page_counts: Vec<Arc<AtomicUsize>>,
    per_cpu: bool,
    /// The page announcing the metadata pages; the peer may refer to it
    /// until the channels are torn down.
    _announce: IwMem,
}

impl ChannelSet {
    /// Sets up the channels and announces them to the peer.
    ///
    /// A failure tears down every channel set up so far.
    pub fn new(
        ctx: &MemContext,
        platform: Arc<dyn Platform>,
        peer: &dyn PeerInvoke,
        config: &IwConfig,
    ) -> Result<Self> {
        let per_cpu = config.per_cpu_channels;
        let nr_channels = if per_cpu {
            platform.nr_cpus().max(1)
        } else {
            1
        };
        if nr_channels > (PAGE_SIZE - ENTRY_SIZE) / ENTRY_SIZE {
            return_errno_with_message!(ErrorKind::InvalidArgument, "too many channels");
        }

        let mut channels = Vec::with_capacity(nr_channels);
        for index in 0..nr_channels {
            channels.push(Channel::new(index, ctx, config.channel_pages)?);
        }

        let announce = IwMem::create(ctx, PAGE_SIZE)?;
        let mut meta_entries = Vec::with_capacity(nr_channels);
        for channel in &channels {
            meta_entries.extend_from_slice(channel.meta_entries());
        }
        if meta_entries.len() != nr_channels {
            return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "a metadata page needs more than one entry"
            );
        }
        announce.write_val(0, &U32Le::new(nr_channels as u32))?;
        announce.write_bytes(ENTRY_SIZE, wire_entries(&meta_entries).as_bytes())?;

        let announce_entry = match announce.descriptor().map(|desc| desc.entries()) {
            Some([entry]) => *entry,
            _ => return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "the announce page needs more than one entry"
            ),
        };
        invoke::call(
            peer,
            PeerCmd::ChannelsInit,
            [announce_entry as u64, nr_channels as u64, 0],
        )?;
        debug!(
            "{} channels announced, {} baseline pages each",
            nr_channels, config.channel_pages
        );

        let page_counts = channels
            .iter()
            .map(|channel| channel.page_count.clone())
            .collect();
        Ok(Self {
            platform,
            slots: channels.into_iter().map(Mutex::new).collect(),
            page_counts,
            per_cpu,
            _announce: announce,
        })
    }

    /// Checks out the channel of the current CPU.
    ///
    /// Waits while another holder has the channel.
    pub fn acquire(&self) -> ChannelGuard<'_> {
        let index = if self.per_cpu {
            self.platform.current_cpu() % self.slots.len()
        } else {
            0
        };
        let slot = &self.slots[index];
        let mut channel = wait_until(&*self.platform, || slot.try_lock());
        channel.reset();
        ChannelGuard { channel }
    }

    pub fn nr_channels(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of data pages of all channels.
    pub fn nr_pages(&self) -> usize {
        self.page_counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }
}

impl Debug for ChannelSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("nr_channels", &self.slots.len())
            .field("per_cpu", &self.per_cpu)
            .finish_non_exhaustive()
    }
}

/// A checked-out channel.
///
/// Dropping the guard gives the channel back and frees the data pages
/// beyond the baseline.
pub struct ChannelGuard<'a> {
    channel: MutexGuard<'a, Channel>,
}

impl ChannelGuard<'_> {
    /// Gives the channel back.
    pub fn release(self) {}
}

impl Deref for ChannelGuard<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl DerefMut for ChannelGuard<'_> {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.channel.trim();
    }
}

/// The channel of one CPU.
pub struct Channel {
    index: usize,
    ctx: MemContext,
    meta: IwMem,
    baseline: IwMem,
    dynamic: Vec<IwMem>,
    /// All data pages, the baseline first.
    pages: Vec<Paddr>,
    page_count: Arc<AtomicUsize>,
    nr_baseline_entries: usize,
    nr_entries: usize,
    write_offset: usize,
    read_offset: usize,
}

impl Channel {
    fn new(index: usize, ctx: &MemContext, nr_baseline_pages: usize) -> Result<Self> {
        let meta = IwMem::create(ctx, PAGE_SIZE)?;
        let baseline_size = nr_baseline_pages.checked_mul(PAGE_SIZE).ok_or(Error::with_message(
            ErrorKind::InvalidArgument,
            "too many baseline pages",
        ))?;
        let baseline = IwMem::create(ctx, baseline_size)?;

        let entries = baseline.descriptor().map_or(&[][..], |desc| desc.entries());
        if entries.len() > MAX_CHANNEL_ENTRIES {
            return_errno_with_message!(ErrorKind::InvalidArgument, "too many baseline pages");
        }
        meta.write_bytes(size_of::<ChannelMeta>(), wire_entries(entries).as_bytes())?;
        meta.write_val(
            0,
            &ChannelMeta {
                write_offset: U32Le::new(0),
                count: U32Le::new(entries.len() as u32),
            },
        )?;

        let nr_entries = entries.len();
        let pages = baseline.pages().to_vec();
        Ok(Self {
            index,
            ctx: ctx.clone(),
            meta,
            baseline,
            dynamic: Vec::new(),
            page_count: Arc::new(AtomicUsize::new(pages.len())),
            pages,
            nr_baseline_entries: nr_entries,
            nr_entries,
            write_offset: 0,
            read_offset: 0,
        })
    }

    /// Returns the index of the channel, as known by the peer.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Returns the number of data pages.
    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    fn meta_entries(&self) -> &[u32] {
        self.meta.descriptor().map_or(&[], |desc| desc.entries())
    }

    /// Makes room for `len` more bytes.
    ///
    /// New pages are described in the metadata page before they count as
    /// part of the channel. If the pages cannot be added, only the pages
    /// allocated by this call are freed.
    pub fn reserve(&mut self, len: usize) -> Result<()> {
        let needed = self.write_offset.checked_add(len).ok_or(Error::with_message(
            ErrorKind::InvalidArgument,
            "oversized channel request",
        ))?;
        let capacity = self.pages.len() * PAGE_SIZE;
        if needed <= capacity {
            return Ok(());
        }

        let nr_new_pages = (needed - capacity).align_up(PAGE_SIZE) / PAGE_SIZE;
        let mem = IwMem::create(&self.ctx, nr_new_pages * PAGE_SIZE)?;
        let entries = mem.descriptor().map_or(&[][..], |desc| desc.entries());
        let nr_entries = self.nr_entries + entries.len();
        if nr_entries > MAX_CHANNEL_ENTRIES {
            return_errno_with_message!(ErrorKind::ResourceExhaustion, "the channel is full");
        }

        self.write_meta(entry_offset(self.nr_entries), wire_entries(entries).as_bytes());
        self.write_meta(COUNT_OFFSET, U32Le::new(nr_entries as u32).as_bytes());
        self.nr_entries = nr_entries;
        self.pages.extend_from_slice(mem.pages());
        self.page_count.store(self.pages.len(), Ordering::Relaxed);
        self.dynamic.push(mem);

        trace!(
            "channel {} grew by {} pages to {}",
            self.index,
            nr_new_pages,
            self.pages.len()
        );
        Ok(())
    }

    /// Appends `buf` to the channel.
    ///
    /// Once anything has been read, a write starts the channel over; the
    /// unread content is lost.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.reserve(buf.len())?;
        if self.read_offset != 0 {
            self.write_offset = 0;
            self.read_offset = 0;
        }
        write_pages(&*self.ctx.phys, &self.pages, self.write_offset, buf);
        self.write_offset += buf.len();
        self.sync_write_offset();
        Ok(())
    }

    /// Reads the next `buf.len()` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.read_offset.checked_add(buf.len()) {
            Some(end) if end <= self.write_offset => {}
            _ => return_errno_with_message!(ErrorKind::ProtocolFailure, "message too large"),
        }
        read_pages(&*self.ctx.phys, &self.pages, self.read_offset, buf);
        self.read_offset += buf.len();
        Ok(())
    }

    pub fn write_val<T: IntoBytes + Immutable>(&mut self, val: &T) -> Result<()> {
        self.write(val.as_bytes())
    }

    pub fn read_val<T: FromBytes + IntoBytes>(&mut self) -> Result<T> {
        let mut val = T::new_zeroed();
        self.read(val.as_mut_bytes())?;
        Ok(val)
    }

    fn reset(&mut self) {
        self.write_offset = 0;
        self.read_offset = 0;
        self.sync_write_offset();
    }

    /// Shrinks the channel back to its baseline.
    fn trim(&mut self) {
        if self.dynamic.is_empty() {
            return;
        }

        // The peer must stop seeing the pages before they go.
        self.write_meta(COUNT_OFFSET, U32Le::new(self.nr_baseline_entries as u32).as_bytes());
        self.nr_entries = self.nr_baseline_entries;
        self.pages.truncate(self.baseline.nr_pages());
        self.page_count.store(self.pages.len(), Ordering::Relaxed);
        if self.write_offset > self.pages.len() * PAGE_SIZE {
            self.write_offset = 0;
            self.read_offset = 0;
            self.sync_write_offset();
        }

        for mut mem in self.dynamic.drain(..) {
            if let Err(err) = mem.destroy() {
                warn!("channel {}: failed to free grown pages: {}", self.index, err);
            }
        }
    }

    fn sync_write_offset(&self) {
        self.write_meta(WRITE_OFFSET_OFFSET, U32Le::new(self.write_offset as u32).as_bytes());
    }

    fn write_meta(&self, offset: usize, bytes: &[u8]) {
        write_pages(&*self.ctx.phys, self.meta.pages(), offset, bytes);
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.index)
            .field("nr_pages", &self.pages.len())
            .field("write_offset", &self.write_offset)
            .field("read_offset", &self.read_offset)
            .finish_non_exhaustive()
    }
}

const WRITE_OFFSET_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;

const fn entry_offset(idx: usize) -> usize {
    size_of::<ChannelMeta>() + idx * ENTRY_SIZE
}
