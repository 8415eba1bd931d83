// SPDX-License-Identifier: MPL-2.0

//! Shared-memory registrations.
//!
//! A registration wraps an [`IwMem`] that the trusted peer may access. It
//! carries the credential of its creator and is known to the peer by a small
//! positive id.
//!
//! # Lifecycle
//!
//! ```text
//!   register        peer accepts        release event
//! ----------> CREATED ----------> PUBLISHED ----------> RELEASED
//! ```
//!
//! The state only advances. A registration is reference counted: the id
//! table and the armed release-event handler each hold a reference, as does
//! every lookup in progress. The memory is torn down when the last
//! reference goes, which can only happen once the registration failed to
//! publish or reached `RELEASED`.
//!
//! The release event is delivered on the dispatcher. Its handler advances
//! the state and wakes synchronous releasers; dropping the table reference
//! is deferred until the dispatcher is done with the handlers.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use id_alloc::IdAlloc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    backend::U32Le,
    channel::ChannelSet,
    event::{EventId, Events},
    invoke::{self, PeerCmd},
    mem::{IwMem, MemContext, UserRegion},
    platform::{Credential, PeerInvoke, Platform, UserSpace},
    prelude::*,
    sync::wait_until,
    work_queue::WorkQueue,
};

bitflags! {
    /// The options of a registration.
    pub struct ShmemFlags: u32 {
        /// The peer may write the memory.
        const WRITE        = 1 << 0;
        /// `release` waits until the peer has given the memory back.
        const SYNC_RELEASE = 1 << 1;
    }
}

/// The state of a registration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromInt)]
pub enum ShmemState {
    Created = 0,
    Published = 1,
    Released = 2,
}

/// The header preceding the descriptor in a registration request.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ShmemRegisterHeader {
    pub id: U32Le,
    pub flags: U32Le,
    pub release_event: U32Le,
    pub pid: U32Le,
    pub uid: U32Le,
    pub hash: [u8; 32],
}

/// A shared-memory registration.
pub struct Shmem {
    id: u32,
    state: AtomicU8,
    flags: ShmemFlags,
    credential: Credential,
    mem: IwMem,
    release_event: Once<EventId>,
    release_requested: AtomicBool,
    /// The release event fired before the registration was published.
    early_release: AtomicBool,
}

impl Shmem {
    fn new(id: u32, flags: ShmemFlags, credential: Credential, mem: IwMem) -> Self {
        Self {
            id,
            state: AtomicU8::new(ShmemState::Created as u8),
            flags,
            credential,
            mem,
            release_event: Once::new(),
            release_requested: AtomicBool::new(false),
            early_release: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> ShmemFlags {
        self.flags
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn mem(&self) -> &IwMem {
        &self.mem
    }

    pub fn state(&self) -> ShmemState {
        ShmemState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(ShmemState::Released)
    }

    pub fn release_event(&self) -> Option<EventId> {
        self.release_event.get().copied()
    }

    /// Advances the state from `from` to `to`. Only one caller wins.
    fn advance(&self, from: ShmemState, to: ShmemState) -> bool {
        debug_assert!(from < to);
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Handles the release event. Returns whether this call released it.
    fn on_release_event(&self) -> bool {
        if self.advance(ShmemState::Published, ShmemState::Released) {
            return true;
        }
        if self.state() == ShmemState::Created {
            // The publisher has not seen the peer's answer yet; it finishes
            // the release once it has.
            self.early_release.store(true, Ordering::Release);
            return self.advance(ShmemState::Published, ShmemState::Released);
        }
        false
    }
}

impl Debug for Shmem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shmem")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.flags)
            .field("mem", &self.mem)
            .finish_non_exhaustive()
    }
}

impl Drop for Shmem {
    fn drop(&mut self) {
        debug!("shmem {} destroyed in state {:?}", self.id, self.state());
    }
}

/// The live registrations.
pub struct ShmemRegistry {
    ctx: MemContext,
    platform: Arc<dyn Platform>,
    peer: Arc<dyn PeerInvoke>,
    channels: Arc<ChannelSet>,
    events: Arc<Events>,
    deferred: Arc<WorkQueue>,
    ids: Mutex<IdAlloc>,
    table: RwLock<BTreeMap<u32, Arc<Shmem>>>,
    weak_self: Weak<ShmemRegistry>,
}

impl ShmemRegistry {
    pub fn new(
        ctx: MemContext,
        platform: Arc<dyn Platform>,
        peer: Arc<dyn PeerInvoke>,
        channels: Arc<ChannelSet>,
        events: Arc<Events>,
        deferred: Arc<WorkQueue>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ctx,
            platform,
            peer,
            channels,
            events,
            deferred,
            ids: Mutex::new(IdAlloc::with_capacity(capacity)),
            table: RwLock::new(BTreeMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers `size` bytes of fresh memory, mapped in the kernel.
    pub fn register(&self, size: usize, flags: ShmemFlags) -> Result<u32> {
        let mem = IwMem::create(&self.ctx, size)?;
        mem.map()?;
        self.publish(mem, flags)
    }

    /// Registers `size` bytes of fresh memory without a kernel mapping.
    pub fn register_unmapped(&self, size: usize, flags: ShmemFlags) -> Result<u32> {
        let mem = IwMem::create(&self.ctx, size)?;
        self.publish(mem, flags)
    }

    /// Registers the existing kernel buffer of `size` bytes at `vaddr`.
    pub fn register_existing(&self, vaddr: Vaddr, size: usize, flags: ShmemFlags) -> Result<u32> {
        let mem = IwMem::create_over_existing(&self.ctx, vaddr, size)?;
        self.publish(mem, flags)
    }

    /// Registers the user buffer of `size` bytes at `vaddr` in `space`.
    pub fn register_user(
        &self,
        space: Arc<dyn UserSpace>,
        vaddr: Vaddr,
        size: usize,
        flags: ShmemFlags,
    ) -> Result<u32> {
        let writable = flags.contains(ShmemFlags::WRITE);
        let mem = IwMem::create_from_user(&self.ctx, space, vaddr, size, writable)?;
        self.publish(mem, flags)
    }

    fn publish(&self, mem: IwMem, flags: ShmemFlags) -> Result<u32> {
        let Some(slot) = self.ids.lock().alloc() else {
            return_errno_with_message!(ErrorKind::ResourceExhaustion, "no shmem id left");
        };
        let id = slot as u32 + 1;
        let shmem = Arc::new(Shmem::new(id, flags, self.platform.credential(), mem));
        self.table.write().insert(id, shmem.clone());

        let event = match self.arm_release_event(&shmem) {
            Ok(event) => event,
            Err(err) => {
                self.unpublish(id, None);
                return Err(err);
            }
        };
        shmem.release_event.call_once(|| event);

        if let Err(err) = self.send_registration(&shmem, event) {
            self.unpublish(id, Some(event));
            return Err(err);
        }

        shmem.advance(ShmemState::Created, ShmemState::Published);
        if shmem.early_release.load(Ordering::Acquire)
            && shmem.advance(ShmemState::Published, ShmemState::Released)
        {
            self.retire_later(id);
        }
        debug!("shmem {} published, {} pages", id, shmem.mem.nr_pages());
        Ok(id)
    }

    fn arm_release_event(&self, shmem: &Arc<Shmem>) -> Result<EventId> {
        let registry = self.weak_self.clone();
        let shmem = shmem.clone();
        self.events.register_oneshot(move |_| {
            if shmem.on_release_event() {
                debug!("shmem {} released by the peer", shmem.id);
                if let Some(registry) = registry.upgrade() {
                    registry.retire_later(shmem.id);
                }
            }
        })
    }

    fn send_registration(&self, shmem: &Shmem, event: EventId) -> Result<()> {
        let header = ShmemRegisterHeader {
            id: U32Le::new(shmem.id),
            flags: U32Le::new(shmem.flags.bits()),
            release_event: U32Le::new(event),
            pid: U32Le::new(shmem.credential.pid),
            uid: U32Le::new(shmem.credential.uid),
            hash: shmem.credential.hash,
        };

        let mut channel = self.channels.acquire();
        channel.write_val(&header)?;
        shmem.mem.pack(&mut channel)?;
        invoke::call(
            &*self.peer,
            PeerCmd::ShmemRegister,
            [channel.index() as u64, 0, 0],
        )?;
        channel.release();
        Ok(())
    }

    /// Undoes a failed publication.
    fn unpublish(&self, id: u32, event: Option<EventId>) {
        if let Some(event) = event {
            self.events.unregister(event);
        }
        let removed = self.table.write().remove(&id);
        self.ids.lock().free(id as usize - 1);
        drop(removed);
    }

    /// Queues the removal of a released registration.
    ///
    /// The one-shot release event is already disarmed by then.
    fn retire_later(&self, id: u32) {
        let registry = self.weak_self.clone();
        self.deferred.submit_work_func(move || {
            if let Some(registry) = registry.upgrade() {
                registry.retire(id);
            }
        });
    }

    fn retire(&self, id: u32) {
        let removed = self.table.write().remove(&id);
        if removed.is_some() {
            self.ids.lock().free(id as usize - 1);
            trace!("shmem {} retired", id);
        }
        // The memory goes here unless a lookup is still in progress.
        drop(removed);
    }

    /// Looks up the registration `id`.
    pub fn get(&self, id: u32) -> Result<Arc<Shmem>> {
        self.table
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::with_message(ErrorKind::InvalidArgument, "unknown shmem id"))
    }

    /// Asks the peer to give the registration `id` back.
    ///
    /// With [`ShmemFlags::SYNC_RELEASE`], waits until the peer has done so.
    pub fn release(&self, id: u32) -> Result<()> {
        let shmem = self.get(id)?;
        match shmem.state() {
            ShmemState::Created => {
                return_errno_with_message!(ErrorKind::InvalidArgument, "shmem is not published")
            }
            // The peer gave it back first; only the retirement is pending.
            ShmemState::Released => return Ok(()),
            ShmemState::Published => {}
        }

        if !shmem.release_requested.swap(true, Ordering::AcqRel) {
            if let Err(err) = invoke::call(&*self.peer, PeerCmd::ShmemRelease, [id as u64, 0, 0])
            {
                shmem.release_requested.store(false, Ordering::Release);
                return Err(err);
            }
        }

        if shmem.flags.contains(ShmemFlags::SYNC_RELEASE) {
            wait_until(&*self.platform, || {
                (shmem.state() == ShmemState::Released).then_some(())
            });
        }
        Ok(())
    }

    /// Maps `region` of the registration `id` into `space`.
    pub fn map_into_user(&self, id: u32, space: &dyn UserSpace, region: &UserRegion) -> Result<()> {
        let shmem = self.get(id)?;
        if region.writable && !shmem.flags.contains(ShmemFlags::WRITE) {
            return_errno_with_message!(ErrorKind::InvalidArgument, "shmem is read-only");
        }
        shmem.mem.map_into_user(space, region)
    }

    /// Reads the registration `id` at `offset`.
    pub fn read(&self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.get(id)?.mem.read_bytes(offset, buf)
    }

    /// Writes the registration `id` at `offset`.
    pub fn write(&self, id: u32, offset: usize, buf: &[u8]) -> Result<()> {
        self.get(id)?.mem.write_bytes(offset, buf)
    }

    /// Returns the kernel address of the registration `id`, if it is mapped.
    pub fn kernel_vaddr(&self, id: u32) -> Result<Vaddr> {
        self.get(id)?.mem.local_mapping().ok_or(Error::with_message(
            ErrorKind::InvalidArgument,
            "shmem is not mapped in the kernel",
        ))
    }

    pub fn state(&self, id: u32) -> Result<ShmemState> {
        Ok(self.get(id)?.state())
    }

    /// Returns the number of live registrations.
    pub fn nr_registrations(&self) -> usize {
        self.table.read().len()
    }

    /// Returns the ids of the live registrations.
    pub fn ids(&self) -> Vec<u32> {
        self.table.read().keys().copied().collect()
    }
}

impl Debug for ShmemRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmemRegistry")
            .field("nr_registrations", &self.nr_registrations())
            .finish_non_exhaustive()
    }
}
