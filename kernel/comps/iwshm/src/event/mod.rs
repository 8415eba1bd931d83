// SPDX-License-Identifier: MPL-2.0

//! Events between the normal world and the trusted peer.
//!
//! Two fixed-capacity bitmaps live in a region of inter-world memory shared
//! with the peer. The peer raises an event by setting its bit in the
//! normal-world-bound bitmap; the normal world signals the peer through the
//! peer-bound bitmap followed by an [`PeerCmd::EventNotify`] call.
//!
//! A single dispatcher drains the raised bits and runs the registered
//! handlers, then runs the deferred work that handlers submitted. Handlers
//! run with the handler table locked: they may unregister events (their own
//! included) but must not register new ones.

use core::sync::atomic::{AtomicBool, Ordering};

use bitvec::prelude::*;
use id_alloc::IdAlloc;

use crate::{
    channel::ChannelSet,
    invoke::{self, PeerCmd},
    mem::{IwMem, MemContext},
    platform::{PeerInvoke, Platform},
    prelude::*,
    sync::wait_until,
    work_queue::WorkQueue,
};

/// The id of an event.
pub type EventId = u32;

type EventHandler = Box<dyn Fn(EventId) + Send + Sync>;

struct Slot {
    handler: EventHandler,
    oneshot: bool,
}

/// Returns the byte size of one bitmap of `capacity` events.
pub(crate) const fn bitmap_bytes(capacity: usize) -> usize {
    capacity.div_ceil(u64::BITS as usize) * size_of::<u64>()
}

pub struct Events {
    platform: Arc<dyn Platform>,
    peer: Arc<dyn PeerInvoke>,
    deferred: Arc<WorkQueue>,
    capacity: usize,
    /// The normal-world-bound bitmap followed by the peer-bound one.
    bitmaps: IwMem,
    bitmap_lock: Mutex<()>,
    /// A hint that the normal-world-bound bitmap has bits set.
    raised: AtomicBool,
    ids: Mutex<IdAlloc>,
    slots: Mutex<BTreeMap<EventId, Slot>>,
    /// Unregistrations requested while the dispatcher runs handlers.
    ///
    /// The lock also orders the requests against the `dispatching` flag.
    pending_unregister: Mutex<Vec<EventId>>,
    dispatching: AtomicBool,
    initialized: AtomicBool,
    shutdown: AtomicBool,
}

impl Events {
    /// Allocates the bitmaps of `capacity` events each.
    pub fn new(
        ctx: &MemContext,
        platform: Arc<dyn Platform>,
        peer: Arc<dyn PeerInvoke>,
        deferred: Arc<WorkQueue>,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return_errno_with_message!(ErrorKind::InvalidArgument, "invalid event capacity");
        }
        let bitmaps = IwMem::create(ctx, 2 * bitmap_bytes(capacity))?;

        Ok(Self {
            platform,
            peer,
            deferred,
            capacity,
            bitmaps,
            bitmap_lock: Mutex::new(()),
            raised: AtomicBool::new(false),
            ids: Mutex::new(IdAlloc::with_capacity(capacity)),
            slots: Mutex::new(BTreeMap::new()),
            pending_unregister: Mutex::new(Vec::new()),
            dispatching: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Announces the bitmaps to the peer and starts accepting events.
    pub fn announce(&self, channels: &ChannelSet) -> Result<()> {
        let mut channel = channels.acquire();
        self.bitmaps.pack(&mut channel)?;
        invoke::call(
            &*self.peer,
            PeerCmd::EventsInit,
            [channel.index() as u64, self.capacity as u64, 0],
        )?;
        channel.release();

        self.initialized.store(true, Ordering::Release);
        debug!("events announced, capacity {}", self.capacity);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers `handler` and returns the id of its event.
    pub fn register<F>(&self, handler: F) -> Result<EventId>
    where
        F: Fn(EventId) + Send + Sync + 'static,
    {
        self.register_slot(Box::new(handler), false)
    }

    /// Registers `handler` for a single delivery.
    ///
    /// The event is unregistered once the handler has run.
    pub fn register_oneshot<F>(&self, handler: F) -> Result<EventId>
    where
        F: Fn(EventId) + Send + Sync + 'static,
    {
        self.register_slot(Box::new(handler), true)
    }

    fn register_slot(&self, handler: EventHandler, oneshot: bool) -> Result<EventId> {
        let mut slots = self.slots.lock();
        let Some(id) = self.ids.lock().alloc() else {
            return_errno_with_message!(ErrorKind::ResourceExhaustion, "no event id left");
        };
        let id = id as EventId;
        // A stale bit from a previous owner of the id must not fire.
        self.clear_bit(Direction::ToNormal, id);
        slots.insert(id, Slot { handler, oneshot });
        trace!("event {} registered, oneshot: {}", id, oneshot);
        Ok(id)
    }

    /// Unregisters the event `id`.
    ///
    /// Unregistering an unknown id does nothing. Called from a handler, the
    /// unregistration takes effect when the dispatcher is done with the
    /// handlers; the handler of `id` does not run again.
    pub fn unregister(&self, id: EventId) {
        let mut slots = {
            let mut pending = self.pending_unregister.lock();
            if self.dispatching.load(Ordering::Acquire) {
                pending.push(id);
                return;
            }
            drop(pending);
            self.slots.lock()
        };
        let retired = self.remove_slot(&mut slots, id);
        drop(slots);
        drop(retired);
    }

    fn remove_slot(
        &self,
        slots: &mut BTreeMap<EventId, Slot>,
        id: EventId,
    ) -> Option<Slot> {
        let slot = slots.remove(&id)?;
        self.ids.lock().free(id as usize);
        trace!("event {} unregistered", id);
        Some(slot)
    }

    /// Raises the normal-world-bound event `id`.
    ///
    /// This is the entry point of the peer's signal. Raising a pending
    /// event again does nothing.
    pub fn raise(&self, id: EventId) -> Result<()> {
        self.check_id(id)?;
        if self.set_bit(Direction::ToNormal, id) {
            self.raised.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Signals the peer-bound event `id`.
    ///
    /// The peer is only called if the event is not pending yet.
    pub fn notify_peer(&self, id: EventId) -> Result<()> {
        self.check_id(id)?;
        if !self.set_bit(Direction::ToPeer, id) {
            return Ok(());
        }
        if let Err(err) = invoke::call(&*self.peer, PeerCmd::EventNotify, [id as u64, 0, 0]) {
            self.clear_bit(Direction::ToPeer, id);
            return Err(err);
        }
        Ok(())
    }

    /// Returns whether raised events or deferred work are waiting.
    pub fn has_pending(&self) -> bool {
        (self.initialized.load(Ordering::Acquire) && self.raised.load(Ordering::Acquire))
            || self.deferred.has_pending_work_items()
    }

    /// Runs the handlers of the raised events, then the deferred work.
    ///
    /// Returns the number of handlers that ran.
    pub fn dispatch_pending(&self) -> usize {
        let fired = self.take_raised();
        let mut nr_handled = 0;
        let mut retired = Vec::new();

        if !fired.is_empty() {
            let mut slots = self.slots.lock();
            self.dispatching.store(true, Ordering::Release);

            let mut finished = Vec::new();
            for id in fired {
                if self.pending_unregister.lock().contains(&id) {
                    continue;
                }
                let Some(slot) = slots.get(&id) else {
                    warn!("event {} raised without a handler", id);
                    continue;
                };
                (slot.handler)(id);
                nr_handled += 1;
                if slot.oneshot {
                    finished.push(id);
                }
            }

            let unregistered = {
                let mut pending = self.pending_unregister.lock();
                self.dispatching.store(false, Ordering::Release);
                core::mem::take(&mut *pending)
            };
            for id in finished.into_iter().chain(unregistered) {
                retired.extend(self.remove_slot(&mut slots, id));
            }
        }

        // Handlers may hold the last reference to objects whose teardown
        // blocks. Drop them outside the table lock.
        drop(retired);
        self.deferred.run_pending();
        nr_handled
    }

    /// Dispatches events until [`Events::stop`] is called.
    pub fn run(&self) {
        loop {
            let stop = wait_until(&*self.platform, || {
                if self.shutdown.load(Ordering::Acquire) {
                    Some(true)
                } else {
                    self.has_pending().then_some(false)
                }
            });
            if stop {
                break;
            }
            self.dispatch_pending();
        }
        debug!("event dispatcher stopped");
    }

    /// Makes [`Events::run`] return.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns the number of registered events.
    pub fn nr_registered(&self) -> usize {
        self.slots.lock().len()
    }

    fn check_id(&self, id: EventId) -> Result<()> {
        if id as usize >= self.capacity {
            return_errno_with_message!(ErrorKind::InvalidArgument, "event id out of range");
        }
        Ok(())
    }

    /// Collects and clears the raised bits.
    fn take_raised(&self) -> Vec<EventId> {
        let _guard = self.bitmap_lock.lock();
        self.raised.store(false, Ordering::Release);

        let mut bytes = vec![0u8; bitmap_bytes(self.capacity)];
        if let Err(err) = self.bitmaps.read_bytes(0, &mut bytes) {
            warn!("failed to read the event bitmap: {}", err);
            return Vec::new();
        }
        let bits = bytes.view_bits::<Lsb0>();
        let fired: Vec<EventId> = bits[..self.capacity]
            .iter_ones()
            .map(|id| id as EventId)
            .collect();
        if !fired.is_empty() {
            let zeroes = vec![0u8; bytes.len()];
            // In range, as the read above succeeded.
            let _ = self.bitmaps.write_bytes(0, &zeroes);
        }
        fired
    }

    /// Sets the bit of `id`. Returns `false` if it was set already.
    fn set_bit(&self, dir: Direction, id: EventId) -> bool {
        self.update_bit(dir, id, true)
    }

    fn clear_bit(&self, dir: Direction, id: EventId) -> bool {
        self.update_bit(dir, id, false)
    }

    /// Returns whether the bit changed.
    fn update_bit(&self, dir: Direction, id: EventId, value: bool) -> bool {
        let _guard = self.bitmap_lock.lock();
        let offset = dir.base(self.capacity) + id as usize / 8;

        let mut byte = [0u8];
        if self.bitmaps.read_bytes(offset, &mut byte).is_err() {
            return false;
        }
        let bits = byte.view_bits_mut::<Lsb0>();
        let idx = id as usize % 8;
        if bits[idx] == value {
            return false;
        }
        bits.set(idx, value);
        self.bitmaps.write_bytes(offset, &byte).is_ok()
    }
}

impl Debug for Events {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Events")
            .field("capacity", &self.capacity)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Raised by the peer.
    ToNormal,
    /// Raised by the normal world.
    ToPeer,
}

impl Direction {
    fn base(self, capacity: usize) -> usize {
        match self {
            Direction::ToNormal => 0,
            Direction::ToPeer => bitmap_bytes(capacity),
        }
    }
}
