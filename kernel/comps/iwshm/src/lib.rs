// SPDX-License-Identifier: MPL-2.0

//! Inter-world shared memory for trusted-execution clients.
//!
//! This crate implements how a normal-world kernel describes memory to a
//! trusted peer (a secure monitor, or a trusted VM isolated by a
//! hypervisor) so that the peer may access it, along with the channels
//! that carry those descriptions and the events through which the peer
//! gives memory back.
//!
//! All state hangs off a [`TzDev`] instance. The collaborators of the
//! subsystem (physical memory, the call into the peer, the hypervisor's
//! resource manager, ...) are handed to [`TzDevOptions`] as trait objects,
//! see the [`platform`] module.
//!
//! # Examples
//!
//! ```ignore
//! let tzdev = TzDevOptions::new(platform, phys, peer)
//!     .config(IwConfig::from_cmdline(cmdline))
//!     .build()?;
//!
//! let id = tzdev.shmem().register(64 * 1024, ShmemFlags::WRITE | ShmemFlags::SYNC_RELEASE)?;
//! tzdev.shmem().write(id, 0, b"hello")?;
//! tzdev.shmem().release(id)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod hyp;
pub mod invoke;
pub mod mem;
pub mod platform;
mod prelude;
pub mod shmem;
pub mod sync;
pub mod work_queue;

#[cfg(test)]
mod mock;

pub use self::{
    config::{BackendKind, IwConfig},
    error::{Error, ErrorKind},
    shmem::{ShmemFlags, ShmemState},
};
use crate::{
    backend::{DirectBackend, HypBackend, MemBackend},
    channel::ChannelSet,
    event::Events,
    hyp::{HypAllocator, HypervisorRm},
    invoke::PeerCmd,
    mem::MemContext,
    platform::{PeerInvoke, PhysMem, Platform},
    prelude::*,
    shmem::ShmemRegistry,
    work_queue::WorkQueue,
};

/// The collaborators and configuration of a [`TzDev`].
pub struct TzDevOptions {
    config: IwConfig,
    platform: Arc<dyn Platform>,
    phys: Arc<dyn PhysMem>,
    peer: Arc<dyn PeerInvoke>,
    hyp: Option<Arc<dyn HypervisorRm>>,
}

impl TzDevOptions {
    pub fn new(
        platform: Arc<dyn Platform>,
        phys: Arc<dyn PhysMem>,
        peer: Arc<dyn PeerInvoke>,
    ) -> Self {
        Self {
            config: IwConfig::default(),
            platform,
            phys,
            peer,
            hyp: None,
        }
    }

    pub fn config(mut self, config: IwConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the resource manager used by [`BackendKind::Hypervisor`].
    pub fn hypervisor(mut self, hyp: Arc<dyn HypervisorRm>) -> Self {
        self.hyp = Some(hyp);
        self
    }

    pub fn build(self) -> Result<Arc<TzDev>> {
        TzDev::new(self)
    }
}

/// Statistics of a [`TzDev`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzStats {
    pub nr_registrations: usize,
    /// The data pages of all channels.
    pub nr_channel_pages: usize,
    /// Hypervisor batches shared or being released.
    pub nr_batches: usize,
    pub nr_events: usize,
}

/// An instance of the inter-world memory subsystem.
pub struct TzDev {
    config: IwConfig,
    peer: Arc<dyn PeerInvoke>,
    ctx: MemContext,
    hyp_allocator: Option<Arc<HypAllocator>>,
    deferred: Arc<WorkQueue>,
    shmem: Arc<ShmemRegistry>,
    channels: Arc<ChannelSet>,
    events: Arc<Events>,
}

impl TzDev {
    /// Starts the subsystem.
    ///
    /// The event bitmaps and the channels are set up and announced to the
    /// peer. The event dispatcher is not started; run [`TzDev::run_dispatcher`]
    /// on a dedicated thread.
    pub fn new(options: TzDevOptions) -> Result<Arc<Self>> {
        let TzDevOptions {
            config,
            platform,
            phys,
            peer,
            hyp,
        } = options;
        config.validate()?;

        let (backend, hyp_allocator): (Arc<dyn MemBackend>, _) = match config.backend {
            BackendKind::Direct => (Arc::new(DirectBackend), None),
            BackendKind::Hypervisor => {
                let Some(hyp) = hyp else {
                    return_errno_with_message!(
                        ErrorKind::InvalidArgument,
                        "the hypervisor backend needs a resource manager"
                    );
                };
                let allocator = HypAllocator::new(hyp, platform.clone(), &config)?;
                (
                    Arc::new(HypBackend::new(allocator.clone(), config.sort_pages)),
                    Some(allocator),
                )
            }
        };
        let ctx = MemContext { phys, backend };
        let deferred = Arc::new(WorkQueue::new());

        let events = Arc::new(Events::new(
            &ctx,
            platform.clone(),
            peer.clone(),
            deferred.clone(),
            config.event_capacity,
        )?);
        let channels = Arc::new(ChannelSet::new(&ctx, platform.clone(), &*peer, &config)?);
        events.announce(&channels)?;

        let shmem = ShmemRegistry::new(
            ctx.clone(),
            platform,
            peer.clone(),
            channels.clone(),
            events.clone(),
            deferred.clone(),
            config.shmem_capacity,
        );

        info!(
            "[tziw] started: {:?} backend, {} channels",
            config.backend,
            channels.nr_channels()
        );
        Ok(Arc::new(Self {
            config,
            peer,
            ctx,
            hyp_allocator,
            deferred,
            shmem,
            channels,
            events,
        }))
    }

    pub fn config(&self) -> &IwConfig {
        &self.config
    }

    pub fn mem_context(&self) -> &MemContext {
        &self.ctx
    }

    pub fn shmem(&self) -> &Arc<ShmemRegistry> {
        &self.shmem
    }

    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    /// Returns the batching allocator of the hypervisor backend.
    pub fn hyp_allocator(&self) -> Option<&Arc<HypAllocator>> {
        self.hyp_allocator.as_ref()
    }

    /// Issues the generic request `cmd` to the peer.
    pub fn call(&self, cmd: u32, args: [u64; 3]) -> Result<[u64; 3]> {
        if cmd < PeerCmd::GENERIC_BASE {
            return_errno_with_message!(ErrorKind::InvalidArgument, "reserved command number");
        }
        invoke::call_peer(&*self.peer, cmd, args)
    }

    /// Runs the event dispatcher until [`TzDev::shutdown`].
    pub fn run_dispatcher(&self) {
        self.events.run();
    }

    /// Runs the deferred work now. Returns the number of items that ran.
    pub fn flush_deferred(&self) -> usize {
        self.deferred.run_pending()
    }

    pub fn stats(&self) -> TzStats {
        TzStats {
            nr_registrations: self.shmem.nr_registrations(),
            nr_channel_pages: self.channels.nr_pages(),
            nr_batches: self
                .hyp_allocator
                .as_ref()
                .map_or(0, |allocator| allocator.nr_batches()),
            nr_events: self.events.nr_registered(),
        }
    }

    /// Stops the event dispatcher.
    ///
    /// The channels and the event bitmaps are torn down with the last
    /// reference to the instance.
    pub fn shutdown(&self) {
        self.events.stop();
        let nr_registrations = self.shmem.nr_registrations();
        if nr_registrations > 0 {
            warn!(
                "[tziw] shutting down with {} live registrations",
                nr_registrations
            );
        }
    }
}

impl Debug for TzDev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TzDev")
            .field("config", &self.config)
            .field("shmem", &self.shmem)
            .field("channels", &self.channels)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
