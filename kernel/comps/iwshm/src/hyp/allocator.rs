// SPDX-License-Identifier: MPL-2.0

use core::{
    mem::size_of,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use super::{
    HypError, HypervisorRm, MemHandle, MemNotifyKind, Perm, SgEntry, VmId, VmName, VmStatus,
    group_batches, scatter_list, split_chunks,
};
use crate::{config::IwConfig, platform::Platform, prelude::*, sync::Completion};

/// The state of a shared batch.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
pub enum BatchState {
    Init = 0,
    /// Shared with the peer VM, waiting for acceptance.
    Sharing = 1,
    /// Accepted by the peer VM.
    Accepted = 2,
    /// Given back by us, waiting for the peer's acknowledgement.
    Releasing = 3,
    Released = 4,
    /// A notification arrived in an unexpected state, or the peer VM is gone.
    Error = 5,
}

/// The bookkeeping of one batch.
struct BatchDesc {
    handle: MemHandle,
    state: AtomicU8,
    /// Set when the peer VM stopped while the batch was in flight.
    peer_lost: AtomicBool,
    sgl: Vec<SgEntry>,
    done: Completion,
}

impl BatchDesc {
    fn new(handle: MemHandle, sgl: Vec<SgEntry>) -> Self {
        Self {
            handle,
            state: AtomicU8::new(BatchState::Init as u8),
            peer_lost: AtomicBool::new(false),
            sgl,
            done: Completion::new(),
        }
    }

    fn state(&self) -> BatchState {
        // Only valid states are ever stored.
        BatchState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(BatchState::Error)
    }

    fn set_state(&self, state: BatchState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`. On a mismatch, records [`BatchState::Error`].
    fn transition(&self, from: BatchState, to: BatchState) -> core::result::Result<(), BatchState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                self.set_state(BatchState::Error);
                BatchState::try_from(actual).unwrap_or(BatchState::Error)
            })
    }

    fn failure(&self) -> Error {
        if self.peer_lost.load(Ordering::Acquire) {
            Error::with_message(ErrorKind::Irrecoverable, "the peer VM is gone")
        } else {
            Error::with_message(ErrorKind::ProtocolFailure, "unexpected batch notification")
        }
    }
}

type BatchTable = RwLock<BTreeMap<MemHandle, Arc<BatchDesc>>>;

/// Shares page lists with the peer VM, batch by batch.
///
/// A batch is tracked in exactly one of two tables: `sharing` from the
/// moment it is shared until it is given back, `releasing` until the peer
/// acknowledges the release.
pub struct HypAllocator {
    hyp: Arc<dyn HypervisorRm>,
    platform: Arc<dyn Platform>,
    self_vm: VmId,
    peer_vm: VmId,
    max_chunk_size: usize,
    max_batch_chunks: usize,
    max_batch_size: usize,
    accept_timeout: Duration,
    release_timeout: Duration,
    sharing: BatchTable,
    releasing: BatchTable,
}

impl HypAllocator {
    /// The maximum number of handles of one page list; they must fit in one
    /// handle-table page.
    pub const MAX_HANDLES: usize = PAGE_SIZE / size_of::<MemHandle>();

    pub fn new(
        hyp: Arc<dyn HypervisorRm>,
        platform: Arc<dyn Platform>,
        config: &IwConfig,
    ) -> Result<Arc<Self>> {
        let self_vm = hyp.vmid(VmName::Current)?;
        let peer_vm = hyp.vmid(VmName::Peer)?;
        debug!("hyp allocator: self vm {}, peer vm {}", self_vm, peer_vm);

        let allocator = Arc::new(Self {
            hyp,
            platform,
            self_vm,
            peer_vm,
            max_chunk_size: config.max_chunk_size,
            max_batch_chunks: config.max_batch_chunks,
            max_batch_size: config.max_batch_size,
            accept_timeout: config.accept_timeout,
            release_timeout: config.release_timeout,
            sharing: RwLock::new(BTreeMap::new()),
            releasing: RwLock::new(BTreeMap::new()),
        });
        allocator.hyp.register_notifier(Arc::downgrade(&allocator));
        Ok(allocator)
    }

    /// Shares `pages` with the peer VM and returns one handle per batch.
    ///
    /// If a batch fails, the batches shared so far are released again,
    /// unless the failure is irrecoverable.
    pub fn share(&self, pages: &[Paddr]) -> Result<Vec<MemHandle>> {
        if pages.is_empty() {
            return_errno_with_message!(ErrorKind::InvalidArgument, "nothing to share");
        }

        let chunks = split_chunks(pages, self.max_chunk_size);
        let batches = group_batches(&chunks, self.max_batch_chunks, self.max_batch_size);
        if batches.len() > Self::MAX_HANDLES {
            return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "the pages need more handles than fit in a page"
            );
        }

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let sgl = scatter_list(pages, &chunks[batch]);
            match self.share_batch(sgl) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    if err.is_irrecoverable() {
                        error!("sharing failed irrecoverably, {} batches left", handles.len());
                        return Err(err);
                    }
                    if let Err(rollback_err) = self.release(&handles) {
                        warn!("failed to roll back shared batches: {}", rollback_err);
                        if rollback_err.is_irrecoverable() {
                            return Err(rollback_err);
                        }
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            "shared {} pages in {} batches: {:?}",
            pages.len(),
            handles.len(),
            handles
        );
        Ok(handles)
    }

    /// Releases the batches behind `handles`, stopping at the first failure.
    pub fn release(&self, handles: &[MemHandle]) -> Result<()> {
        for &handle in handles {
            self.release_batch(handle)?;
        }
        Ok(())
    }

    fn share_batch(&self, sgl: Vec<SgEntry>) -> Result<MemHandle> {
        let acl = [(self.self_vm, Perm::RW), (self.peer_vm, Perm::RW)];
        self.hyp.assign(&sgl, &[self.self_vm], &acl)?;

        let handle = match self.hyp.mem_share(&sgl, &acl) {
            Ok(handle) => handle,
            Err(err) => {
                self.unassign(&sgl)?;
                return Err(err.into());
            }
        };

        let desc = Arc::new(BatchDesc::new(handle, sgl));
        desc.set_state(BatchState::Sharing);
        self.sharing.write().insert(handle, desc.clone());

        if let Err(err) = self.hyp.mem_notify(handle, MemNotifyKind::Shared, self.peer_vm) {
            self.sharing.write().remove(&handle);
            if err != HypError::Unavailable {
                self.reclaim_and_unassign(&desc)?;
            }
            return Err(err.into());
        }

        if let Err(err) = desc.done.wait_timeout(&*self.platform, self.accept_timeout) {
            // A timeout is terminal for the handle. The parcel stays with the
            // hypervisor for the caller to reconcile.
            desc.set_state(BatchState::Error);
            self.sharing.write().remove(&handle);
            warn!("batch {} was not accepted in time", handle);
            return Err(err);
        }

        match desc.state() {
            BatchState::Accepted => Ok(handle),
            state => {
                warn!("batch {} ended in state {:?} while sharing", handle, state);
                self.sharing.write().remove(&handle);
                let err = desc.failure();
                if !err.is_irrecoverable() {
                    self.reclaim_and_unassign(&desc)?;
                }
                Err(err)
            }
        }
    }

    /// Gives the batch `handle` back and waits for the peer's acknowledgement.
    pub fn release_batch(&self, handle: MemHandle) -> Result<()> {
        let desc = {
            let mut sharing = self.sharing.write();
            let Some(desc) = sharing.remove(&handle) else {
                return_errno_with_message!(ErrorKind::InvalidArgument, "unknown batch handle");
            };
            if desc.transition(BatchState::Accepted, BatchState::Releasing).is_err() {
                sharing.insert(handle, desc);
                return_errno_with_message!(ErrorKind::InvalidArgument, "the batch is not accepted");
            }
            desc
        };
        desc.done.reinit();
        self.releasing.write().insert(handle, desc.clone());

        if let Err(err) = self.hyp.mem_notify(handle, MemNotifyKind::Released, self.peer_vm) {
            self.releasing.write().remove(&handle);
            if err != HypError::Unavailable {
                desc.set_state(BatchState::Accepted);
                self.sharing.write().insert(handle, desc);
            }
            return Err(err.into());
        }

        if let Err(err) = desc.done.wait_timeout(&*self.platform, self.release_timeout) {
            desc.set_state(BatchState::Error);
            self.releasing.write().remove(&handle);
            warn!("release of batch {} was not acknowledged in time", handle);
            return Err(err);
        }

        self.releasing.write().remove(&handle);
        if desc.state() != BatchState::Released {
            error!("batch {} ended in state {:?} while releasing", handle, desc.state());
            return_errno_with_message!(
                ErrorKind::Irrecoverable,
                "the peer did not give the batch back"
            );
        }

        self.reclaim_and_unassign(&desc)?;
        debug!("released batch {}", handle);
        Ok(())
    }

    /// Handles the peer's acceptance of a batch.
    pub fn on_mem_accepted(&self, handle: MemHandle) {
        self.complete_transition(
            &self.sharing,
            handle,
            BatchState::Sharing,
            BatchState::Accepted,
        );
    }

    /// Handles the peer's acknowledgement of a released batch.
    pub fn on_mem_released(&self, handle: MemHandle) {
        self.complete_transition(
            &self.releasing,
            handle,
            BatchState::Releasing,
            BatchState::Released,
        );
    }

    /// Handles a state change of a VM.
    ///
    /// If the peer VM stops, every handshake in flight fails instead of
    /// waiting for its timeout.
    pub fn on_vm_status(&self, vm: VmId, status: VmStatus) {
        if vm != self.peer_vm || status == VmStatus::Running {
            return;
        }
        error!("peer vm {} is {:?}, failing batches in flight", vm, status);

        for table in [&self.sharing, &self.releasing] {
            for desc in table.read().values() {
                desc.peer_lost.store(true, Ordering::Release);
                desc.set_state(BatchState::Error);
                desc.done.complete();
            }
        }
    }

    /// Returns the state of the batch `handle`, if it is tracked.
    pub fn batch_state(&self, handle: MemHandle) -> Option<BatchState> {
        let sharing = self.sharing.read().get(&handle).map(|desc| desc.state());
        sharing.or_else(|| self.releasing.read().get(&handle).map(|desc| desc.state()))
    }

    /// Returns the number of batches currently tracked.
    pub fn nr_batches(&self) -> usize {
        self.sharing.read().len() + self.releasing.read().len()
    }

    fn complete_transition(
        &self,
        table: &BatchTable,
        handle: MemHandle,
        from: BatchState,
        to: BatchState,
    ) {
        let Some(desc) = table.read().get(&handle).cloned() else {
            warn!("notification for unknown batch {}", handle);
            return;
        };
        if let Err(actual) = desc.transition(from, to) {
            warn!(
                "batch {} notified in state {:?}, expected {:?}",
                desc.handle, actual, from
            );
        }
        desc.done.complete();
    }

    fn reclaim_and_unassign(&self, desc: &BatchDesc) -> Result<()> {
        if let Err(err) = self.hyp.mem_reclaim(desc.handle) {
            error!("failed to reclaim batch {}: {:?}", desc.handle, err);
            return_errno_with_message!(ErrorKind::Irrecoverable, "the batch cannot be reclaimed");
        }
        self.unassign(&desc.sgl)
    }

    fn unassign(&self, sgl: &[SgEntry]) -> Result<()> {
        let src = [self.self_vm, self.peer_vm];
        if let Err(err) = self.hyp.assign(sgl, &src, &[(self.self_vm, Perm::RWX)]) {
            error!("failed to take pages back from the peer vm: {:?}", err);
            return_errno_with_message!(ErrorKind::Irrecoverable, "the pages cannot be reassigned");
        }
        Ok(())
    }
}

impl Debug for HypAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HypAllocator")
            .field("self_vm", &self.self_vm)
            .field("peer_vm", &self.peer_vm)
            .field("sharing", &self.sharing.read().len())
            .field("releasing", &self.releasing.read().len())
            .finish_non_exhaustive()
    }
}
