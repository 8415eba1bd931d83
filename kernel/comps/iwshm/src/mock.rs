// SPDX-License-Identifier: MPL-2.0

//! In-process stand-ins for the collaborators of the subsystem.
//!
//! The mock peer decodes channels and descriptors from the mock physical
//! memory the same way the trusted peer does, so tests observe the wire
//! format rather than internal state.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Instant,
};

use zerocopy::FromBytes;

use crate::{
    TzDev, TzDevOptions,
    backend::{DirectBackend, HypBackend, MemBackend},
    config::{BackendKind, IwConfig},
    event::Events,
    hyp::{
        HypAllocator, HypError, HypervisorRm, MemHandle, MemNotifyKind, Perm, SgEntry, VmId,
        VmName, VmStatus,
    },
    invoke::PeerCmd,
    mem::MemContext,
    platform::{
        Credential, CpuId, PeerInvoke, PeerRegs, PhysMem, Platform, UserSpace, paddr_to_pfn,
    },
    prelude::*,
    shmem::ShmemRegisterHeader,
};

pub struct MockPlatform {
    nr_cpus: usize,
    cpu: AtomicUsize,
    epoch: Instant,
}

impl MockPlatform {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            cpu: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    /// Makes every caller appear to run on `cpu`.
    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }
}

pub const MOCK_CREDENTIAL: Credential = Credential {
    pid: 42,
    uid: 1000,
    hash: [0xab; 32],
};

impl Platform for MockPlatform {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn current_cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Relaxed)
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn yield_now(&self) {
        thread::yield_now();
    }

    fn credential(&self) -> Credential {
        MOCK_CREDENTIAL
    }
}

/// The order in which the mock hands out physical pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocLayout {
    Ascending,
    /// Every other page, so that no two pages are contiguous.
    Scattered,
    Descending,
}

const MOCK_VADDR_BASE: Vaddr = 0xffff_8000_0000_0000;

struct PhysInner {
    pages: BTreeMap<Paddr, Box<[u8; PAGE_SIZE]>>,
    next_paddr: Paddr,
    layout: AllocLayout,
    nr_allocs: usize,
    nr_frees: usize,
    nr_double_frees: usize,
    allocs_left: Option<usize>,
    mappings: BTreeMap<Vaddr, Vec<Paddr>>,
    next_vaddr: Vaddr,
}

pub struct MockPhysMem {
    inner: Mutex<PhysInner>,
}

impl MockPhysMem {
    pub fn new(layout: AllocLayout) -> Self {
        let next_paddr = match layout {
            AllocLayout::Descending => 0x4000_0000,
            _ => 0x10_0000,
        };
        Self {
            inner: Mutex::new(PhysInner {
                pages: BTreeMap::new(),
                next_paddr,
                layout,
                nr_allocs: 0,
                nr_frees: 0,
                nr_double_frees: 0,
                allocs_left: None,
                mappings: BTreeMap::new(),
                next_vaddr: MOCK_VADDR_BASE,
            }),
        }
    }

    /// Lets `nr` more allocations succeed, then fails every allocation.
    pub fn fail_allocs_after(&self, nr: usize) {
        self.inner.lock().allocs_left = Some(nr);
    }

    pub fn clear_alloc_failure(&self) {
        self.inner.lock().allocs_left = None;
    }

    pub fn nr_allocs(&self) -> usize {
        self.inner.lock().nr_allocs
    }

    pub fn nr_frees(&self) -> usize {
        self.inner.lock().nr_frees
    }

    pub fn nr_double_frees(&self) -> usize {
        self.inner.lock().nr_double_frees
    }

    pub fn nr_live_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn is_live(&self, paddr: Paddr) -> bool {
        self.inner.lock().pages.contains_key(&paddr)
    }

    pub fn nr_mappings(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Allocates and maps `nr_pages` pages, as a kernel buffer owned by
    /// someone else.
    pub fn foreign_buffer(&self, nr_pages: usize) -> Vaddr {
        let pages: Vec<Paddr> = (0..nr_pages)
            .map(|_| self.alloc_page().unwrap())
            .collect();
        self.vmap(&pages).unwrap()
    }

    /// Reads bytes spanning several pages of a page list.
    pub fn read_pages(&self, pages: &[Paddr], offset: usize, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let in_page = pos % PAGE_SIZE;
            let len = (PAGE_SIZE - in_page).min(buf.len() - done);
            self.read(pages[pos / PAGE_SIZE], in_page, &mut buf[done..done + len]);
            done += len;
        }
    }

    pub fn read_u32(&self, pages: &[Paddr], offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_pages(pages, offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }
}

impl PhysMem for MockPhysMem {
    fn alloc_page(&self) -> Result<Paddr> {
        let mut inner = self.inner.lock();
        if let Some(left) = inner.allocs_left.as_mut() {
            if *left == 0 {
                return_errno_with_message!(ErrorKind::ResourceExhaustion, "mock allocation failure");
            }
            *left -= 1;
        }
        let paddr = inner.next_paddr;
        inner.next_paddr = match inner.layout {
            AllocLayout::Ascending => paddr + PAGE_SIZE,
            AllocLayout::Scattered => paddr + 2 * PAGE_SIZE,
            AllocLayout::Descending => paddr - PAGE_SIZE,
        };
        inner.pages.insert(paddr, Box::new([0; PAGE_SIZE]));
        inner.nr_allocs += 1;
        Ok(paddr)
    }

    fn free_page(&self, paddr: Paddr) {
        let mut inner = self.inner.lock();
        if inner.pages.remove(&paddr).is_some() {
            inner.nr_frees += 1;
        } else {
            inner.nr_double_frees += 1;
        }
    }

    fn read(&self, paddr: Paddr, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        let page = inner
            .pages
            .get(&paddr)
            .unwrap_or_else(|| panic!("read of free page {:#x}", paddr));
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    fn write(&self, paddr: Paddr, offset: usize, buf: &[u8]) {
        let mut inner = self.inner.lock();
        let page = inner
            .pages
            .get_mut(&paddr)
            .unwrap_or_else(|| panic!("write to free page {:#x}", paddr));
        page[offset..offset + buf.len()].copy_from_slice(buf);
    }

    fn resolve(&self, vaddr: Vaddr) -> Option<Paddr> {
        let inner = self.inner.lock();
        let (base, pages) = inner.mappings.range(..=vaddr).next_back()?;
        pages.get((vaddr - base) / PAGE_SIZE).copied()
    }

    fn vmap(&self, pages: &[Paddr]) -> Result<Vaddr> {
        let mut inner = self.inner.lock();
        let vaddr = inner.next_vaddr;
        inner.next_vaddr += (pages.len() + 1) * PAGE_SIZE;
        inner.mappings.insert(vaddr, pages.to_vec());
        Ok(vaddr)
    }

    fn vunmap(&self, vaddr: Vaddr, nr_pages: usize) {
        let removed = self.inner.lock().mappings.remove(&vaddr);
        assert_eq!(removed.map(|pages| pages.len()), Some(nr_pages));
    }
}

#[derive(Debug, Default)]
struct HypInner {
    parcels: BTreeMap<MemHandle, Vec<SgEntry>>,
    next_handle: MemHandle,
    shared_pages: BTreeSet<Paddr>,
    nr_shares: usize,
    nr_reclaims: usize,
    shares_left: Option<(usize, HypError)>,
    release_fails_left: Option<usize>,
}

pub struct MockHyp {
    inner: Mutex<HypInner>,
    notifier: Mutex<Weak<HypAllocator>>,
    unavailable: AtomicBool,
    silent: AtomicBool,
}

pub const MOCK_SELF_VM: VmId = 3;
pub const MOCK_PEER_VM: VmId = 45;

impl MockHyp {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HypInner {
                next_handle: 0x1000,
                ..Default::default()
            }),
            notifier: Mutex::new(Weak::new()),
            unavailable: AtomicBool::new(false),
            silent: AtomicBool::new(false),
        }
    }

    /// Makes every call fail as if the memory was revoked.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Stops answering notifications.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Lets `nr` more shares succeed, then fails every share with `err`.
    pub fn fail_shares_after(&self, nr: usize, err: HypError) {
        self.inner.lock().shares_left = Some((nr, err));
    }

    /// Makes the batch release after the next `nr` ones revoke the memory.
    pub fn revoke_release_after(&self, nr: usize) {
        self.inner.lock().release_fails_left = Some(nr);
    }

    pub fn nr_shares(&self) -> usize {
        self.inner.lock().nr_shares
    }

    pub fn nr_reclaims(&self) -> usize {
        self.inner.lock().nr_reclaims
    }

    pub fn nr_parcels(&self) -> usize {
        self.inner.lock().parcels.len()
    }

    pub fn nr_shared_pages(&self) -> usize {
        self.inner.lock().shared_pages.len()
    }

    /// Returns the pages behind `handle`, in order.
    pub fn pages_of(&self, handle: MemHandle) -> Option<Vec<Paddr>> {
        let inner = self.inner.lock();
        let sgl = inner.parcels.get(&handle)?;
        Some(
            sgl.iter()
                .flat_map(|entry| (0..entry.size / PAGE_SIZE).map(|i| entry.paddr + i * PAGE_SIZE))
                .collect(),
        )
    }

    pub fn sgl_of(&self, handle: MemHandle) -> Option<Vec<SgEntry>> {
        self.inner.lock().parcels.get(&handle).cloned()
    }

    pub fn report_vm_status(&self, status: VmStatus) {
        if let Some(allocator) = self.notifier.lock().upgrade() {
            allocator.on_vm_status(MOCK_PEER_VM, status);
        }
    }

    fn check_available(&self) -> core::result::Result<(), HypError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(HypError::Unavailable);
        }
        Ok(())
    }
}

fn sgl_pages(sgl: &[SgEntry]) -> impl Iterator<Item = Paddr> + '_ {
    sgl.iter()
        .flat_map(|entry| (0..entry.size / PAGE_SIZE).map(move |i| entry.paddr + i * PAGE_SIZE))
}

impl HypervisorRm for MockHyp {
    fn register_notifier(&self, allocator: Weak<HypAllocator>) {
        *self.notifier.lock() = allocator;
    }

    fn vmid(&self, vm: VmName) -> core::result::Result<VmId, HypError> {
        Ok(match vm {
            VmName::Current => MOCK_SELF_VM,
            VmName::Peer => MOCK_PEER_VM,
        })
    }

    fn assign(
        &self,
        sgl: &[SgEntry],
        src: &[VmId],
        dst: &[(VmId, Perm)],
    ) -> core::result::Result<(), HypError> {
        self.check_available()?;
        assert!(src.contains(&MOCK_SELF_VM));
        let to_peer = dst.iter().any(|(vm, _)| *vm == MOCK_PEER_VM);
        let mut inner = self.inner.lock();
        for paddr in sgl_pages(sgl) {
            if to_peer {
                inner.shared_pages.insert(paddr);
            } else {
                inner.shared_pages.remove(&paddr);
            }
        }
        Ok(())
    }

    fn mem_share(
        &self,
        sgl: &[SgEntry],
        _acl: &[(VmId, Perm)],
    ) -> core::result::Result<MemHandle, HypError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if let Some((left, err)) = inner.shares_left.as_mut() {
            if *left == 0 {
                return Err(*err);
            }
            *left -= 1;
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.parcels.insert(handle, sgl.to_vec());
        inner.nr_shares += 1;
        Ok(handle)
    }

    fn mem_notify(
        &self,
        handle: MemHandle,
        kind: MemNotifyKind,
        target: VmId,
    ) -> core::result::Result<(), HypError> {
        self.check_available()?;
        assert_eq!(target, MOCK_PEER_VM);
        if kind == MemNotifyKind::Released {
            let mut inner = self.inner.lock();
            if let Some(left) = inner.release_fails_left.as_mut() {
                if *left == 0 {
                    inner.release_fails_left = None;
                    drop(inner);
                    self.set_unavailable(true);
                    return Err(HypError::Unavailable);
                }
                *left -= 1;
            }
        }
        if self.silent.load(Ordering::Relaxed) {
            return Ok(());
        }
        let Some(allocator) = self.notifier.lock().upgrade() else {
            return Ok(());
        };
        match kind {
            MemNotifyKind::Shared => allocator.on_mem_accepted(handle),
            MemNotifyKind::Released => allocator.on_mem_released(handle),
        }
        Ok(())
    }

    fn mem_reclaim(&self, handle: MemHandle) -> core::result::Result<(), HypError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.parcels.remove(&handle).ok_or(HypError::InvalidArgs)?;
        inner.nr_reclaims += 1;
        Ok(())
    }
}

/// A registration as seen by the mock peer.
#[derive(Debug, Clone)]
pub struct PeerShmem {
    pub header: ShmemRegisterHeader,
    /// The descriptor entries, as packed.
    pub entries: Vec<u32>,
    /// The pages the entries resolve to.
    pub pages: Vec<Paddr>,
}

#[derive(Default)]
struct PeerInner {
    /// The metadata pages of the channels, per channel.
    channels: Vec<Vec<Paddr>>,
    event_pages: Vec<Paddr>,
    event_capacity: usize,
    registrations: BTreeMap<u32, PeerShmem>,
    released: Vec<u32>,
    notified: Vec<u32>,
    generic: Vec<PeerRegs>,
    fail_cmd: Option<(u32, i32)>,
}

/// The trusted peer.
pub struct MockPeer {
    backend: BackendKind,
    phys: Arc<MockPhysMem>,
    hyp: Option<Arc<MockHyp>>,
    events: Mutex<Weak<Events>>,
    auto_release: AtomicBool,
    inner: Mutex<PeerInner>,
}

impl MockPeer {
    pub fn new(phys: Arc<MockPhysMem>, hyp: Option<Arc<MockHyp>>) -> Self {
        let backend = if hyp.is_some() {
            BackendKind::Hypervisor
        } else {
            BackendKind::Direct
        };
        Self {
            backend,
            phys,
            hyp,
            events: Mutex::new(Weak::new()),
            auto_release: AtomicBool::new(true),
            inner: Mutex::new(PeerInner::default()),
        }
    }

    /// Connects the peer to the event subsystem it raises events on.
    pub fn connect_events(&self, events: &Arc<Events>) {
        *self.events.lock() = Arc::downgrade(events);
    }

    /// Whether a release request is answered by raising the release event.
    pub fn set_auto_release(&self, auto_release: bool) {
        self.auto_release.store(auto_release, Ordering::Relaxed);
    }

    /// Makes the command `cmd` answer with `status`.
    pub fn fail_cmd(&self, cmd: PeerCmd, status: i32) {
        self.inner.lock().fail_cmd = Some((cmd as u32, status));
    }

    pub fn clear_failure(&self) {
        self.inner.lock().fail_cmd = None;
    }

    pub fn nr_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn registration(&self, id: u32) -> Option<PeerShmem> {
        self.inner.lock().registrations.get(&id).cloned()
    }

    pub fn nr_registrations(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    pub fn released(&self) -> Vec<u32> {
        self.inner.lock().released.clone()
    }

    pub fn notified(&self) -> Vec<u32> {
        self.inner.lock().notified.clone()
    }

    pub fn generic_calls(&self) -> Vec<PeerRegs> {
        self.inner.lock().generic.clone()
    }

    pub fn event_capacity(&self) -> usize {
        self.inner.lock().event_capacity
    }

    /// Raises the release event of the registration `id`.
    pub fn release_from_peer(&self, id: u32) {
        let event = self.inner.lock().registrations.get(&id).map(|shmem| shmem.header.release_event.get());
        if let (Some(event), Some(events)) = (event, self.events.lock().upgrade()) {
            events.raise(event).unwrap();
        }
    }

    /// Reads the content of channel `index` as the peer sees it.
    pub fn channel_content(&self, index: usize) -> Vec<u8> {
        let meta = self.inner.lock().channels[index].clone();
        let write_offset = self.phys.read_u32(&meta, 0) as usize;
        let count = self.phys.read_u32(&meta, 4) as usize;
        let entries: Vec<u32> = (0..count)
            .map(|i| self.phys.read_u32(&meta, 8 + 4 * i))
            .collect();
        let pages = self.resolve(&entries);
        let mut content = vec![0u8; write_offset];
        self.phys.read_pages(&pages, 0, &mut content);
        content
    }

    /// Resolves descriptor entries to pages.
    pub fn resolve(&self, entries: &[u32]) -> Vec<Paddr> {
        match self.backend {
            BackendKind::Direct => entries
                .iter()
                .map(|pfn| *pfn as usize * PAGE_SIZE)
                .collect(),
            BackendKind::Hypervisor => {
                let hyp = self.hyp.as_ref().unwrap();
                entries
                    .iter()
                    .flat_map(|handle| {
                        hyp.pages_of(*handle)
                            .unwrap_or_else(|| panic!("unknown handle {:#x}", handle))
                    })
                    .collect()
            }
        }
    }

    fn decode_descriptor(content: &[u8]) -> Vec<u32> {
        let count = u32::from_le_bytes(content[..4].try_into().unwrap()) as usize;
        (0..count)
            .map(|i| u32::from_le_bytes(content[4 + 4 * i..8 + 4 * i].try_into().unwrap()))
            .collect()
    }

    fn handle(&self, regs: &PeerRegs) -> i32 {
        let Ok(cmd) = PeerCmd::try_from(regs.cmd()) else {
            if regs.cmd() >= PeerCmd::GENERIC_BASE {
                self.inner.lock().generic.push(*regs);
                return 0;
            }
            return -22;
        };
        match cmd {
            PeerCmd::ChannelsInit => {
                let announce = self.resolve(&[regs.arg(0) as u32]);
                let nr = regs.arg(1) as usize;
                assert_eq!(self.phys.read_u32(&announce, 0) as usize, nr);
                let channels = (0..nr)
                    .map(|i| self.resolve(&[self.phys.read_u32(&announce, 4 + 4 * i)]))
                    .collect();
                self.inner.lock().channels = channels;
            }
            PeerCmd::ShmemRegister => {
                let content = self.channel_content(regs.arg(0) as usize);
                let header_len = size_of::<ShmemRegisterHeader>();
                let header = ShmemRegisterHeader::read_from_bytes(&content[..header_len])
                    .ok()
                    .expect("truncated registration header");
                let entries = Self::decode_descriptor(&content[header_len..]);
                let pages = self.resolve(&entries);
                self.inner.lock().registrations.insert(
                    header.id.get(),
                    PeerShmem {
                        header,
                        entries,
                        pages,
                    },
                );
            }
            PeerCmd::ShmemRelease => {
                let id = regs.arg(0) as u32;
                let mut inner = self.inner.lock();
                let Some(shmem) = inner.registrations.remove(&id) else {
                    return -22;
                };
                inner.released.push(id);
                drop(inner);
                if self.auto_release.load(Ordering::Relaxed) {
                    if let Some(events) = self.events.lock().upgrade() {
                        events.raise(shmem.header.release_event.get()).unwrap();
                    }
                }
            }
            PeerCmd::EventsInit => {
                let content = self.channel_content(regs.arg(0) as usize);
                let entries = Self::decode_descriptor(&content);
                let pages = self.resolve(&entries);
                let mut inner = self.inner.lock();
                inner.event_pages = pages;
                inner.event_capacity = regs.arg(1) as usize;
            }
            PeerCmd::EventNotify => {
                let id = regs.arg(0) as usize;
                let mut inner = self.inner.lock();
                // The peer-bound bitmap follows the normal-world-bound one.
                let send_base = crate::event::bitmap_bytes(inner.event_capacity);
                let byte = send_base + id / 8;
                let mut value = [0u8];
                self.phys.read_pages(&inner.event_pages, byte, &mut value);
                assert_ne!(value[0] & (1 << (id % 8)), 0, "event {} not pending", id);
                value[0] &= !(1 << (id % 8));
                let page = inner.event_pages[byte / PAGE_SIZE];
                self.phys.write(page, byte % PAGE_SIZE, &value);
                inner.notified.push(id as u32);
            }
        }
        0
    }
}

impl PeerInvoke for MockPeer {
    fn invoke(&self, regs: &mut PeerRegs) {
        let fail = self.inner.lock().fail_cmd;
        let status = match fail {
            Some((cmd, status)) if cmd == regs.cmd() => status,
            _ => self.handle(regs),
        };
        regs.set_status(status);
    }
}

/// A user address space whose pages come from the mock physical memory.
pub struct MockUserSpace {
    phys: Arc<MockPhysMem>,
    backing: Mutex<BTreeMap<Vaddr, Paddr>>,
    inserted: Mutex<BTreeMap<Vaddr, (Paddr, bool)>>,
    pinned: Mutex<Vec<Paddr>>,
}

impl MockUserSpace {
    pub fn new(phys: Arc<MockPhysMem>) -> Self {
        Self {
            phys,
            backing: Mutex::new(BTreeMap::new()),
            inserted: Mutex::new(BTreeMap::new()),
            pinned: Mutex::new(Vec::new()),
        }
    }

    pub fn inserted(&self) -> BTreeMap<Vaddr, (Paddr, bool)> {
        self.inserted.lock().clone()
    }

    pub fn nr_pinned(&self) -> usize {
        self.pinned.lock().len()
    }

    pub fn backing_page(&self, vaddr: Vaddr) -> Option<Paddr> {
        self.backing.lock().get(&vaddr).copied()
    }
}

impl UserSpace for MockUserSpace {
    fn insert_page(&self, vaddr: Vaddr, paddr: Paddr, writable: bool) -> Result<()> {
        self.inserted.lock().insert(vaddr, (paddr, writable));
        Ok(())
    }

    fn pin_pages(&self, vaddr: Vaddr, nr_pages: usize, _writable: bool) -> Result<Vec<Paddr>> {
        let mut backing = self.backing.lock();
        let mut pages = Vec::with_capacity(nr_pages);
        for i in 0..nr_pages {
            let page_vaddr = vaddr + i * PAGE_SIZE;
            let paddr = match backing.get(&page_vaddr) {
                Some(paddr) => *paddr,
                None => {
                    let paddr = self.phys.alloc_page()?;
                    backing.insert(page_vaddr, paddr);
                    paddr
                }
            };
            pages.push(paddr);
        }
        self.pinned.lock().extend_from_slice(&pages);
        Ok(pages)
    }

    fn unpin_pages(&self, pages: &[Paddr]) {
        let mut pinned = self.pinned.lock();
        for paddr in pages {
            let pos = pinned
                .iter()
                .position(|pinned| pinned == paddr)
                .unwrap_or_else(|| panic!("page {:#x} is not pinned", paddr));
            pinned.swap_remove(pos);
        }
    }
}

/// Returns the page-frame number of `paddr` as packed on the wire.
pub fn pfn(paddr: Paddr) -> u32 {
    paddr_to_pfn(paddr) as u32
}

/// A set of mocks wired together.
pub struct MockEnv {
    pub config: IwConfig,
    pub platform: Arc<MockPlatform>,
    pub phys: Arc<MockPhysMem>,
    pub hyp: Option<Arc<MockHyp>>,
    pub peer: Arc<MockPeer>,
}

impl MockEnv {
    pub fn direct(nr_cpus: usize) -> Self {
        Self::new(IwConfig::default(), nr_cpus, AllocLayout::Ascending)
    }

    pub fn hyp(nr_cpus: usize) -> Self {
        let config = IwConfig {
            backend: BackendKind::Hypervisor,
            ..IwConfig::default()
        };
        Self::new(config, nr_cpus, AllocLayout::Ascending)
    }

    pub fn new(config: IwConfig, nr_cpus: usize, layout: AllocLayout) -> Self {
        let phys = Arc::new(MockPhysMem::new(layout));
        let hyp = (config.backend == BackendKind::Hypervisor).then(|| Arc::new(MockHyp::new()));
        let peer = Arc::new(MockPeer::new(phys.clone(), hyp.clone()));
        Self {
            config,
            platform: Arc::new(MockPlatform::new(nr_cpus)),
            phys,
            hyp,
            peer,
        }
    }

    pub fn hyp_mock(&self) -> &Arc<MockHyp> {
        self.hyp.as_ref().unwrap()
    }

    /// Builds a backend of its own, for tests below the [`TzDev`] level.
    ///
    /// Notifications of the mock hypervisor go to the allocator built last.
    pub fn mem_context(&self) -> (MemContext, Option<Arc<HypAllocator>>) {
        let (backend, allocator): (Arc<dyn MemBackend>, _) = match &self.hyp {
            None => (Arc::new(DirectBackend), None),
            Some(hyp) => {
                let allocator =
                    HypAllocator::new(hyp.clone(), self.platform.clone(), &self.config).unwrap();
                (
                    Arc::new(HypBackend::new(allocator.clone(), self.config.sort_pages)),
                    Some(allocator),
                )
            }
        };
        let ctx = MemContext {
            phys: self.phys.clone(),
            backend,
        };
        (ctx, allocator)
    }

    /// Starts a [`TzDev`] on the mocks and connects the peer to its events.
    pub fn tzdev(&self) -> Arc<TzDev> {
        let mut options =
            TzDevOptions::new(self.platform.clone(), self.phys.clone(), self.peer.clone())
                .config(self.config.clone());
        if let Some(hyp) = &self.hyp {
            options = options.hypervisor(hyp.clone());
        }
        let tzdev = options.build().unwrap();
        self.peer.connect_events(tzdev.events());
        tzdev
    }
}

/// Runs the event dispatcher of `tzdev` on its own thread.
pub struct Dispatcher {
    tzdev: Arc<TzDev>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(tzdev: &Arc<TzDev>) -> Self {
        let thread = {
            let tzdev = tzdev.clone();
            thread::spawn(move || tzdev.run_dispatcher())
        };
        Self {
            tzdev: tzdev.clone(),
            thread: Some(thread),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.tzdev.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Waits until `cond` holds, failing the test after ten seconds.
pub fn wait_for(cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < std::time::Duration::from_secs(10),
            "condition not met in time"
        );
        thread::yield_now();
    }
}
