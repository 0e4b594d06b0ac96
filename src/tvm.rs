// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use log::{debug, error, info, warn};
use riscv_pages::{
    GuestPageAddr, GuestPageRange, GuestPhysAddr, HostPageAddr, HostVirtAddr, HostVirtPageAddr,
    PageSize,
};
use sbi_rs::{TsmCapability, TsmPageType, TvmAiaParams, TvmCreateParams};
use spin::Mutex;

use crate::config::{MeasureFailurePolicy, MAX_TVM_VCPUS, PGD_ALIGN};
use crate::cove::CoveHost;
use crate::error::{Error, MeasureError, Result};
use crate::fence::{DomainFence, FenceEpoch};
use crate::host::{InterruptFile, VcpuId, VmHooks};
use crate::monitor::TvmId;
use crate::page_ledger::{AssignKind, Collection, Mapping, PageLedger, PageRecord, Rejected};
use crate::vcpu::ExecutionContext;

/// Maximum number of confidential memory regions a TVM may register.
pub const MAX_MEMORY_REGIONS: usize = 16;

/// Lifecycle of a TVM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainState {
    /// Created; no confidential memory registered yet.
    Initializing,
    MemoryRegistered,
    /// At least one measured load has been started.
    Measuring,
    /// Runnable. No more memory may be measured and no more vCPUs created.
    Finalized,
    /// Being torn down, or `DestroyTvm` failed. Every page is still owned by the TVM.
    Destroying,
    Destroyed,
}

impl DomainState {
    fn is_finalized(&self) -> bool {
        *self == DomainState::Finalized
    }

    fn is_gone(&self) -> bool {
        matches!(self, DomainState::Destroying | DomainState::Destroyed)
    }
}

/// Where and how the boot vCPU starts executing once the TVM is finalized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BootEntry {
    pub sepc: u64,
    /// Passed to the guest in a1.
    pub arg: u64,
}

/// Arguments of a single-step promotion of an ordinary VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PromoteRequest {
    pub fdt_addr: GuestPhysAddr,
    pub tap_addr: GuestPhysAddr,
    /// Where the promoted guest resumes.
    pub sepc: u64,
}

/// The host AIA configuration a TVM's virtual IMSICs are derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AiaMode {
    /// Interrupt files are emulated in software.
    Emulated,
    /// Interrupt files are hardware guest files.
    HwAccel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AiaConfig {
    pub mode: AiaMode,
    pub aplic_present: bool,
    /// Guest physical address of vCPU 0's IMSIC.
    pub imsic_base: GuestPageAddr,
    pub group_index_bits: u32,
    pub group_index_shift: u32,
    pub hart_index_bits: u32,
    pub guest_index_bits: u32,
}

struct DomainInner {
    state: DomainState,
    ledger: PageLedger,
    // Absent for TVMs created by promotion, where the TSM provides its own memory.
    pgd: Option<PageRecord>,
    pgtable: Option<PageRecord>,
    tvm_state: Option<PageRecord>,
    regions: ArrayVec<GuestPageRange, MAX_MEMORY_REGIONS>,
    vcpus: ArrayVec<VcpuId, MAX_TVM_VCPUS>,
    aia_enabled: bool,
}

impl DomainInner {
    fn new(state: DomainState) -> Self {
        Self {
            state,
            ledger: PageLedger::new(),
            pgd: None,
            pgtable: None,
            tvm_state: None,
            regions: ArrayVec::new(),
            vcpus: ArrayVec::new(),
            aia_enabled: false,
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.state.is_gone() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn check_pre_finalize(&self) -> Result<()> {
        self.check_live()?;
        if self.state.is_finalized() {
            return Err(Error::AlreadyFinalized);
        }
        Ok(())
    }

    fn in_confidential_region(&self, range: &GuestPageRange) -> bool {
        self.regions.iter().any(|r| r.contains_range(range))
    }
}

// Gives back the pages acquired while creating a TVM, newest first. Pages the TSM won't reclaim
// are leaked.
fn unwind_create(host: &CoveHost, acquired: &mut ArrayVec<PageRecord, 3>) {
    while let Some(record) = acquired.pop() {
        match PageLedger::reclaim(host.monitor(), record) {
            Ok(record) => record.release(host.memory()),
            Err(r) => error!(
                "leaking {} after failed TVM creation: {:?}",
                r.record.phys(),
                r.error
            ),
        }
    }
}

/// A confidential VM and everything the host tracks for it.
pub struct TrustDomain<'a> {
    host: &'a CoveHost<'a>,
    vm: &'a dyn VmHooks,
    id: TvmId,
    fence: DomainFence,
    // Serializes lifecycle changes across their TSM calls; `inner` is never held across one.
    transition: Mutex<()>,
    inner: Mutex<DomainInner>,
}

impl<'a> TrustDomain<'a> {
    // Allocates `count` pages and converts them without fencing.
    fn alloc_converted(
        host: &CoveHost,
        ledger: &PageLedger,
        count: u64,
        align: u64,
    ) -> Result<PageRecord> {
        let page = host
            .memory()
            .alloc_pages(count, align)
            .ok_or(Error::ResourceExhausted)?;
        ledger
            .convert(host.monitor(), PageRecord::allocated(page))
            .map_err(|r| {
                r.record.release(host.memory());
                r.error
            })
    }

    /// Creates an empty TVM: donates a stage-2 root, a page-table pool and the TSM's per-TVM
    /// state pages, then asks the TSM to create it. Everything acquired is given back if any
    /// step fails.
    pub fn create(host: &'a CoveHost<'a>, vm: &'a dyn VmHooks) -> Result<Self> {
        let config = host.config();
        let monitor = host.monitor();
        let ledger = PageLedger::new();
        let mut acquired = ArrayVec::<PageRecord, 3>::new();

        // The root, pool and state pages are converted back to back and share one fence.
        let steps = [
            (config.pgd_pages, PGD_ALIGN),
            (config.pgtable_pool_pages, PageSize::Size4k as u64),
            (host.capabilities().tvm_state_pages(), PageSize::Size4k as u64),
        ];
        for (count, align) in steps {
            match Self::alloc_converted(host, &ledger, count, align) {
                Ok(record) => acquired.push(record),
                Err(e) => {
                    unwind_create(host, &mut acquired);
                    return Err(e);
                }
            }
        }
        if let Err(e) = host.fence() {
            unwind_create(host, &mut acquired);
            return Err(e);
        }

        let params = TvmCreateParams {
            tvm_page_directory_addr: acquired[0].phys().bits(),
            tvm_state_addr: acquired[2].phys().bits(),
        };
        let id = match monitor.create_tvm(&params, host.memory()) {
            Ok(id) => id,
            Err(e) => {
                error!("TSM failed to create TVM: {:?}", e);
                unwind_create(host, &mut acquired);
                return Err(e);
            }
        };
        acquired[0].mark_assigned(AssignKind::DomainState);
        acquired[2].mark_assigned(AssignKind::DomainState);

        let pool = acquired[1];
        let pool = match PageLedger::assign_pgtable(monitor, id, pool) {
            Ok(pool) => pool,
            Err(Rejected { error, .. }) => {
                error!("TVM {} rejected its page-table pool: {:?}", id.raw(), error);
                if let Err(e) = monitor.destroy_tvm(id) {
                    error!("destroying half-built TVM {} failed: {:?}", id.raw(), e);
                    return Err(error);
                }
                unwind_create(host, &mut acquired);
                return Err(error);
            }
        };

        let mut inner = DomainInner::new(DomainState::Initializing);
        inner.pgd = Some(acquired[0]);
        inner.pgtable = Some(pool);
        inner.tvm_state = Some(acquired[2]);
        inner.ledger = ledger;
        info!("created TVM {}", id.raw());
        Ok(Self {
            host,
            vm,
            id,
            fence: DomainFence::new(),
            transition: Mutex::new(()),
            inner: Mutex::new(inner),
        })
    }

    /// Converts the calling ordinary VM into a TVM in one step.
    ///
    /// All present guest memory is mapped first so the TSM can take it over, then the caller's
    /// registers are handed to the TSM and every vCPU in `vcpus` is created. The new TVM is
    /// finalized on return; if any vCPU can't be created it is destroyed instead.
    pub fn promote(
        host: &'a CoveHost<'a>,
        vm: &'a dyn VmHooks,
        caller: VcpuId,
        vcpus: &[VcpuId],
        request: PromoteRequest,
    ) -> Result<(Self, Vec<ExecutionContext>)> {
        if !host.capabilities().has(TsmCapability::PromoteTvm) {
            return Err(Error::Unsupported);
        }
        if vcpus.is_empty() || vcpus.len() > MAX_TVM_VCPUS || !vcpus.contains(&caller) {
            return Err(Error::InvalidArgument);
        }

        for slot in vm.memslots() {
            for (i, gpa) in slot.gpa.pages().enumerate() {
                let hva = HostVirtAddr::new(slot.hva.bits() + i as u64 * PageSize::Size4k as u64);
                if let Err(e) = vm.map_ordinary(gpa.into(), hva) {
                    debug!("preloading {} failed: {:?}", gpa, e);
                }
            }
        }
        vm.publish_registers(caller)?;
        let id = host
            .monitor()
            .promote_to_tvm(request.fdt_addr, request.tap_addr, request.sepc)?;

        let domain = Self {
            host,
            vm,
            id,
            fence: DomainFence::new(),
            transition: Mutex::new(()),
            inner: Mutex::new(DomainInner::new(DomainState::Initializing)),
        };
        let mut contexts = Vec::with_capacity(vcpus.len());
        for &vcpu in vcpus {
            match ExecutionContext::init(&domain, vcpu) {
                Ok(ctx) => contexts.push(ctx),
                Err(e) => {
                    error!(
                        "promoted TVM {} failed to create vCPU {}: {:?}",
                        id.raw(),
                        vcpu.raw(),
                        e
                    );
                    for ctx in contexts {
                        ctx.destroy(&domain);
                    }
                    if let Err(de) = domain.destroy() {
                        error!("destroying promoted TVM {} failed: {:?}", id.raw(), de);
                    }
                    return Err(e);
                }
            }
        }
        domain.inner.lock().state = DomainState::Finalized;
        info!("promoted VM to TVM {} with {} vCPUs", id.raw(), contexts.len());
        Ok((domain, contexts))
    }

    pub fn id(&self) -> TvmId {
        self.id
    }

    pub fn state(&self) -> DomainState {
        self.inner.lock().state
    }

    pub fn is_finalized(&self) -> bool {
        self.state().is_finalized()
    }

    /// Registers `[gpa, gpa + size)` as confidential memory. Only valid before finalization.
    pub fn add_memory_region(&self, gpa: u64, size: u64) -> Result<()> {
        let region = GuestPageRange::from_raw(gpa, size).ok_or(Error::InvalidArgument)?;
        let _transition = self.transition.lock();
        {
            let inner = self.inner.lock();
            inner.check_pre_finalize()?;
            if inner.regions.iter().any(|r| r.overlaps(&region)) {
                return Err(Error::InvalidArgument);
            }
            if inner.regions.is_full() {
                return Err(Error::ResourceExhausted);
            }
        }
        self.host
            .monitor()
            .add_memory_region(self.id, region)
            .map_err(|e| {
                error!("registering {:#x}+{:#x} failed: {:?}", gpa, size, e);
                e
            })?;
        let mut inner = self.inner.lock();
        inner.regions.push(region);
        if inner.state == DomainState::Initializing {
            inner.state = DomainState::MemoryRegistered;
        }
        info!(
            "TVM {}: confidential region {:#x}+{:#x}",
            self.id.raw(),
            gpa,
            size
        );
        Ok(())
    }

    /// Copies `size` bytes of host memory at `hva` into fresh confidential pages mapped at `gpa`,
    /// extending the TVM's measurement one page at a time.
    ///
    /// The load can be cancelled between pages. On failure the error says how many pages were
    /// measured; whether they're kept depends on `CoveConfig::measure_failure`.
    pub fn measure_pages(
        &self,
        hva: u64,
        gpa: u64,
        size: u64,
    ) -> core::result::Result<(), MeasureError> {
        let page_size = PageSize::Size4k as u64;
        let invalid = |error: Error| MeasureError {
            error,
            completed: 0,
            remaining: size / page_size + u64::from(size % page_size != 0),
        };
        let src_base =
            HostVirtPageAddr::from_bits(hva).ok_or_else(|| invalid(Error::InvalidArgument))?;
        let range = size
            .checked_add(page_size - 1)
            .and_then(|len| GuestPageRange::from_raw(gpa, PageSize::Size4k.round_down(len)))
            .ok_or_else(|| invalid(Error::InvalidArgument))?;
        {
            let mut inner = self.inner.lock();
            inner.check_pre_finalize().map_err(invalid)?;
            if !inner.in_confidential_region(&range) {
                return Err(invalid(Error::InvalidArgument));
            }
            inner.state = DomainState::Measuring;
        }

        let total = range.num_pages();
        let mut completed = 0;
        for (gpa, src) in range.pages().zip(src_base.iter_from()) {
            let mapping = Mapping {
                gpa,
                hva: src.into(),
            };
            if let Err(error) = self.measure_one(mapping) {
                error!(
                    "TVM {}: measuring {} failed after {} of {} pages: {:?}",
                    self.id.raw(),
                    gpa,
                    completed,
                    total,
                    error
                );
                if self.host.config().measure_failure == MeasureFailurePolicy::Reclaim {
                    self.evict_measured();
                }
                return Err(MeasureError {
                    error,
                    completed,
                    remaining: total - completed,
                });
            }
            completed += 1;
        }
        debug!("TVM {}: measured {} pages at {}", self.id.raw(), total, range.base());
        Ok(())
    }

    fn measure_one(&self, mapping: Mapping) -> Result<()> {
        let host = self.host;
        let memory = host.memory();
        let sched = host.scheduler();
        if sched.termination_pending() {
            return Err(Error::Cancelled);
        }
        sched.yield_if_needed();

        let src = memory.pin(mapping.hva)?;
        let result = self.load_measured(src.phys(), mapping);
        memory.unpin(src, false);
        result
    }

    // Allocates, converts and populates the destination page for a measured load of `src`.
    fn load_measured(&self, src: HostPageAddr, mapping: Mapping) -> Result<()> {
        let host = self.host;
        let page = host
            .memory()
            .alloc_pages(1, PageSize::Size4k as u64)
            .ok_or(Error::ResourceExhausted)?;
        let record = self
            .convert_page(PageRecord::allocated(page))
            .map_err(|r| {
                r.record.release(host.memory());
                r.error
            })?;
        if let Err(e) = host.fence() {
            self.discard(record);
            return Err(e);
        }
        // The TVM may have been finalized while the fence ran.
        if let Err(e) = self.check_pre_finalize() {
            self.discard(record);
            return Err(e);
        }
        PageLedger::assign_measured(host.monitor(), self.id, record, src, mapping)
            .and_then(|record| self.track(Collection::Measured, record))
            .map_err(|r| {
                self.discard(r.record);
                r.error
            })
    }

    // Converts a page the TVM doesn't track yet.
    pub(crate) fn convert_page(
        &self,
        record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        if self.inner.lock().ledger.holds(record.phys()) {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        PageLedger::convert_record(self.host.monitor(), record)
    }

    // Tracks a record that was assigned or shared while the lock was dropped. Refused once the
    // TVM is destroyed; the record is handed back for disposal.
    pub(crate) fn track(
        &self,
        collection: Collection,
        record: PageRecord,
    ) -> core::result::Result<(), Rejected> {
        let mut inner = self.inner.lock();
        if inner.state == DomainState::Destroyed {
            return Err(Rejected {
                error: Error::InvalidState,
                record,
            });
        }
        inner.ledger.track(collection, record)
    }

    // Reclaims and releases an untracked record, leaking it if the TSM won't give it back.
    pub(crate) fn discard(&self, record: PageRecord) {
        match PageLedger::reclaim(self.host.monitor(), record) {
            Ok(record) => record.release(self.host.memory()),
            Err(r) => error!("leaking {}: {:?}", r.record.phys(), r.error),
        }
    }

    // Removes every measured page from the TVM and gives it back to the host. Pages that can't
    // be removed stay in `Measured` for destroy to deal with.
    fn evict_measured(&self) {
        let monitor = self.host.monitor();
        let gpas: Vec<GuestPageAddr> = {
            let inner = self.inner.lock();
            inner
                .ledger
                .records(Collection::Measured)
                .filter_map(|r| r.gpa())
                .collect()
        };
        let one_page = |gpa: GuestPageAddr| GuestPageRange::with_pages(gpa, 1);
        let invalidated: Vec<GuestPageAddr> = gpas
            .into_iter()
            .filter(|&gpa| {
                one_page(gpa)
                    .map(|r| monitor.invalidate_pages(self.id, r).is_ok())
                    .unwrap_or(false)
            })
            .collect();
        if invalidated.is_empty() {
            return;
        }
        if let Err(e) = self.fence(None) {
            warn!(
                "TVM {}: fence before evicting measured pages failed: {:?}",
                self.id.raw(),
                e
            );
            return;
        }
        let mut evicted = PageLedger::new();
        for gpa in invalidated {
            let removed = one_page(gpa)
                .map(|r| monitor.remove_pages(self.id, r).is_ok())
                .unwrap_or(false);
            if removed {
                let mut inner = self.inner.lock();
                if let Some(record) = inner.ledger.take(Collection::Measured, gpa) {
                    evicted.defer_reclaim(record);
                }
            }
        }
        let leaked = evicted.reclaim_list(monitor, self.host.memory(), Collection::PendingReclaim);
        info!(
            "TVM {}: evicted measured pages, {} leaked",
            self.id.raw(),
            leaked
        );
    }

    /// Finalizes the TVM so its vCPUs can run, starting the boot vCPU at `entry`.
    pub fn finalize(&self, entry: BootEntry) -> Result<()> {
        let _transition = self.transition.lock();
        self.inner.lock().check_pre_finalize()?;
        self.host
            .monitor()
            .finalize_tvm(self.id, entry.sepc, entry.arg)
            .map_err(|e| {
                error!("finalizing TVM {} failed: {:?}", self.id.raw(), e);
                e
            })?;
        self.inner.lock().state = DomainState::Finalized;
        info!("finalized TVM {} at {:#x}", self.id.raw(), entry.sepc);
        Ok(())
    }

    // Finalizes on the first vCPU run if the VMM didn't do so explicitly.
    pub(crate) fn finalize_if_needed(&self, entry: BootEntry) -> Result<()> {
        match self.finalize(entry) {
            Err(Error::AlreadyFinalized) => Ok(()),
            r => r,
        }
    }

    /// Tears down the TVM and returns all of its pages to the host.
    ///
    /// New work on the TVM is refused from the start. If the TSM refuses to destroy the TVM,
    /// nothing is reclaimed and the TVM is left in `Destroying`; destroy may be retried. Returns
    /// `ReclaimFailed` if any of the TVM's own state pages couldn't be reclaimed.
    pub fn destroy(&self) -> Result<()> {
        let host = self.host;
        let monitor = host.monitor();
        let memory = host.memory();
        let _transition = self.transition.lock();
        {
            let mut inner = self.inner.lock();
            if inner.state == DomainState::Destroyed {
                return Ok(());
            }
            inner.state = DomainState::Destroying;
        }
        if let Err(e) = monitor.destroy_tvm(self.id) {
            error!("TSM failed to destroy TVM {}: {:?}", self.id.raw(), e);
            return Err(e);
        }

        // Calls already past their state check may still track pages. Drain until the ledger
        // stays empty; after that `track()` refuses.
        let mut leaked = 0;
        let slots = loop {
            let mut ledger = {
                let mut inner = self.inner.lock();
                if inner.ledger.is_empty() {
                    inner.vcpus.clear();
                    inner.state = DomainState::Destroyed;
                    break [inner.tvm_state.take(), inner.pgtable.take(), inner.pgd.take()];
                }
                core::mem::take(&mut inner.ledger)
            };
            for (collection, what) in [
                (Collection::PendingReclaim, "vCPU state"),
                (Collection::Measured, "measured"),
                (Collection::Zero, "zero"),
                (Collection::Shared, "shared"),
            ] {
                let n = ledger.reclaim_list(monitor, memory, collection);
                if n != 0 {
                    warn!("TVM {}: {} {} pages leaked", self.id.raw(), n, what);
                }
                leaked += n;
            }
        };

        let mut result = Ok(());
        for record in slots.into_iter().flatten() {
            match PageLedger::reclaim(monitor, record) {
                Ok(record) => record.release(memory),
                Err(r) => {
                    error!(
                        "TVM {}: reclaiming {} failed: {:?}",
                        self.id.raw(),
                        r.record.phys(),
                        r.error
                    );
                    result = Err(Error::ReclaimFailed);
                }
            }
        }
        info!("destroyed TVM {}, {} guest pages leaked", self.id.raw(), leaked);
        result
    }

    /// Handles a stage-2 fault at `gpa` backed by the host mapping `hva`.
    ///
    /// Pages the guest has shared are mapped back as shared; anything else is pinned, converted
    /// and mapped as a zero-filled confidential page.
    pub fn handle_page_fault(&self, gpa: GuestPhysAddr, hva: HostVirtAddr) -> Result<()> {
        let gpa = GuestPageAddr::with_round_down(gpa, PageSize::Size4k);
        let hva = HostVirtPageAddr::with_round_down(hva, PageSize::Size4k);
        let host = self.host;
        let monitor = host.monitor();
        let memory = host.memory();
        let existing = {
            let inner = self.inner.lock();
            inner.check_live()?;
            inner.ledger.find(gpa).map(|(c, r)| (c, r.phys()))
        };
        match existing {
            Some((Collection::Shared, phys)) => {
                debug!("TVM {}: mapping shared {} at {}", self.id.raw(), phys, gpa);
                return monitor.add_shared_pages(self.id, phys, TsmPageType::Page4k, 1, gpa);
            }
            Some(_) => return Ok(()),
            None => (),
        }

        let mapping = Mapping {
            gpa,
            hva: hva.into(),
        };
        let page = memory.pin(mapping.hva)?;
        let record = self
            .convert_page(PageRecord::pinned(page, mapping))
            .map_err(|r| {
                memory.unpin(page, false);
                r.error
            })?;
        if let Err(e) = host.fence() {
            self.discard_pinned(record);
            return Err(e);
        }
        PageLedger::assign_zero(monitor, self.id, record, mapping)
            .and_then(|record| self.track(Collection::Zero, record))
            .map_err(|r| {
                warn!(
                    "TVM {}: mapping zero page at {} failed: {:?}",
                    self.id.raw(),
                    gpa,
                    r.error
                );
                self.discard_pinned(r.record);
                r.error
            })
    }

    // Like `discard()`, but drops the pin without dirtying the page.
    fn discard_pinned(&self, record: PageRecord) {
        match PageLedger::reclaim(self.host.monitor(), record) {
            Ok(record) => self.host.memory().unpin(record.page(), false),
            Err(r) => error!("leaking pinned {}: {:?}", r.record.phys(), r.error),
        }
    }

    /// Sets up AIA virtualization so that hardware guest interrupt files can be bound to the
    /// TVM's vCPUs. Only hardware-accelerated IMSICs without an APLIC are supported.
    pub fn init_aia(&self, config: &AiaConfig) -> Result<()> {
        if !self.host.capabilities().covi_available() {
            return Err(Error::Unsupported);
        }
        if config.aplic_present {
            return Err(Error::InvalidArgument);
        }
        if config.mode != AiaMode::HwAccel {
            return Err(Error::Unsupported);
        }
        let params = TvmAiaParams {
            imsic_base_addr: config.imsic_base.bits(),
            group_index_bits: config.group_index_bits,
            group_index_shift: config.group_index_shift,
            hart_index_bits: config.hart_index_bits,
            guest_index_bits: config.guest_index_bits,
            // Nested TVMs aren't supported.
            guests_per_hart: 0,
        };
        let _transition = self.transition.lock();
        self.inner.lock().check_pre_finalize()?;
        self.host
            .monitor()
            .aia_init(self.id, &params, self.host.memory())
            .map_err(|e| {
                error!("TVM {}: AIA init failed: {:?}", self.id.raw(), e);
                e
            })?;
        self.inner.lock().aia_enabled = true;
        Ok(())
    }

    pub fn aia_enabled(&self) -> bool {
        self.inner.lock().aia_enabled
    }

    /// Converts a guest interrupt file for use by this TVM and fences so it can be bound.
    pub fn convert_interrupt_file(&self, file: &InterruptFile) -> Result<()> {
        self.inner.lock().check_live()?;
        self.host.monitor().convert_imsic(file.phys)?;
        self.host.fence()?;
        Ok(())
    }

    /// Takes a no longer bound interrupt file back from the TSM.
    pub fn claim_interrupt_file(&self, file: &InterruptFile) -> Result<()> {
        self.host.monitor().reclaim_imsic(file.phys)
    }

    /// Fences the TVM's translations. Every registered vCPU other than `requester` is kicked out
    /// of guest mode.
    pub fn fence(&self, requester: Option<VcpuId>) -> Result<FenceEpoch> {
        let vcpus = self.inner.lock().vcpus.clone();
        self.fence
            .fence(self.host.monitor(), self.id, requester, &vcpus, self.vm)
    }

    /// Promotes the 4kB mappings backing `gpa` to a single mapping of `page_type`.
    pub fn promote_page(&self, gpa: GuestPageAddr, page_type: TsmPageType) -> Result<()> {
        self.inner.lock().check_live()?;
        self.host.monitor().promote_page(self.id, gpa, page_type)
    }

    /// Splits the `page_type` mapping at `gpa` into 4kB mappings.
    pub fn demote_page(&self, gpa: GuestPageAddr, page_type: TsmPageType) -> Result<()> {
        self.inner.lock().check_live()?;
        self.host.monitor().demote_page(self.id, gpa, page_type)
    }

    /// Returns the number of records in `collection`.
    pub fn pages_in(&self, collection: Collection) -> usize {
        self.inner.lock().ledger.len(collection)
    }

    /// Returns the collection tracking the page mapped at `gpa`.
    pub fn collection_of(&self, gpa: GuestPageAddr) -> Option<Collection> {
        self.inner.lock().ledger.collection_of(gpa)
    }

    /// Returns the vCPUs currently registered with the TVM.
    pub fn vcpus(&self) -> ArrayVec<VcpuId, MAX_TVM_VCPUS> {
        self.inner.lock().vcpus.clone()
    }

    pub(crate) fn host(&self) -> &'a CoveHost<'a> {
        self.host
    }

    pub(crate) fn vm(&self) -> &'a dyn VmHooks {
        self.vm
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        self.inner.lock().check_live()
    }

    pub(crate) fn check_pre_finalize(&self) -> Result<()> {
        self.inner.lock().check_pre_finalize()
    }

    pub(crate) fn with_ledger<R>(&self, f: impl FnOnce(&mut PageLedger) -> R) -> R {
        f(&mut self.inner.lock().ledger)
    }

    pub(crate) fn register_vcpu(&self, vcpu: VcpuId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_pre_finalize()?;
        if inner.vcpus.contains(&vcpu) {
            return Err(Error::InvalidArgument);
        }
        let max = self.host.capabilities().max_vcpus();
        if inner.vcpus.is_full() || (max != 0 && inner.vcpus.len() as u64 >= max) {
            return Err(Error::ResourceExhausted);
        }
        inner.vcpus.push(vcpu);
        Ok(())
    }

    pub(crate) fn unregister_vcpu(&self, vcpu: VcpuId) {
        self.inner.lock().vcpus.retain(|v| *v != vcpu);
    }
}

impl Drop for TrustDomain<'_> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state != DomainState::Destroyed {
            warn!(
                "TVM {} dropped in state {:?}; its pages are leaked",
                self.id.raw(),
                inner.state
            );
        }
    }
}
