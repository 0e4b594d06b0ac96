// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use log::{debug, error, info, warn};
use riscv_pages::{GuestPageAddr, PageSize};
use sbi_rs::InterruptSelector;

use crate::config::MAX_EXT_INTERRUPT_IDS;
use crate::error::{Error, Result};
use crate::host::{CpuId, InterruptFile, InterruptFileDriver, VcpuId};
use crate::monitor::TvmId;
use crate::page_ledger::{AssignKind, Collection, PageRecord};
use crate::tvm::{BootEntry, TrustDomain};

// State of binding a vCPU's interrupt files to a physical CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BindStatus {
    Binding(CpuId),
    Bound(CpuId),
    Unbinding(CpuId),
    Unbound,
}

const ALLOW_LIST_ENTRIES: usize = MAX_EXT_INTERRUPT_IDS / 64;

// Bitmap tracking the per-vCPU allowed external interrupts. ID 0 is never valid.
struct AllowList {
    bits: ArrayVec<u64, ALLOW_LIST_ENTRIES>,
    num_ids: usize,
}

impl AllowList {
    fn new(num_ids: usize) -> Self {
        let num_ids = num_ids.min(MAX_EXT_INTERRUPT_IDS);
        let mut bits = ArrayVec::new();
        let entries = (num_ids + 63) / 64;
        for _ in 0..entries {
            bits.push(0);
        }

        Self { bits, num_ids }
    }

    fn check_id(&self, id: u64) -> Result<usize> {
        match usize::try_from(id) {
            Ok(id) if id != 0 && id < self.num_ids => Ok(id),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn allow(&mut self, sel: InterruptSelector) -> Result<()> {
        match sel {
            InterruptSelector::All => self.bits.iter_mut().for_each(|i| *i = !0u64),
            InterruptSelector::Id(id) => {
                let id = self.check_id(id)?;
                self.bits[id / 64] |= 1 << (id % 64);
            }
        }
        Ok(())
    }

    fn deny(&mut self, sel: InterruptSelector) -> Result<()> {
        match sel {
            InterruptSelector::All => self.bits.iter_mut().for_each(|i| *i = 0u64),
            InterruptSelector::Id(id) => {
                let id = self.check_id(id)?;
                self.bits[id / 64] &= !(1 << (id % 64));
            }
        }
        Ok(())
    }

    fn is_allowed(&self, id: u64) -> bool {
        self.check_id(id)
            .map(|id| (self.bits[id / 64] & (1 << (id % 64))) != 0)
            .unwrap_or(false)
    }
}

/// Why `ExecutionContext::run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The vCPU exited to the host and may be run again.
    Exited,
    /// The vCPU has stopped for good.
    Terminated,
}

/// Host-side state of a TVM vCPU.
pub struct ExecutionContext {
    id: VcpuId,
    tvm: TvmId,
    state_pages: Option<PageRecord>,
    bind_status: BindStatus,
    // Set when an interrupt file is attached before the vCPU could be bound to it.
    bind_required: bool,
    file: Option<InterruptFile>,
    imsic_addr: Option<GuestPageAddr>,
    allowed: AllowList,
    terminated: bool,
}

impl ExecutionContext {
    /// Creates vCPU `id` in `domain`, donating the vCPU state pages the TSM asks for.
    pub fn init(domain: &TrustDomain, id: VcpuId) -> Result<Self> {
        domain.register_vcpu(id)?;
        let state_pages = match Self::create_in_tsm(domain, id) {
            Ok(pages) => pages,
            Err(e) => {
                domain.unregister_vcpu(id);
                return Err(e);
            }
        };
        debug!("TVM {}: created vCPU {}", domain.id().raw(), id.raw());
        Ok(Self {
            id,
            tvm: domain.id(),
            state_pages,
            bind_status: BindStatus::Unbound,
            bind_required: false,
            file: None,
            imsic_addr: None,
            allowed: AllowList::new(domain.host().config().ext_interrupt_ids),
            terminated: false,
        })
    }

    fn create_in_tsm(domain: &TrustDomain, id: VcpuId) -> Result<Option<PageRecord>> {
        let host = domain.host();
        let monitor = host.monitor();
        let num_pages = host.capabilities().vcpu_state_pages();
        if num_pages == 0 {
            monitor.create_vcpu(domain.id(), id, None)?;
            return Ok(None);
        }

        let page = host
            .memory()
            .alloc_pages(num_pages, PageSize::Size4k as u64)
            .ok_or(Error::ResourceExhausted)?;
        let mut record = domain
            .convert_page(PageRecord::allocated(page))
            .map_err(|r| {
                r.record.release(host.memory());
                r.error
            })?;
        let created = host
            .fence()
            .and_then(|_| monitor.create_vcpu(domain.id(), id, Some(record.phys())));
        if let Err(e) = created {
            error!("TVM {}: creating vCPU {} failed: {:?}", domain.id().raw(), id.raw(), e);
            domain.discard(record);
            return Err(e);
        }
        record.mark_assigned(AssignKind::ContextState);
        Ok(Some(record))
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn tvm(&self) -> TvmId {
        self.tvm
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Returns the CPU whose interrupt files the vCPU is bound to.
    pub fn bound_cpu(&self) -> Option<CpuId> {
        match self.bind_status {
            BindStatus::Bound(cpu) => Some(cpu),
            _ => None,
        }
    }

    /// Returns true if the vCPU will bind its interrupt file on its next run.
    pub fn bind_required(&self) -> bool {
        self.bind_required
    }

    pub fn interrupt_file(&self) -> Option<InterruptFile> {
        self.file
    }

    pub fn imsic_addr(&self) -> Option<GuestPageAddr> {
        self.imsic_addr
    }

    fn check_domain(&self, domain: &TrustDomain) -> Result<()> {
        if domain.id() != self.tvm {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn check_covi(domain: &TrustDomain) -> Result<()> {
        if !domain.host().capabilities().covi_available() {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    /// Runs the vCPU until its next exit to the host.
    ///
    /// The TVM is finalized with `entry` on the first run if the VMM hasn't done so, and a pending
    /// interrupt file binding is performed on the current CPU. Once the TSM reports the vCPU as
    /// terminated it is never run again.
    pub fn run(&mut self, domain: &TrustDomain, entry: BootEntry) -> Result<RunOutcome> {
        if self.terminated {
            return Ok(RunOutcome::Terminated);
        }
        self.check_domain(domain)?;
        domain.check_live()?;
        domain.finalize_if_needed(entry)?;

        let host = domain.host();
        if self.bind_required && host.capabilities().covi_available() {
            if let Some(file) = self.file {
                self.bind_interrupt_file(domain, file.mask())?;
                self.bind_required = false;
            }
        }

        let exit = host.monitor().run_vcpu(self.tvm, self.id)?;
        if exit != 0 {
            info!("TVM {}: vCPU {} terminated ({:#x})", self.tvm.raw(), self.id.raw(), exit);
            self.terminated = true;
            return Ok(RunOutcome::Terminated);
        }
        Ok(RunOutcome::Exited)
    }

    /// Binds the vCPU to the interrupt files in `mask` on the current CPU. The TVM must be
    /// finalized.
    pub fn bind_interrupt_file(&mut self, domain: &TrustDomain, mask: u64) -> Result<()> {
        self.check_domain(domain)?;
        Self::check_covi(domain)?;
        if !domain.is_finalized() || self.bind_status != BindStatus::Unbound {
            return Err(Error::InvalidState);
        }
        let host = domain.host();
        let cpu = host.cpus().current_cpu();
        self.bind_status = BindStatus::Binding(cpu);
        if let Err(e) = host.monitor().bind_imsic(self.tvm, self.id, mask) {
            warn!("vCPU {}: binding {:#x} failed: {:?}", self.id.raw(), mask, e);
            self.bind_status = BindStatus::Unbound;
            return Err(e);
        }
        self.bind_status = BindStatus::Bound(cpu);
        debug!("vCPU {} bound to CPU {}", self.id.raw(), cpu.raw());
        Ok(())
    }

    /// Unbinds the vCPU from its interrupt files, running the TSM sequence on `old_cpu`. Does
    /// nothing if the vCPU isn't bound. The vCPU is left unbound even if the sequence fails.
    pub fn unbind_interrupt_file(&mut self, domain: &TrustDomain, old_cpu: CpuId) -> Result<()> {
        self.check_domain(domain)?;
        if self.bound_cpu().is_none() {
            return Ok(());
        }
        self.bind_status = BindStatus::Unbinding(old_cpu);

        let monitor = domain.host().monitor();
        let (tvm, vcpu) = (self.tvm, self.id);
        let mut result = Ok(());
        domain.host().cpus().run_on(old_cpu, &mut || {
            result = monitor
                .unbind_imsic_begin(tvm, vcpu)
                .and_then(|_| domain.fence(Some(vcpu)))
                .and_then(|_| monitor.unbind_imsic_end(tvm, vcpu));
        });
        self.bind_status = BindStatus::Unbound;
        if let Err(e) = result {
            error!("vCPU {}: unbind on CPU {} failed: {:?}", vcpu.raw(), old_cpu.raw(), e);
        }
        result
    }

    /// Moves a bound vCPU from its interrupt files on `old_cpu` to those in `mask` on the current
    /// CPU. The previous binding is kept if the move fails.
    pub fn rebind_interrupt_file(
        &mut self,
        domain: &TrustDomain,
        old_cpu: CpuId,
        mask: u64,
    ) -> Result<()> {
        self.check_domain(domain)?;
        Self::check_covi(domain)?;
        if self.bound_cpu().is_none() {
            return Err(Error::InvalidState);
        }
        let host = domain.host();
        let monitor = host.monitor();
        let (tvm, vcpu) = (self.tvm, self.id);
        monitor.rebind_imsic_begin(tvm, vcpu, mask)?;
        domain.fence(Some(vcpu))?;
        host.cpus().run_on(old_cpu, &mut || {
            if let Err(e) = monitor.rebind_imsic_clone(tvm, vcpu) {
                error!(
                    "vCPU {}: rebind clone on CPU {} failed: {:?}",
                    vcpu.raw(),
                    old_cpu.raw(),
                    e
                );
            }
        });
        monitor.rebind_imsic_end(tvm, vcpu)?;
        let cpu = host.cpus().current_cpu();
        self.bind_status = BindStatus::Bound(cpu);
        debug!("vCPU {} rebound from CPU {} to {}", vcpu.raw(), old_cpu.raw(), cpu.raw());
        Ok(())
    }

    /// Claims an interrupt file on the current CPU and hands it to the TVM.
    ///
    /// A vCPU already bound elsewhere is moved to the new file and its old file is released.
    /// Otherwise the bind happens on the next run.
    pub fn attach_interrupt_file(
        &mut self,
        domain: &TrustDomain,
        driver: &dyn InterruptFileDriver,
    ) -> Result<()> {
        self.check_domain(domain)?;
        Self::check_covi(domain)?;
        let cpu = domain.host().cpus().current_cpu();
        let file = driver.claim(cpu).ok_or(Error::ResourceExhausted)?;
        driver.convert(&file);
        if let Err(e) = domain.convert_interrupt_file(&file) {
            driver.reclaim(file);
            return Err(e);
        }

        match (self.bound_cpu(), self.file) {
            (Some(old_cpu), Some(old)) => {
                if let Err(e) = self.rebind_interrupt_file(domain, old_cpu, file.mask()) {
                    Self::release_file(domain, driver, file);
                    return Err(e);
                }
                Self::release_file(domain, driver, old);
            }
            _ => self.bind_required = true,
        }
        self.file = Some(file);
        Ok(())
    }

    /// Unbinds the vCPU and returns its interrupt file to the driver.
    pub fn detach_interrupt_file(
        &mut self,
        domain: &TrustDomain,
        driver: &dyn InterruptFileDriver,
    ) -> Result<()> {
        self.check_domain(domain)?;
        let file = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        self.bind_required = false;
        let unbound = match self.bound_cpu() {
            Some(cpu) => self.unbind_interrupt_file(domain, cpu),
            None => Ok(()),
        };
        Self::release_file(domain, driver, file);
        unbound
    }

    // Takes `file` back from the TSM and returns it to the driver. A file the TSM keeps is leaked.
    fn release_file(domain: &TrustDomain, driver: &dyn InterruptFileDriver, file: InterruptFile) {
        match domain.claim_interrupt_file(&file) {
            Ok(()) => driver.reclaim(file),
            Err(e) => error!(
                "leaking interrupt file {} on CPU {}: {:?}",
                file.phys,
                file.cpu.raw(),
                e
            ),
        }
    }

    /// Tells the TSM where the vCPU's virtual IMSIC lives in guest physical address space.
    pub fn set_imsic_addr(&mut self, domain: &TrustDomain, addr: GuestPageAddr) -> Result<()> {
        self.check_domain(domain)?;
        Self::check_covi(domain)?;
        domain.check_pre_finalize()?;
        domain.host().monitor().set_imsic_addr(self.tvm, self.id, addr)?;
        self.imsic_addr = Some(addr);
        Ok(())
    }

    /// Injects external interrupt `id`, provided the guest has allowed it.
    pub fn inject_external_interrupt(&self, domain: &TrustDomain, id: u64) -> Result<()> {
        self.check_domain(domain)?;
        Self::check_covi(domain)?;
        if !self.allowed.is_allowed(id) {
            return Err(Error::InvalidArgument);
        }
        domain
            .host()
            .monitor()
            .inject_ext_interrupt(self.tvm, self.id, id)
    }

    /// Allows injection of the selected external interrupts.
    pub fn allow_external_interrupt(&mut self, sel: InterruptSelector) -> Result<()> {
        self.allowed.allow(sel)
    }

    /// Denies injection of the selected external interrupts.
    pub fn deny_external_interrupt(&mut self, sel: InterruptSelector) -> Result<()> {
        self.allowed.deny(sel)
    }

    pub fn is_interrupt_allowed(&self, id: u64) -> bool {
        self.allowed.is_allowed(id)
    }

    /// Tears down the vCPU. Its state pages stay with the TSM until the TVM is destroyed.
    pub fn destroy(self, domain: &TrustDomain) {
        if self.file.is_some() {
            warn!("vCPU {} destroyed with an attached interrupt file", self.id.raw());
        }
        if let Some(record) = self.state_pages {
            // Once the TVM is gone the pages can be reclaimed right away.
            if let Err(r) = domain.track(Collection::PendingReclaim, record) {
                domain.discard(r.record);
            }
        }
        domain.unregister_vcpu(self.id);
    }
}
