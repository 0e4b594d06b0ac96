// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Fakes of the TSM and of the host kernel services, for unit tests.
//!
//! `FakeTsm` decodes every `SbiMessage` it's sent and keeps a model of what a real TSM would:
//! which host pages are confidential and which TVM owns them, each TVM's stage-2 mappings, its
//! vCPUs and the interrupt files bound to them. Calls that a real TSM would refuse fail the same
//! way, so tests catch ordering mistakes such as reclaiming a page still mapped into a live TVM.

use std::collections::{BTreeMap, BTreeSet};
use std::vec::Vec;

use flagset::FlagSet;
use riscv_pages::{
    GuestPageRange, GuestPhysAddr, HostPageAddr, HostPhysAddr, HostVirtAddr, HostVirtPageAddr,
    PageSize,
};
use sbi_rs::{
    BaseFunction, CovhFunction, CoviFunction, Error as SbiError, Result as SbiResult, SbiMessage,
    TsmCapability, TsmInfo, TsmState, TvmAiaParams, TvmCreateParams, EXT_BASE, EXT_COVH,
    EXT_COVI,
};
use spin::Mutex;

use crate::config::{CoveConfig, PGD_ALIGN, PGD_PAGES};
use crate::cove::CoveHost;
use crate::error::{Error, Result};
use crate::host::{
    CpuDispatch, CpuId, HostMemory, HostPage, InterruptFile, InterruptFileDriver, Memslot,
    Scheduler, VcpuId, VmHooks,
};
use crate::monitor::{Ecall, Monitor, TvmId};

const PAGE: u64 = PageSize::Size4k as u64;

pub const FAKE_TVM_STATE_PAGES: u64 = 2;
pub const FAKE_VCPU_STATE_PAGES: u64 = 1;
pub const FAKE_MAX_VCPUS: u64 = 8;
/// Pages converted by `FakeTsm::create_bare_tvm()`.
pub const BARE_TVM_PAGES: usize = (PGD_PAGES + FAKE_TVM_STATE_PAGES) as usize;

/// Pinning `hva` yields the host page at `PIN_BASE + hva`.
pub const PIN_BASE: u64 = 0x1_0000_0000_0000;
const ALLOC_BASE: u64 = 0x2_0000_0000;
const IMSIC_BASE: u64 = 0x2800_0000;

/// The default guest memslot.
pub const GUEST_RAM_BASE: u64 = 0x8000_0000;
pub const GUEST_RAM_SIZE: u64 = 0x20_0000;
pub const GUEST_HVA_BASE: u64 = 0x10_0000_0000;

pub const TEST_CPUS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Zero,
    Measured,
    Shared,
}

/// The fake TSM's view of a TVM.
#[derive(Clone, Debug, Default)]
pub struct FakeTvm {
    pub live: bool,
    pub finalized: bool,
    pub entry: Option<(u64, u64)>,
    pub regions: Vec<GuestPageRange>,
    /// gpa -> (hpa, kind)
    pub mappings: BTreeMap<u64, (u64, MapKind)>,
    /// gpa -> `fences` when the page was invalidated
    pub invalidated: BTreeMap<u64, usize>,
    pub vcpus: Vec<u64>,
    pub aia: Option<TvmAiaParams>,
    pub fences: usize,
}

impl FakeTvm {
    fn in_region(&self, gpa: u64) -> bool {
        self.regions
            .iter()
            .any(|r| gpa >= r.base().bits() && gpa < r.end())
    }
}

struct Failure {
    ext: u64,
    fid: u64,
    skip: usize,
    error: SbiError,
}

struct TsmModel {
    covh: bool,
    covi: bool,
    state: TsmState,
    caps: u64,
    run_value: u64,
    // Confidential pages and the TVM each is assigned to.
    pages: BTreeMap<u64, Option<u64>>,
    tvms: BTreeMap<u64, FakeTvm>,
    next_tvm: u64,
    imsics: BTreeSet<u64>,
    // (tvm, vcpu) -> bound mask
    bindings: BTreeMap<(u64, u64), u64>,
    rebinding: BTreeMap<(u64, u64), u64>,
    calls: Vec<(u64, u64)>,
    failures: Vec<Failure>,
}

fn page_addrs(base: u64, num_pages: u64) -> impl Iterator<Item = u64> {
    (0..num_pages).map(move |i| base + i * PAGE)
}

impl TsmModel {
    fn take_failure(&mut self, ext: u64, fid: u64) -> Option<SbiError> {
        let failed = self
            .failures
            .iter()
            .position(|f| (f.ext, f.fid, f.skip) == (ext, fid, 0))
            .map(|i| self.failures.remove(i).error);
        self.failures
            .iter_mut()
            .filter(|f| f.ext == ext && f.fid == fid)
            .for_each(|f| f.skip = f.skip.saturating_sub(1));
        failed
    }

    fn live_tvm(&mut self, id: u64) -> SbiResult<&mut FakeTvm> {
        self.tvms
            .get_mut(&id)
            .filter(|t| t.live)
            .ok_or(SbiError::InvalidParam)
    }

    // Assigns converted, unassigned pages to `tvm`.
    fn assign(&mut self, tvm: u64, base: u64, num_pages: u64) -> SbiResult<()> {
        if base % PAGE != 0 || num_pages == 0 {
            return Err(SbiError::InvalidParam);
        }
        if !page_addrs(base, num_pages).all(|p| self.pages.get(&p) == Some(&None)) {
            return Err(SbiError::InvalidParam);
        }
        page_addrs(base, num_pages).for_each(|p| {
            self.pages.insert(p, Some(tvm));
        });
        Ok(())
    }

    fn map(
        &mut self,
        tvm: u64,
        gpa: u64,
        hpa: u64,
        num_pages: u64,
        kind: MapKind,
    ) -> SbiResult<()> {
        let t = self.live_tvm(tvm)?;
        if page_addrs(gpa, num_pages).any(|g| t.mappings.contains_key(&g)) {
            return Err(SbiError::InvalidAddress);
        }
        for i in 0..num_pages {
            t.mappings.insert(gpa + i * PAGE, (hpa + i * PAGE, kind));
        }
        Ok(())
    }

    fn covh(&mut self, f: CovhFunction) -> SbiResult<u64> {
        use CovhFunction::*;
        if !self.covh {
            return Err(SbiError::NotSupported);
        }
        match f {
            TsmGetInfo { dest_addr, len } => {
                if len < core::mem::size_of::<TsmInfo>() as u64 {
                    return Err(SbiError::InvalidParam);
                }
                let info = TsmInfo {
                    tsm_state: self.state as u32,
                    tsm_impl_id: 0x5256,
                    tsm_version: 0x6_0000,
                    tsm_capabilities: self.caps,
                    tvm_state_pages: FAKE_TVM_STATE_PAGES,
                    tvm_max_vcpus: FAKE_MAX_VCPUS,
                    tvm_vcpu_state_pages: FAKE_VCPU_STATE_PAGES,
                };
                // Safety: `FakeMemory` translates addresses 1:1, so `dest_addr` is the `TsmInfo`
                // the caller uniquely borrowed for the call.
                unsafe { (dest_addr as *mut TsmInfo).write(info) };
                Ok(len)
            }
            TsmConvertPages {
                page_addr,
                num_pages,
            } => {
                if page_addr % PAGE != 0
                    || page_addrs(page_addr, num_pages).any(|p| self.pages.contains_key(&p))
                {
                    return Err(SbiError::InvalidParam);
                }
                page_addrs(page_addr, num_pages).for_each(|p| {
                    self.pages.insert(p, None);
                });
                Ok(0)
            }
            TsmReclaimPages {
                page_addr,
                num_pages,
            } => {
                let tvms = &self.tvms;
                let reclaimable = |owner: &Option<u64>| match owner {
                    Some(t) => !tvms.get(t).map(|t| t.live).unwrap_or(false),
                    None => true,
                };
                if !page_addrs(page_addr, num_pages)
                    .all(|p| self.pages.get(&p).map(reclaimable).unwrap_or(false))
                {
                    return Err(SbiError::InvalidParam);
                }
                page_addrs(page_addr, num_pages).for_each(|p| {
                    self.pages.remove(&p);
                });
                Ok(0)
            }
            TsmInitiateFence | TsmLocalFence => Ok(0),
            CreateTvm { params_addr, len } => {
                if len < core::mem::size_of::<TvmCreateParams>() as u64 {
                    return Err(SbiError::InvalidParam);
                }
                // Safety: as for `TsmGetInfo`; the caller borrows the params for the call.
                let params = unsafe { (params_addr as *const TvmCreateParams).read() };
                if params.tvm_page_directory_addr % PGD_ALIGN != 0 {
                    return Err(SbiError::InvalidParam);
                }
                let id = self.next_tvm;
                self.assign(id, params.tvm_page_directory_addr, PGD_PAGES)?;
                if let Err(e) = self.assign(id, params.tvm_state_addr, FAKE_TVM_STATE_PAGES) {
                    page_addrs(params.tvm_page_directory_addr, PGD_PAGES).for_each(|p| {
                        self.pages.insert(p, None);
                    });
                    return Err(e);
                }
                self.next_tvm += 1;
                self.tvms.insert(
                    id,
                    FakeTvm {
                        live: true,
                        ..FakeTvm::default()
                    },
                );
                Ok(id)
            }
            FinalizeTvm {
                tvm_id,
                sepc,
                entry_arg,
            } => {
                let t = self.live_tvm(tvm_id)?;
                if t.finalized {
                    return Err(SbiError::InvalidParam);
                }
                t.finalized = true;
                t.entry = Some((sepc, entry_arg));
                Ok(0)
            }
            DestroyTvm { tvm_id } => {
                self.live_tvm(tvm_id)?.live = false;
                self.bindings.retain(|&(t, _), _| t != tvm_id);
                Ok(0)
            }
            AddMemoryRegion {
                tvm_id,
                guest_addr,
                len,
            } => {
                let region =
                    GuestPageRange::from_raw(guest_addr, len).ok_or(SbiError::InvalidParam)?;
                let t = self.live_tvm(tvm_id)?;
                if t.finalized || t.regions.iter().any(|r| r.overlaps(&region)) {
                    return Err(SbiError::InvalidParam);
                }
                t.regions.push(region);
                Ok(0)
            }
            AddPageTablePages {
                tvm_id,
                page_addr,
                num_pages,
            } => {
                self.live_tvm(tvm_id)?;
                self.assign(tvm_id, page_addr, num_pages)?;
                Ok(0)
            }
            AddMeasuredPages {
                tvm_id,
                src_addr,
                dest_addr,
                num_pages,
                guest_addr,
                ..
            } => {
                let src_confidential = self.pages.contains_key(&src_addr);
                let t = self.live_tvm(tvm_id)?;
                if t.finalized
                    || src_confidential
                    || !page_addrs(guest_addr, num_pages).all(|g| t.in_region(g))
                {
                    return Err(SbiError::InvalidParam);
                }
                self.assign(tvm_id, dest_addr, num_pages)?;
                self.map(tvm_id, guest_addr, dest_addr, num_pages, MapKind::Measured)?;
                Ok(0)
            }
            AddZeroPages {
                tvm_id,
                page_addr,
                num_pages,
                guest_addr,
                ..
            } => {
                self.live_tvm(tvm_id)?;
                self.assign(tvm_id, page_addr, num_pages)?;
                self.map(tvm_id, guest_addr, page_addr, num_pages, MapKind::Zero)?;
                Ok(0)
            }
            AddSharedPages {
                tvm_id,
                page_addr,
                num_pages,
                guest_addr,
                ..
            } => {
                if page_addrs(page_addr, num_pages).any(|p| self.pages.contains_key(&p)) {
                    return Err(SbiError::InvalidParam);
                }
                self.map(tvm_id, guest_addr, page_addr, num_pages, MapKind::Shared)?;
                Ok(0)
            }
            CreateVcpu {
                tvm_id,
                vcpu_id,
                state_page_addr,
            } => {
                if self.live_tvm(tvm_id)?.vcpus.contains(&vcpu_id) {
                    return Err(SbiError::InvalidParam);
                }
                if state_page_addr != 0 {
                    self.assign(tvm_id, state_page_addr, FAKE_VCPU_STATE_PAGES)?;
                }
                self.live_tvm(tvm_id)?.vcpus.push(vcpu_id);
                Ok(0)
            }
            RunVcpu { tvm_id, vcpu_id } => {
                let run_value = self.run_value;
                let t = self.live_tvm(tvm_id)?;
                if !t.finalized || !t.vcpus.contains(&vcpu_id) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(run_value)
            }
            TvmInitiateFence { tvm_id } => {
                self.live_tvm(tvm_id)?.fences += 1;
                Ok(0)
            }
            InvalidatePages {
                tvm_id,
                guest_addr,
                len,
            } => {
                let t = self.live_tvm(tvm_id)?;
                let fences = t.fences;
                page_addrs(guest_addr, len / PAGE).for_each(|g| {
                    t.invalidated.insert(g, fences);
                });
                Ok(0)
            }
            ValidatePages {
                tvm_id,
                guest_addr,
                len,
            } => {
                let t = self.live_tvm(tvm_id)?;
                page_addrs(guest_addr, len / PAGE).for_each(|g| {
                    t.invalidated.remove(&g);
                });
                Ok(0)
            }
            PromotePage { tvm_id, .. } | DemotePage { tvm_id, .. } => {
                self.live_tvm(tvm_id)?;
                Ok(0)
            }
            RemovePages {
                tvm_id,
                guest_addr,
                len,
            } => {
                let t = self.live_tvm(tvm_id)?;
                let gpas: Vec<u64> = page_addrs(guest_addr, len / PAGE).collect();
                if gpas.iter().any(|g| !t.invalidated.contains_key(g)) {
                    return Err(SbiError::InvalidParam);
                }
                // Stale translations may remain until the TVM is fenced after invalidation.
                let fences = t.fences;
                if gpas.iter().any(|g| t.invalidated.get(g) >= Some(&fences)) {
                    return Err(SbiError::Failed);
                }
                let mut freed = Vec::new();
                for g in gpas {
                    t.invalidated.remove(&g);
                    if let Some((hpa, kind)) = t.mappings.remove(&g) {
                        if kind != MapKind::Shared {
                            freed.push(hpa);
                        }
                    }
                }
                for hpa in freed {
                    self.pages.insert(hpa, None);
                }
                Ok(0)
            }
            PromoteToTvm { sepc, .. } => {
                let id = self.next_tvm;
                self.next_tvm += 1;
                self.tvms.insert(
                    id,
                    FakeTvm {
                        live: true,
                        finalized: true,
                        entry: Some((sepc, 0)),
                        ..FakeTvm::default()
                    },
                );
                Ok(id)
            }
        }
    }

    fn covi(&mut self, f: CoviFunction) -> SbiResult<u64> {
        use CoviFunction::*;
        if !self.covi {
            return Err(SbiError::NotSupported);
        }
        match f {
            TvmAiaInit {
                tvm_id,
                params_addr,
                len,
            } => {
                if len < core::mem::size_of::<TvmAiaParams>() as u64 {
                    return Err(SbiError::InvalidParam);
                }
                // Safety: as for `TsmGetInfo`; the caller borrows the params for the call.
                let params = unsafe { (params_addr as *const TvmAiaParams).read() };
                let t = self.live_tvm(tvm_id)?;
                if t.finalized {
                    return Err(SbiError::InvalidParam);
                }
                t.aia = Some(params);
                Ok(0)
            }
            TvmCpuSetImsicAddr { tvm_id, vcpu_id, .. }
            | TvmCpuInjectExtInterrupt { tvm_id, vcpu_id, .. } => {
                if !self.live_tvm(tvm_id)?.vcpus.contains(&vcpu_id) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(0)
            }
            TsmConvertImsic { imsic_addr } => {
                if !self.imsics.insert(imsic_addr) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(0)
            }
            TsmReclaimImsic { imsic_addr } => {
                if !self.imsics.remove(&imsic_addr) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(0)
            }
            TvmCpuBindImsic {
                tvm_id,
                vcpu_id,
                imsic_mask,
            } => {
                if !self.live_tvm(tvm_id)?.finalized
                    || self.bindings.contains_key(&(tvm_id, vcpu_id))
                {
                    return Err(SbiError::InvalidParam);
                }
                self.bindings.insert((tvm_id, vcpu_id), imsic_mask);
                Ok(0)
            }
            TvmCpuUnbindImsicBegin { tvm_id, vcpu_id } => {
                if !self.bindings.contains_key(&(tvm_id, vcpu_id)) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(0)
            }
            TvmCpuUnbindImsicEnd { tvm_id, vcpu_id } => {
                self.bindings
                    .remove(&(tvm_id, vcpu_id))
                    .ok_or(SbiError::InvalidParam)?;
                Ok(0)
            }
            TvmRebindImsicBegin {
                tvm_id,
                vcpu_id,
                imsic_mask,
            } => {
                if !self.bindings.contains_key(&(tvm_id, vcpu_id)) {
                    return Err(SbiError::InvalidParam);
                }
                self.rebinding.insert((tvm_id, vcpu_id), imsic_mask);
                Ok(0)
            }
            TvmRebindImsicClone { tvm_id, vcpu_id } => {
                if !self.rebinding.contains_key(&(tvm_id, vcpu_id)) {
                    return Err(SbiError::InvalidParam);
                }
                Ok(0)
            }
            TvmRebindImsicEnd { tvm_id, vcpu_id } => {
                let mask = self
                    .rebinding
                    .remove(&(tvm_id, vcpu_id))
                    .ok_or(SbiError::InvalidParam)?;
                self.bindings.insert((tvm_id, vcpu_id), mask);
                Ok(0)
            }
        }
    }
}

/// A TSM that keeps its state in host memory.
pub struct FakeTsm {
    model: Mutex<TsmModel>,
}

impl FakeTsm {
    pub fn new() -> Self {
        let caps = FlagSet::from(TsmCapability::PromoteTvm) | TsmCapability::Aia;
        Self {
            model: Mutex::new(TsmModel {
                covh: true,
                covi: true,
                state: TsmState::TsmReady,
                caps: caps.bits(),
                run_value: 0,
                pages: BTreeMap::new(),
                tvms: BTreeMap::new(),
                next_tvm: 1,
                imsics: BTreeSet::new(),
                bindings: BTreeMap::new(),
                rebinding: BTreeMap::new(),
                calls: Vec::new(),
                failures: Vec::new(),
            }),
        }
    }

    /// Fails the next call to `fid` of `ext` with `error`.
    pub fn fail_next(&self, ext: u64, fid: u64, error: SbiError) {
        self.fail_nth(ext, fid, 0, error);
    }

    /// Fails the `n`th (counting from 0) upcoming call to `fid` of `ext` with `error`.
    pub fn fail_nth(&self, ext: u64, fid: u64, n: usize, error: SbiError) {
        self.model.lock().failures.push(Failure {
            ext,
            fid,
            skip: n,
            error,
        });
    }

    /// Returns the number of calls made to `fid` of `ext`, failed ones included.
    pub fn count(&self, ext: u64, fid: u64) -> usize {
        self.model
            .lock()
            .calls
            .iter()
            .filter(|&&c| c == (ext, fid))
            .count()
    }

    /// Returns the function IDs of every COVH call, in order.
    pub fn covh_calls(&self) -> Vec<u64> {
        self.model
            .lock()
            .calls
            .iter()
            .filter(|c| c.0 == EXT_COVH)
            .map(|c| c.1)
            .collect()
    }

    pub fn disable_covh(&self) {
        self.model.lock().covh = false;
    }

    pub fn disable_covi(&self) {
        self.model.lock().covi = false;
    }

    pub fn set_state(&self, state: TsmState) {
        self.model.lock().state = state;
    }

    pub fn set_capabilities(&self, caps: FlagSet<TsmCapability>) {
        self.model.lock().caps = caps.bits();
    }

    /// Sets the value `RunVcpu` returns.
    pub fn set_run_value(&self, value: u64) {
        self.model.lock().run_value = value;
    }

    pub fn is_assigned(&self, page: HostPageAddr) -> bool {
        matches!(self.model.lock().pages.get(&page.bits()), Some(Some(_)))
    }

    pub fn is_confidential(&self, phys: u64) -> bool {
        self.model.lock().pages.contains_key(&phys)
    }

    pub fn confidential_pages(&self) -> usize {
        self.model.lock().pages.len()
    }

    pub fn live_tvms(&self) -> usize {
        self.model.lock().tvms.values().filter(|t| t.live).count()
    }

    pub fn tvm(&self, id: TvmId) -> Option<FakeTvm> {
        self.model.lock().tvms.get(&id.raw()).cloned()
    }

    /// Returns the page mapped at `gpa` in `tvm` and how it was mapped.
    pub fn mapping(&self, tvm: TvmId, gpa: u64) -> Option<(u64, MapKind)> {
        self.model
            .lock()
            .tvms
            .get(&tvm.raw())
            .and_then(|t| t.mappings.get(&gpa).copied())
    }

    pub fn imsic_converted(&self, phys: HostPageAddr) -> bool {
        self.model.lock().imsics.contains(&phys.bits())
    }

    pub fn imsic_binding(&self, tvm: TvmId, vcpu: u64) -> Option<u64> {
        self.model.lock().bindings.get(&(tvm.raw(), vcpu)).copied()
    }

    /// Creates a TVM with only its root table and state pages, bypassing `TrustDomain`.
    pub fn create_bare_tvm(&self, monitor: &Monitor, memory: &FakeMemory) -> TvmId {
        let pgd = memory.alloc_pages(PGD_PAGES, PGD_ALIGN).unwrap();
        let state = memory.alloc_pages(FAKE_TVM_STATE_PAGES, PAGE).unwrap();
        monitor.convert_pages(pgd.phys(), pgd.count()).unwrap();
        monitor.convert_pages(state.phys(), state.count()).unwrap();
        monitor.initiate_fence().unwrap();
        let params = TvmCreateParams {
            tvm_page_directory_addr: pgd.phys().bits(),
            tvm_state_addr: state.phys().bits(),
        };
        monitor.create_tvm(&params, memory).unwrap()
    }

    pub fn destroy_bare_tvm(&self, monitor: &Monitor, tvm: TvmId) {
        monitor.destroy_tvm(tvm).unwrap();
    }
}

impl Ecall for FakeTsm {
    unsafe fn send(&self, msg: &SbiMessage) -> SbiResult<u64> {
        let mut model = self.model.lock();
        let (ext, fid) = (msg.a7(), msg.a6());
        model.calls.push((ext, fid));
        if let Some(e) = model.take_failure(ext, fid) {
            return Err(e);
        }
        match *msg {
            SbiMessage::Base(BaseFunction::ProbeSbiExtension(probed)) => Ok(match probed {
                EXT_BASE => 1,
                EXT_COVH => model.covh as u64,
                EXT_COVI => model.covi as u64,
                _ => 0,
            }),
            SbiMessage::Base(BaseFunction::GetSpecificationVersion) => Ok(0x0100_0000),
            SbiMessage::CovH(f) => model.covh(f),
            SbiMessage::CovI(f) => model.covi(f),
            SbiMessage::CovG(_) => Err(SbiError::NotSupported),
        }
    }
}

struct MemoryModel {
    pinned: Vec<u64>,
    allocated: BTreeMap<u64, u64>,
    next: u64,
    alloc_budget: Option<usize>,
}

/// Host memory backed by nothing. Addresses translate 1:1 and pinned pages live at
/// `PIN_BASE + hva`.
pub struct FakeMemory {
    model: Mutex<MemoryModel>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(MemoryModel {
                pinned: Vec::new(),
                allocated: BTreeMap::new(),
                next: ALLOC_BASE,
                alloc_budget: None,
            }),
        }
    }

    /// Lets the next `n` allocations succeed and fails every one after.
    pub fn fail_alloc_after(&self, n: usize) {
        self.model.lock().alloc_budget = Some(n);
    }

    pub fn pinned_pages(&self) -> usize {
        self.model.lock().pinned.len()
    }

    pub fn allocated_pages(&self) -> usize {
        self.model.lock().allocated.values().sum::<u64>() as usize
    }
}

impl HostMemory for FakeMemory {
    fn pin(&self, hva: HostVirtAddr) -> Result<HostPage> {
        let page = HostVirtPageAddr::new(hva).ok_or(Error::InvalidArgument)?;
        let phys = PIN_BASE + page.bits();
        self.model.lock().pinned.push(phys);
        Ok(HostPage::new(HostPageAddr::from_bits(phys).unwrap(), 1))
    }

    fn unpin(&self, page: HostPage, _dirty: bool) {
        let mut model = self.model.lock();
        let idx = model
            .pinned
            .iter()
            .position(|&p| p == page.phys().bits())
            .expect("unpinning a page that isn't pinned");
        model.pinned.remove(idx);
    }

    fn alloc_pages(&self, count: u64, align: u64) -> Option<HostPage> {
        let mut model = self.model.lock();
        if let Some(budget) = model.alloc_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let phys = (model.next + align - 1) & !(align - 1);
        model.next = phys + count * PAGE;
        model.allocated.insert(phys, count);
        Some(HostPage::new(HostPageAddr::from_bits(phys).unwrap(), count))
    }

    fn free_pages(&self, page: HostPage) {
        let count = self.model.lock().allocated.remove(&page.phys().bits());
        assert_eq!(count, Some(page.count()), "freeing pages that weren't allocated");
    }

    fn virt_to_phys(&self, va: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::new(va.bits())
    }
}

/// CPUs `0..n`; `run_on()` runs the closure in place as if on the target CPU.
pub struct FakeCpus {
    num_cpus: usize,
    current: Mutex<CpuId>,
    run_log: Mutex<Vec<CpuId>>,
}

impl FakeCpus {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            current: Mutex::new(CpuId::new(0)),
            run_log: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current(&self, cpu: CpuId) {
        *self.current.lock() = cpu;
    }

    /// Returns the targets of every `run_on()` call.
    pub fn run_log(&self) -> Vec<CpuId> {
        self.run_log.lock().clone()
    }
}

impl CpuDispatch for FakeCpus {
    fn current_cpu(&self) -> CpuId {
        *self.current.lock()
    }

    fn run_on(&self, cpu: CpuId, f: &mut dyn FnMut()) {
        self.run_log.lock().push(cpu);
        let prev = core::mem::replace(&mut *self.current.lock(), cpu);
        f();
        *self.current.lock() = prev;
    }

    fn run_on_each(&self, f: &(dyn Fn(CpuId) + Sync)) {
        (0..self.num_cpus).for_each(|i| f(CpuId::new(i)));
    }
}

#[derive(Default)]
struct SchedModel {
    checks_left: Option<usize>,
    yields: usize,
}

#[derive(Default)]
pub struct FakeSched {
    model: Mutex<SchedModel>,
}

impl FakeSched {
    /// Reports a pending termination from the `n + 1`th check on.
    pub fn terminate_after(&self, n: usize) {
        self.model.lock().checks_left = Some(n);
    }

    pub fn yields(&self) -> usize {
        self.model.lock().yields
    }
}

impl Scheduler for FakeSched {
    fn termination_pending(&self) -> bool {
        let mut model = self.model.lock();
        match model.checks_left.as_mut() {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    fn yield_if_needed(&self) {
        self.model.lock().yields += 1;
    }
}

/// A VM with one memslot covering `GUEST_RAM_BASE..+GUEST_RAM_SIZE`.
pub struct FakeVm {
    slots: Vec<Memslot>,
    exits: Mutex<Vec<VcpuId>>,
    ordinary: Mutex<Vec<(u64, u64)>>,
    published: Mutex<Vec<VcpuId>>,
}

impl FakeVm {
    pub fn new() -> Self {
        Self {
            slots: vec![Memslot {
                gpa: GuestPageRange::from_raw(GUEST_RAM_BASE, GUEST_RAM_SIZE).unwrap(),
                hva: HostVirtAddr::new(GUEST_HVA_BASE),
            }],
            exits: Mutex::new(Vec::new()),
            ordinary: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    fn lookup(&self, gpa: u64) -> Option<HostVirtAddr> {
        self.slots
            .iter()
            .find(|s| gpa >= s.gpa.base().bits() && gpa < s.gpa.end())
            .map(|s| HostVirtAddr::new(s.hva.bits() + gpa - s.gpa.base().bits()))
    }

    /// Returns the host mapping of guest address `gpa`, which must be in a memslot.
    pub fn hva_of(&self, gpa: u64) -> HostVirtAddr {
        self.lookup(gpa).unwrap()
    }

    pub fn exit_requests(&self) -> Vec<VcpuId> {
        self.exits.lock().clone()
    }

    pub fn ordinary_mappings(&self) -> usize {
        self.ordinary.lock().len()
    }

    pub fn published(&self) -> Vec<VcpuId> {
        self.published.lock().clone()
    }
}

impl VmHooks for FakeVm {
    fn request_exit(&self, vcpu: VcpuId) {
        self.exits.lock().push(vcpu);
    }

    fn gpa_to_hva(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        self.lookup(gpa.bits())
    }

    fn memslots(&self) -> Vec<Memslot> {
        self.slots.clone()
    }

    fn map_ordinary(&self, gpa: GuestPhysAddr, hva: HostVirtAddr) -> Result<()> {
        self.ordinary.lock().push((gpa.bits(), hva.bits()));
        Ok(())
    }

    fn publish_registers(&self, vcpu: VcpuId) -> Result<()> {
        self.published.lock().push(vcpu);
        Ok(())
    }
}

#[derive(Default)]
struct IrqModel {
    next_hgei: BTreeMap<usize, u32>,
    outstanding: Vec<InterruptFile>,
}

/// Hands out guest interrupt files 1..=7 of each CPU.
#[derive(Default)]
pub struct FakeIrqDriver {
    model: Mutex<IrqModel>,
}

impl FakeIrqDriver {
    /// Returns the number of claimed files not yet returned.
    pub fn outstanding(&self) -> usize {
        self.model.lock().outstanding.len()
    }
}

impl InterruptFileDriver for FakeIrqDriver {
    fn claim(&self, cpu: CpuId) -> Option<InterruptFile> {
        let mut model = self.model.lock();
        let hgei = model.next_hgei.entry(cpu.raw()).or_insert(1);
        if *hgei > 7 {
            return None;
        }
        let file = InterruptFile {
            cpu,
            hgei: *hgei,
            phys: HostPageAddr::from_bits(
                IMSIC_BASE + (cpu.raw() as u64) * 8 * PAGE + u64::from(*hgei) * PAGE,
            )?,
        };
        *hgei += 1;
        model.outstanding.push(file);
        Some(file)
    }

    fn convert(&self, _file: &InterruptFile) {}

    fn reclaim(&self, file: InterruptFile) {
        let mut model = self.model.lock();
        let idx = model
            .outstanding
            .iter()
            .position(|f| *f == file)
            .expect("reclaiming a file that wasn't claimed");
        model.outstanding.remove(idx);
    }
}

/// Everything a `CoveHost` needs, faked.
pub struct TestEnv {
    pub tsm: FakeTsm,
    pub memory: FakeMemory,
    pub cpus: FakeCpus,
    pub sched: FakeSched,
    pub vm: FakeVm,
    pub irq: FakeIrqDriver,
    config: CoveConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(CoveConfig::default())
    }

    pub fn with_config(config: CoveConfig) -> Self {
        Self {
            tsm: FakeTsm::new(),
            memory: FakeMemory::new(),
            cpus: FakeCpus::new(TEST_CPUS),
            sched: FakeSched::default(),
            vm: FakeVm::new(),
            irq: FakeIrqDriver::default(),
            config,
        }
    }

    /// An environment whose TSM doesn't implement COVI.
    pub fn without_covi() -> Self {
        let env = Self::new();
        env.tsm.disable_covi();
        env
    }

    /// Connects a `CoveHost` to the fakes. Customize the TSM before calling this.
    pub fn host(&self) -> CoveHost<'_> {
        CoveHost::init(
            &self.tsm,
            &self.memory,
            &self.cpus,
            &self.sched,
            self.config,
        )
        .unwrap()
    }
}
