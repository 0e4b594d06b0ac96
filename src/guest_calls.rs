// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Handlers for the COVG calls a TVM makes to the host, and for an ordinary VM asking to be
//! promoted.

use alloc::vec::Vec;
use log::{debug, error, warn};
use riscv_pages::{GuestPageAddr, GuestPageRange, GuestPhysAddr};
use sbi_rs::{
    CovgFunction, CovhFunction, Error as SbiError, InterruptSelector, SbiMessage, SbiReturn,
};

use crate::cove::CoveHost;
use crate::error::{Error, Result};
use crate::host::{VcpuId, VmHooks};
use crate::page_ledger::{Collection, Mapping, PageLedger, PageRecord};
use crate::tvm::{PromoteRequest, TrustDomain};
use crate::vcpu::ExecutionContext;

// Pulls `gpa` out of the TVM's stage-2 mappings. The mapping is restored if it can't be removed.
fn remove_from_guest(domain: &TrustDomain, requester: VcpuId, gpa: GuestPageAddr) -> Result<()> {
    let monitor = domain.host().monitor();
    let page = GuestPageRange::with_pages(gpa, 1).ok_or(Error::InvalidArgument)?;
    monitor.invalidate_pages(domain.id(), page)?;
    let removed = domain
        .fence(Some(requester))
        .and_then(|_| monitor.remove_pages(domain.id(), page));
    if let Err(e) = removed {
        warn!("TVM {}: removing {} failed: {:?}", domain.id().raw(), gpa, e);
        if let Err(ve) = monitor.validate_pages(domain.id(), page) {
            error!(
                "TVM {}: revalidating {} failed: {:?}",
                domain.id().raw(),
                gpa,
                ve
            );
        }
        return Err(e);
    }
    Ok(())
}

fn share_page(domain: &TrustDomain, requester: VcpuId, gpa: GuestPageAddr) -> Result<u64> {
    let existing = domain.with_ledger(|l| l.find(gpa).map(|(c, r)| (c, r.phys())));
    match existing {
        Some((Collection::Zero, _)) => {
            remove_from_guest(domain, requester, gpa)?;
            let record = domain
                .with_ledger(|l| l.take(Collection::Zero, gpa))
                .ok_or(Error::InvalidArgument)?;
            match PageLedger::share_removed(domain.host().monitor(), record) {
                Ok(record) => {
                    let phys = record.phys();
                    domain
                        .track(Collection::Shared, record)
                        .map_err(|r| {
                            r.record.release(domain.host().memory());
                            r.error
                        })?;
                    Ok(phys.bits())
                }
                Err(r) => {
                    // Still confidential; destroying the TVM retries the reclaim.
                    if let Err(t) = domain.track(Collection::Zero, r.record) {
                        error!("leaking {}: {:?}", t.record.phys(), t.error);
                    }
                    Err(r.error)
                }
            }
        }
        Some((Collection::Shared, phys)) => Ok(phys.bits()),
        Some(_) => Err(Error::InvalidArgument),
        None => {
            let memory = domain.host().memory();
            let hva = domain
                .vm()
                .gpa_to_hva(gpa.into())
                .ok_or(Error::InvalidArgument)?;
            let page = memory.pin(hva)?;
            let record = PageRecord::pinned(page, Mapping { gpa, hva });
            domain
                .with_ledger(|l| l.share_pinned(record))
                .map_err(|r| {
                    memory.unpin(r.record.page(), false);
                    r.error
                })?;
            Ok(page.phys().bits())
        }
    }
}

/// Converts `[addr, addr + len)` of the TVM's memory from confidential to shared.
///
/// Zero-filled confidential pages are removed from the guest and reclaimed; pages the guest
/// never touched are pinned and shared directly. Returns the host physical address of the last
/// page shared.
pub fn share_memory(
    domain: &TrustDomain,
    requester: VcpuId,
    addr: u64,
    len: u64,
) -> Result<u64> {
    let range = GuestPageRange::from_raw(addr, len).ok_or(Error::InvalidArgument)?;
    domain.check_live()?;
    let mut last = 0;
    for gpa in range.pages() {
        last = share_page(domain, requester, gpa)?;
    }
    debug!("TVM {}: shared {:#x}+{:#x}", domain.id().raw(), addr, len);
    Ok(last)
}

/// Converts `[addr, addr + len)` back from shared to confidential. The pages are removed from
/// the guest and unpinned; the next access faults in fresh confidential pages.
pub fn unshare_memory(
    domain: &TrustDomain,
    requester: VcpuId,
    addr: u64,
    len: u64,
) -> Result<()> {
    let range = GuestPageRange::from_raw(addr, len).ok_or(Error::InvalidArgument)?;
    domain.check_live()?;
    for gpa in range.pages() {
        if domain.collection_of(gpa) != Some(Collection::Shared) {
            return Err(Error::InvalidArgument);
        }
        remove_from_guest(domain, requester, gpa)?;
        if let Some(record) = domain.with_ledger(|l| l.unshare(gpa)) {
            record.release(domain.host().memory());
        }
    }
    debug!("TVM {}: unshared {:#x}+{:#x}", domain.id().raw(), addr, len);
    Ok(())
}

/// Handles a guest's request to turn its ordinary VM into a TVM. `regs` are the caller's a0-a7
/// and `resume_pc` is where it continues once promoted.
pub fn promote_self<'a>(
    host: &'a CoveHost<'a>,
    vm: &'a dyn VmHooks,
    existing: Option<&TrustDomain>,
    caller: VcpuId,
    vcpus: &[VcpuId],
    regs: &[u64; 8],
    resume_pc: u64,
) -> Result<(TrustDomain<'a>, Vec<ExecutionContext>)> {
    if existing.is_some() {
        return Err(Error::InvalidState);
    }
    let request = match SbiMessage::from_regs(regs)? {
        SbiMessage::CovH(CovhFunction::PromoteToTvm {
            fdt_addr, tap_addr, ..
        }) => PromoteRequest {
            fdt_addr: GuestPhysAddr::new(fdt_addr),
            tap_addr: GuestPhysAddr::new(tap_addr),
            sepc: resume_pc,
        },
        _ => return Err(Error::InvalidArgument),
    };
    TrustDomain::promote(host, vm, caller, vcpus, request)
}

fn handle_covg(domain: &TrustDomain, vcpu: &mut ExecutionContext, f: CovgFunction) -> Result<u64> {
    use CovgFunction::*;
    match f {
        // MMIO is emulated by the VMM from the faults it already sees.
        AddMmioRegion { .. } | RemoveMmioRegion { .. } => Ok(0),
        ShareMemory { addr, len } => share_memory(domain, vcpu.id(), addr, len),
        UnshareMemory { addr, len } => unshare_memory(domain, vcpu.id(), addr, len).map(|_| 0),
        AllowExternalInterrupt { id } => {
            let sel = InterruptSelector::from_raw(id)?;
            vcpu.allow_external_interrupt(sel).map(|_| 0)
        }
        DenyExternalInterrupt { id } => {
            let sel = InterruptSelector::from_raw(id)?;
            vcpu.deny_external_interrupt(sel).map(|_| 0)
        }
    }
}

/// Dispatches an ecall made by `vcpu` of a TVM, with `regs` holding its a0-a7. Only COVG calls
/// are served; a TVM asking to be promoted again is denied.
pub fn handle_guest_call(
    domain: &TrustDomain,
    vcpu: &mut ExecutionContext,
    regs: &[u64; 8],
) -> SbiReturn {
    let result = match SbiMessage::from_regs(regs) {
        Ok(SbiMessage::CovG(f)) => handle_covg(domain, vcpu, f),
        Ok(SbiMessage::CovH(CovhFunction::PromoteToTvm { .. })) => Err(Error::InvalidState),
        Ok(msg) => {
            debug!("vCPU {}: unhandled call {:?}", vcpu.id().raw(), msg);
            Err(Error::Unsupported)
        }
        Err(e) => Err(e.into()),
    };
    result.map_err(SbiError::from).into()
}
