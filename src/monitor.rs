// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Typed wrappers around the COVH and COVI calls into the TSM.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use core::arch::asm;

use riscv_pages::{GuestPageAddr, GuestPageRange, GuestPhysAddr, HostPageAddr, HostVirtAddr};
use sbi_rs::{
    BaseFunction, CovhFunction, CoviFunction, Result as SbiResult, SbiMessage, TsmInfo,
    TsmPageType, TvmAiaParams, TvmCreateParams,
};

use crate::error::Result;
use crate::host::{HostMemory, VcpuId};

/// The identifier the TSM assigned to a TVM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TvmId(u64);

impl TvmId {
    pub fn new(raw: u64) -> Self {
        TvmId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A transport for SBI calls to the TSM.
pub trait Ecall: Sync {
    /// Sends `msg` and returns the decoded a0/a1 result.
    ///
    /// # Safety
    ///
    /// The caller must verify that any memory references contained in `msg` obey Rust's memory
    /// safety rules. For example, any pointers to memory that will be modified in the handling
    /// of the ecall must be uniquely owned. Similarly any pointers read by the ecall must not be
    /// mutably borrowed.
    unsafe fn send(&self, msg: &SbiMessage) -> SbiResult<u64>;
}

/// Issues calls with the `ecall` instruction to the firmware below us.
pub struct FirmwareEcall;

impl Ecall for FirmwareEcall {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe fn send(&self, msg: &SbiMessage) -> SbiResult<u64> {
        let args = msg.args();
        // normally error code
        let mut a0;
        // normally return value
        let mut a1;
        asm!("ecall", inlateout("a0") args[0]=>a0, inlateout("a1") args[1]=>a1,
                in("a2") args[2], in("a3") args[3],
                in("a4") args[4], in("a5") args[5],
                in("a6") msg.a6(), in("a7") msg.a7(), options(nostack));

        msg.result(a0, a1)
    }

    // There's no SBI implementation beneath a hosted build.
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    unsafe fn send(&self, _msg: &SbiMessage) -> SbiResult<u64> {
        Err(sbi_rs::Error::NotSupported)
    }
}

/// Typed access to the TSM. Every call is synchronous and issued exactly once.
#[derive(Clone, Copy)]
pub struct Monitor<'a> {
    ecall: &'a dyn Ecall,
}

impl<'a> Monitor<'a> {
    pub fn new(ecall: &'a dyn Ecall) -> Self {
        Self { ecall }
    }

    // Safety: `msg` must only reference memory the TSM is allowed to access for the duration of
    // the call.
    unsafe fn send(&self, msg: SbiMessage) -> Result<u64> {
        Ok(self.ecall.send(&msg)?)
    }

    fn covh(&self, f: CovhFunction) -> Result<u64> {
        // Safety: COVH calls passed through here only carry physical addresses of pages the TSM
        // owns or is about to take ownership of, never references to hypervisor memory.
        unsafe { self.send(SbiMessage::CovH(f)) }
    }

    fn covi(&self, f: CoviFunction) -> Result<u64> {
        // Safety: as for `covh()`; interrupt files are MMIO the hypervisor never dereferences.
        unsafe { self.send(SbiMessage::CovI(f)) }
    }

    /// Returns true if the SBI implementation supports extension `ext`.
    pub fn probe_extension(&self, ext: u64) -> Result<bool> {
        let msg = SbiMessage::Base(BaseFunction::ProbeSbiExtension(ext));
        // Safety: probing doesn't touch memory.
        let present = unsafe { self.send(msg) }?;
        Ok(present != 0)
    }

    /// Reads the TSM's `TsmInfo`.
    pub fn get_info(&self, memory: &dyn HostMemory) -> Result<TsmInfo> {
        let mut info = TsmInfo::default();
        let va = HostVirtAddr::new(&mut info as *mut TsmInfo as u64);
        let msg = SbiMessage::CovH(CovhFunction::TsmGetInfo {
            dest_addr: memory.virt_to_phys(va).bits(),
            len: core::mem::size_of::<TsmInfo>() as u64,
        });
        // Safety: `info` is uniquely borrowed for the call and the TSM writes at most
        // `size_of::<TsmInfo>()` bytes to it.
        unsafe { self.send(msg) }?;
        Ok(info)
    }

    pub fn convert_pages(&self, page_addr: HostPageAddr, num_pages: u64) -> Result<()> {
        self.covh(CovhFunction::TsmConvertPages {
            page_addr: page_addr.bits(),
            num_pages,
        })?;
        Ok(())
    }

    pub fn reclaim_pages(&self, page_addr: HostPageAddr, num_pages: u64) -> Result<()> {
        self.covh(CovhFunction::TsmReclaimPages {
            page_addr: page_addr.bits(),
            num_pages,
        })?;
        Ok(())
    }

    pub fn initiate_fence(&self) -> Result<()> {
        self.covh(CovhFunction::TsmInitiateFence)?;
        Ok(())
    }

    /// Completes a fence on the calling CPU.
    pub fn local_fence(&self) -> Result<()> {
        self.covh(CovhFunction::TsmLocalFence)?;
        Ok(())
    }

    /// Creates a TVM whose root table and state live in the already-converted pages of `params`.
    pub fn create_tvm(&self, params: &TvmCreateParams, memory: &dyn HostMemory) -> Result<TvmId> {
        let va = HostVirtAddr::new(params as *const TvmCreateParams as u64);
        let msg = SbiMessage::CovH(CovhFunction::CreateTvm {
            params_addr: memory.virt_to_phys(va).bits(),
            len: core::mem::size_of::<TvmCreateParams>() as u64,
        });
        // Safety: `params` is immutably borrowed for the call and the TSM only reads it.
        let id = unsafe { self.send(msg) }?;
        Ok(TvmId(id))
    }

    pub fn finalize_tvm(&self, tvm: TvmId, sepc: u64, entry_arg: u64) -> Result<()> {
        self.covh(CovhFunction::FinalizeTvm {
            tvm_id: tvm.0,
            sepc,
            entry_arg,
        })?;
        Ok(())
    }

    pub fn destroy_tvm(&self, tvm: TvmId) -> Result<()> {
        self.covh(CovhFunction::DestroyTvm { tvm_id: tvm.0 })?;
        Ok(())
    }

    pub fn add_memory_region(&self, tvm: TvmId, region: GuestPageRange) -> Result<()> {
        self.covh(CovhFunction::AddMemoryRegion {
            tvm_id: tvm.0,
            guest_addr: region.base().bits(),
            len: region.len(),
        })?;
        Ok(())
    }

    pub fn add_pgt_pages(&self, tvm: TvmId, page_addr: HostPageAddr, num_pages: u64) -> Result<()> {
        self.covh(CovhFunction::AddPageTablePages {
            tvm_id: tvm.0,
            page_addr: page_addr.bits(),
            num_pages,
        })?;
        Ok(())
    }

    /// Copies `src` into the confidential page `dest`, extends the TVM's measurement with it and
    /// maps it at `gpa`.
    pub fn add_measured_pages(
        &self,
        tvm: TvmId,
        src: HostPageAddr,
        dest: HostPageAddr,
        page_type: TsmPageType,
        num_pages: u64,
        gpa: GuestPageAddr,
    ) -> Result<()> {
        self.covh(CovhFunction::AddMeasuredPages {
            tvm_id: tvm.0,
            src_addr: src.bits(),
            dest_addr: dest.bits(),
            page_type,
            num_pages,
            guest_addr: gpa.bits(),
        })?;
        Ok(())
    }

    pub fn add_zero_pages(
        &self,
        tvm: TvmId,
        page_addr: HostPageAddr,
        page_type: TsmPageType,
        num_pages: u64,
        gpa: GuestPageAddr,
    ) -> Result<()> {
        self.covh(CovhFunction::AddZeroPages {
            tvm_id: tvm.0,
            page_addr: page_addr.bits(),
            page_type,
            num_pages,
            guest_addr: gpa.bits(),
        })?;
        Ok(())
    }

    pub fn add_shared_pages(
        &self,
        tvm: TvmId,
        page_addr: HostPageAddr,
        page_type: TsmPageType,
        num_pages: u64,
        gpa: GuestPageAddr,
    ) -> Result<()> {
        self.covh(CovhFunction::AddSharedPages {
            tvm_id: tvm.0,
            page_addr: page_addr.bits(),
            page_type,
            num_pages,
            guest_addr: gpa.bits(),
        })?;
        Ok(())
    }

    /// Creates `vcpu` in `tvm`. `state` is absent if the TSM doesn't need donated vCPU state.
    pub fn create_vcpu(&self, tvm: TvmId, vcpu: VcpuId, state: Option<HostPageAddr>) -> Result<()> {
        self.covh(CovhFunction::CreateVcpu {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
            state_page_addr: state.map_or(0, |s| s.bits()),
        })?;
        Ok(())
    }

    /// Runs the vCPU until it exits to the host and returns the TSM's exit value.
    pub fn run_vcpu(&self, tvm: TvmId, vcpu: VcpuId) -> Result<u64> {
        self.covh(CovhFunction::RunVcpu {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
        })
    }

    pub fn tvm_initiate_fence(&self, tvm: TvmId) -> Result<()> {
        self.covh(CovhFunction::TvmInitiateFence { tvm_id: tvm.0 })?;
        Ok(())
    }

    pub fn invalidate_pages(&self, tvm: TvmId, range: GuestPageRange) -> Result<()> {
        self.covh(CovhFunction::InvalidatePages {
            tvm_id: tvm.0,
            guest_addr: range.base().bits(),
            len: range.len(),
        })?;
        Ok(())
    }

    pub fn validate_pages(&self, tvm: TvmId, range: GuestPageRange) -> Result<()> {
        self.covh(CovhFunction::ValidatePages {
            tvm_id: tvm.0,
            guest_addr: range.base().bits(),
            len: range.len(),
        })?;
        Ok(())
    }

    pub fn remove_pages(&self, tvm: TvmId, range: GuestPageRange) -> Result<()> {
        self.covh(CovhFunction::RemovePages {
            tvm_id: tvm.0,
            guest_addr: range.base().bits(),
            len: range.len(),
        })?;
        Ok(())
    }

    pub fn promote_page(
        &self,
        tvm: TvmId,
        gpa: GuestPageAddr,
        page_type: TsmPageType,
    ) -> Result<()> {
        self.covh(CovhFunction::PromotePage {
            tvm_id: tvm.0,
            guest_addr: gpa.bits(),
            page_type,
        })?;
        Ok(())
    }

    pub fn demote_page(
        &self,
        tvm: TvmId,
        gpa: GuestPageAddr,
        page_type: TsmPageType,
    ) -> Result<()> {
        self.covh(CovhFunction::DemotePage {
            tvm_id: tvm.0,
            guest_addr: gpa.bits(),
            page_type,
        })?;
        Ok(())
    }

    /// Converts the calling ordinary VM into a TVM in a single step.
    pub fn promote_to_tvm(
        &self,
        fdt_addr: GuestPhysAddr,
        tap_addr: GuestPhysAddr,
        sepc: u64,
    ) -> Result<TvmId> {
        let id = self.covh(CovhFunction::PromoteToTvm {
            fdt_addr: fdt_addr.bits(),
            tap_addr: tap_addr.bits(),
            sepc,
        })?;
        Ok(TvmId(id))
    }

    /// Configures AIA virtualization for `tvm`.
    pub fn aia_init(
        &self,
        tvm: TvmId,
        params: &TvmAiaParams,
        memory: &dyn HostMemory,
    ) -> Result<()> {
        let va = HostVirtAddr::new(params as *const TvmAiaParams as u64);
        let msg = SbiMessage::CovI(CoviFunction::TvmAiaInit {
            tvm_id: tvm.0,
            params_addr: memory.virt_to_phys(va).bits(),
            len: core::mem::size_of::<TvmAiaParams>() as u64,
        });
        // Safety: `params` is immutably borrowed for the call and the TSM only reads it.
        unsafe { self.send(msg) }?;
        Ok(())
    }

    pub fn set_imsic_addr(
        &self,
        tvm: TvmId,
        vcpu: VcpuId,
        imsic_addr: GuestPageAddr,
    ) -> Result<()> {
        self.covi(CoviFunction::TvmCpuSetImsicAddr {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
            imsic_addr: imsic_addr.bits(),
        })?;
        Ok(())
    }

    pub fn convert_imsic(&self, imsic_addr: HostPageAddr) -> Result<()> {
        self.covi(CoviFunction::TsmConvertImsic {
            imsic_addr: imsic_addr.bits(),
        })?;
        Ok(())
    }

    pub fn reclaim_imsic(&self, imsic_addr: HostPageAddr) -> Result<()> {
        self.covi(CoviFunction::TsmReclaimImsic {
            imsic_addr: imsic_addr.bits(),
        })?;
        Ok(())
    }

    pub fn bind_imsic(&self, tvm: TvmId, vcpu: VcpuId, imsic_mask: u64) -> Result<()> {
        self.covi(CoviFunction::TvmCpuBindImsic {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
            imsic_mask,
        })?;
        Ok(())
    }

    pub fn unbind_imsic_begin(&self, tvm: TvmId, vcpu: VcpuId) -> Result<()> {
        self.covi(CoviFunction::TvmCpuUnbindImsicBegin {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
        })?;
        Ok(())
    }

    pub fn unbind_imsic_end(&self, tvm: TvmId, vcpu: VcpuId) -> Result<()> {
        self.covi(CoviFunction::TvmCpuUnbindImsicEnd {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
        })?;
        Ok(())
    }

    pub fn inject_ext_interrupt(&self, tvm: TvmId, vcpu: VcpuId, interrupt_id: u64) -> Result<()> {
        self.covi(CoviFunction::TvmCpuInjectExtInterrupt {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
            interrupt_id,
        })?;
        Ok(())
    }

    pub fn rebind_imsic_begin(&self, tvm: TvmId, vcpu: VcpuId, imsic_mask: u64) -> Result<()> {
        self.covi(CoviFunction::TvmRebindImsicBegin {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
            imsic_mask,
        })?;
        Ok(())
    }

    pub fn rebind_imsic_clone(&self, tvm: TvmId, vcpu: VcpuId) -> Result<()> {
        self.covi(CoviFunction::TvmRebindImsicClone {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
        })?;
        Ok(())
    }

    pub fn rebind_imsic_end(&self, tvm: TvmId, vcpu: VcpuId) -> Result<()> {
        self.covi(CoviFunction::TvmRebindImsicEnd {
            tvm_id: tvm.0,
            vcpu_id: vcpu.raw(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_env::*;
    use sbi_rs::{EXT_COVH, EXT_COVI};

    #[test]
    fn status_is_mapped() {
        let tsm = FakeTsm::new();
        let monitor = Monitor::new(&tsm);
        let page = HostPageAddr::from_bits(0x9000_0000).unwrap();
        tsm.fail_next(EXT_COVH, 1, sbi_rs::Error::InvalidAddress);
        assert_eq!(monitor.convert_pages(page, 1), Err(Error::MonitorInvalidAddress));
        tsm.fail_next(EXT_COVH, 1, sbi_rs::Error::AlreadyAvailable);
        assert_eq!(
            monitor.convert_pages(page, 1),
            Err(Error::MonitorFailure(sbi_rs::SBI_ERR_ALREADY_AVAILABLE))
        );
        assert_eq!(monitor.convert_pages(page, 1), Ok(()));
        assert_eq!(tsm.count(EXT_COVH, 1), 3);
    }

    #[test]
    fn get_info_fills_struct() {
        let tsm = FakeTsm::new();
        let memory = FakeMemory::new();
        let monitor = Monitor::new(&tsm);
        let info = monitor.get_info(&memory).unwrap();
        assert_eq!(info.state(), sbi_rs::TsmState::TsmReady);
        assert_eq!(info.tvm_state_pages, FAKE_TVM_STATE_PAGES);
        assert_eq!(info.tvm_vcpu_state_pages, FAKE_VCPU_STATE_PAGES);
    }

    #[test]
    fn probe() {
        let tsm = FakeTsm::new();
        let monitor = Monitor::new(&tsm);
        assert_eq!(monitor.probe_extension(EXT_COVH), Ok(true));
        tsm.disable_covi();
        assert_eq!(monitor.probe_extension(EXT_COVI), Ok(false));
    }
}
