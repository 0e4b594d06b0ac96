// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the parts of the host kernel this crate relies on but doesn't implement.

use alloc::vec::Vec;
use riscv_pages::{GuestPageRange, GuestPhysAddr, HostPageAddr, HostPhysAddr, HostVirtAddr};

use crate::error::Result;

/// Identifies a physical CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a `CpuId` from the raw index.
    pub fn new(raw: usize) -> Self {
        CpuId(raw)
    }

    /// Returns the raw value of the CPU ID.
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Identifies a vCPU within its VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(u64);

impl VcpuId {
    pub fn new(raw: u64) -> Self {
        VcpuId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A run of `count` physically contiguous 4kB host pages starting at `phys`, either allocated
/// from the host or pinned behind a user mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPage {
    phys: HostPageAddr,
    count: u64,
}

impl HostPage {
    pub fn new(phys: HostPageAddr, count: u64) -> Self {
        Self { phys, count }
    }

    pub fn phys(&self) -> HostPageAddr {
        self.phys
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns if `addr` falls within this run.
    pub fn contains(&self, addr: HostPageAddr) -> bool {
        let start = self.phys.bits();
        addr.bits() >= start && (addr.bits() - start) / 4096 < self.count
    }
}

/// Host page allocation and pinning of user memory.
pub trait HostMemory: Sync {
    /// Pins the page backing `hva` for long-term use.
    fn pin(&self, hva: HostVirtAddr) -> Result<HostPage>;

    /// Releases a pin taken by `pin()`, marking the page dirty if requested.
    fn unpin(&self, page: HostPage, dirty: bool);

    /// Allocates `count` zeroed, contiguous pages aligned to `align` bytes.
    fn alloc_pages(&self, count: u64, align: u64) -> Option<HostPage>;

    /// Returns pages obtained from `alloc_pages()`.
    fn free_pages(&self, page: HostPage);

    /// Translates a host kernel virtual address to its physical address.
    fn virt_to_phys(&self, va: HostVirtAddr) -> HostPhysAddr;
}

/// Cross-CPU function dispatch.
pub trait CpuDispatch: Sync {
    /// Returns the CPU the caller is running on.
    fn current_cpu(&self) -> CpuId;

    /// Runs `f` on `cpu` and waits for it to complete.
    fn run_on(&self, cpu: CpuId, f: &mut dyn FnMut());

    /// Runs `f` on every online CPU, including the caller's, and waits for all of them.
    fn run_on_each(&self, f: &(dyn Fn(CpuId) + Sync));
}

/// Cooperative scheduling points for long-running operations.
pub trait Scheduler: Sync {
    /// Returns true if the calling task has been asked to stop.
    fn termination_pending(&self) -> bool;

    /// Gives up the CPU if another task should run.
    fn yield_if_needed(&self);
}

/// A guest memory slot: `gpa` is backed by the host mapping starting at `hva`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Memslot {
    pub gpa: GuestPageRange,
    pub hva: HostVirtAddr,
}

/// Hooks into the hypervisor's per-VM state.
pub trait VmHooks: Sync {
    /// Forces `vcpu` out of guest mode if it's running. Doesn't wait for it to exit.
    fn request_exit(&self, vcpu: VcpuId);

    /// Returns the host mapping backing `gpa`, if any.
    fn gpa_to_hva(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr>;

    /// Lists the VM's memory slots.
    fn memslots(&self) -> Vec<Memslot>;

    /// Maps `gpa` to `hva` in the VM's ordinary (non-confidential) stage-2 tables.
    fn map_ordinary(&self, gpa: GuestPhysAddr, hva: HostVirtAddr) -> Result<()>;

    /// Copies `vcpu`'s general purpose registers to the area shared with the TSM.
    fn publish_registers(&self, vcpu: VcpuId) -> Result<()>;
}

/// A guest interrupt file on a physical CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptFile {
    pub cpu: CpuId,
    /// Guest external interrupt number; bit `hgei` selects the file in bind masks.
    pub hgei: u32,
    pub phys: HostPageAddr,
}

impl InterruptFile {
    /// Returns the bind mask selecting this file.
    pub fn mask(&self) -> u64 {
        1 << self.hgei
    }
}

/// The host's IMSIC guest file allocator.
pub trait InterruptFileDriver: Sync {
    /// Claims a free guest interrupt file on `cpu`.
    fn claim(&self, cpu: CpuId) -> Option<InterruptFile>;

    /// Called once `file` has been converted for confidential use.
    fn convert(&self, file: &InterruptFile);

    /// Returns `file` to the driver's free pool.
    fn reclaim(&self, file: InterruptFile);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_page_contains() {
        let base = HostPageAddr::from_bits(0x8000_0000).unwrap();
        let run = HostPage::new(base, 4);
        assert!(run.contains(base));
        assert!(run.contains(HostPageAddr::from_bits(0x8000_3000).unwrap()));
        assert!(!run.contains(HostPageAddr::from_bits(0x8000_4000).unwrap()));
        assert!(!run.contains(HostPageAddr::from_bits(0x7fff_f000).unwrap()));
    }

    #[test]
    fn interrupt_file_mask() {
        let file = InterruptFile {
            cpu: CpuId::new(1),
            hgei: 3,
            phys: HostPageAddr::from_bits(0x2800_3000).unwrap(),
        };
        assert_eq!(file.mask(), 0b1000);
    }
}
