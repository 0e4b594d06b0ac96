// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The CoVE Host (COVH) extension: calls made by the host hypervisor to the TSM to manage TVMs
//! and the confidential memory backing them.

use flagset::{flags, FlagSet};
use static_assertions::const_assert_eq;

use crate::consts::EXT_COVH;
use crate::error::*;
use crate::function::*;

/// Provides the state of the TSM.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TsmState {
    /// TSM has not been loaded on this platform.
    #[default]
    TsmNotLoaded = 0,
    /// TSM has been loaded, but has not yet been initialized.
    TsmLoaded = 1,
    /// TSM has been loaded & initialized, and is ready to accept COVH calls.
    TsmReady = 2,
}

impl TsmState {
    /// Parses the raw state word written by the TSM. Unknown values are treated as not loaded.
    pub fn from_raw(val: u32) -> Self {
        match val {
            1 => TsmState::TsmLoaded,
            2 => TsmState::TsmReady,
            _ => TsmState::TsmNotLoaded,
        }
    }
}

flags! {
    /// Optional features advertised in `TsmInfo::capabilities`.
    #[repr(u64)]
    pub enum TsmCapability: u64 {
        /// An ordinary VM may be promoted in place with `PromoteToTvm`.
        PromoteTvm = 1 << 0,
        /// Local attestation is available.
        AttestationLocal = 1 << 1,
        /// Remote attestation is available.
        AttestationRemote = 1 << 2,
        /// Hardware-accelerated AIA (the COVI extension) is available.
        Aia = 1 << 3,
        /// Memory-resident interrupt files are supported.
        Mrif = 1 << 4,
        /// The TSM allocates its own memory; no pages need to be donated.
        MemoryAllocation = 1 << 5,
    }
}

/// Information returned by `TsmGetInfo` about the entity that manages confidential VMs.
///
/// The layout matches what the TSM writes, so the state is kept as a raw word.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TsmInfo {
    /// The current state of the TSM. If the state is not `TsmReady`, the remaining fields are
    /// invalid and will be initialized to 0.
    pub tsm_state: u32,
    /// Implementation identifier of the TSM.
    pub tsm_impl_id: u32,
    /// Version number of the running TSM.
    pub tsm_version: u32,
    /// Bitmask of `TsmCapability`.
    pub tsm_capabilities: u64,
    /// The number of 4kB pages which must be donated to the TSM for storing TVM state.
    pub tvm_state_pages: u64,
    /// The maximum number of vCPUs a TVM can support.
    pub tvm_max_vcpus: u64,
    /// The number of 4kB pages which must be donated to the TSM per TVM vCPU.
    pub tvm_vcpu_state_pages: u64,
}

const_assert_eq!(core::mem::size_of::<TsmInfo>(), 48);

impl TsmInfo {
    /// Returns the parsed TSM state.
    pub fn state(&self) -> TsmState {
        TsmState::from_raw(self.tsm_state)
    }

    /// Returns the advertised capabilities, dropping bits this crate doesn't know about.
    pub fn capabilities(&self) -> FlagSet<TsmCapability> {
        FlagSet::new_truncated(self.tsm_capabilities)
    }
}

/// Parameters used for creating a new confidential VM.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TvmCreateParams {
    /// The base physical address of the 16kB confidential memory region that should be used for
    /// the TVM's page directory. Must be 16kB-aligned.
    pub tvm_page_directory_addr: u64,
    /// The base physical address of the confidential memory region to be used to hold the TVM's
    /// global state. Must be page-aligned and `TsmInfo::tvm_state_pages` pages in length.
    pub tvm_state_addr: u64,
}

const_assert_eq!(core::mem::size_of::<TvmCreateParams>(), 16);

/// Types of pages allowed to used for creating or managing confidential VMs.
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TsmPageType {
    #[default]
    /// Standard 4k pages.
    Page4k = 0,
    /// 2 Megabyte pages.
    Page2M = 1,
    /// 1 Gigabyte pages.
    Page1G = 2,
    /// 512 Gigabyte pages.
    Page512G = 3,
}

impl TsmPageType {
    /// Attempts to create a page type from the given u64 register value. Returns an error if the
    /// value is greater than 3(512GB).
    pub fn from_reg(reg: u64) -> Result<Self> {
        use TsmPageType::*;
        match reg {
            0 => Ok(Page4k),
            1 => Ok(Page2M),
            2 => Ok(Page1G),
            3 => Ok(Page512G),
            _ => Err(Error::InvalidParam),
        }
    }

    /// Returns the size of this page type in bytes.
    pub fn size_bytes(&self) -> u64 {
        match self {
            TsmPageType::Page4k => 1 << 12,
            TsmPageType::Page2M => 1 << 21,
            TsmPageType::Page1G => 1 << 30,
            TsmPageType::Page512G => 1 << 39,
        }
    }
}

/// Functions provided by the CoVE Host extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CovhFunction {
    /// Writes up to `len` bytes of the `TsmInfo` structure to the non-confidential physical
    /// address `dest_addr`. Returns the number of bytes written.
    ///
    /// a6 = 0
    TsmGetInfo {
        /// a0 = destination address of the `TsmInfo` structure
        dest_addr: u64,
        /// a1 = maximum number of bytes to be written
        len: u64,
    },
    /// Converts `num_pages` 4kB pages of non-confidential memory starting at `page_addr`. The
    /// pages may not be assigned to a TVM until a fence sequence has completed.
    ///
    /// a6 = 1
    TsmConvertPages {
        /// a0 = base address of pages to convert
        page_addr: u64,
        /// a1 = number of pages
        num_pages: u64,
    },
    /// Reclaims `num_pages` of confidential memory starting at `page_addr`. The pages must not
    /// be currently assigned to an active TVM.
    ///
    /// a6 = 2
    TsmReclaimPages {
        /// a0 = base address of pages to reclaim
        page_addr: u64,
        /// a1 = number of pages
        num_pages: u64,
    },
    /// Initiates a TLB invalidation sequence for all pages converted since the previous fence.
    /// The sequence completes once `TsmLocalFence` has run on every CPU. Fails with
    /// `AlreadyStarted` if a sequence is already in progress.
    ///
    /// a6 = 3
    TsmInitiateFence,
    /// Invalidates TLB entries for pages pending conversion on the local CPU.
    ///
    /// a6 = 4
    TsmLocalFence,
    /// Creates a TVM from the `TvmCreateParams` at `params_addr`. Returns the TVM ID.
    ///
    /// a6 = 5
    CreateTvm {
        /// a0 = base physical address of the `TvmCreateParams` structure
        params_addr: u64,
        /// a1 = length of the `TvmCreateParams` structure in bytes
        len: u64,
    },
    /// Moves a TVM from the initializing state to the runnable state, setting the boot vCPU's
    /// entry point and argument.
    ///
    /// a6 = 6
    FinalizeTvm {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = entry point of the boot vCPU
        sepc: u64,
        /// a2 = value of a1 at entry
        entry_arg: u64,
    },
    /// Destroys a TVM. Its pages may be reclaimed afterwards.
    ///
    /// a6 = 7
    DestroyTvm {
        /// a0 = TVM ID
        tvm_id: u64,
    },
    /// Reserves a range of guest physical address space for confidential memory. Both
    /// `guest_addr` and `len` must be 4kB-aligned. Only valid prior to finalization.
    ///
    /// a6 = 8
    AddMemoryRegion {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = start of the region
        guest_addr: u64,
        /// a2 = length of the region
        len: u64,
    },
    /// Donates `num_pages` converted 4kB pages at `page_addr` to the TVM's page-table pool.
    ///
    /// a6 = 9
    AddPageTablePages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = address of the first page
        page_addr: u64,
        /// a2 = number of pages
        num_pages: u64,
    },
    /// Copies `num_pages` pages from non-confidential `src_addr` into the converted pages at
    /// `dest_addr`, extends the TVM measurement and maps them at `guest_addr`. Only valid prior to
    /// finalization.
    ///
    /// a6 = 10
    AddMeasuredPages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = physical address of the pages to copy from
        src_addr: u64,
        /// a2 = physical address of the pages to insert
        dest_addr: u64,
        /// a3 = page size
        page_type: TsmPageType,
        /// a4 = number of pages
        num_pages: u64,
        /// a5 = guest physical address
        guest_addr: u64,
    },
    /// Maps `num_pages` converted pages at `page_addr` into the TVM at `guest_addr`, zero-filled.
    ///
    /// a6 = 11
    AddZeroPages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = physical address of the pages to insert
        page_addr: u64,
        /// a2 = page size
        page_type: TsmPageType,
        /// a3 = number of pages
        num_pages: u64,
        /// a4 = guest physical address
        guest_addr: u64,
    },
    /// Maps non-confidential pages at `page_addr` into the TVM at `guest_addr` as shared memory.
    ///
    /// a6 = 12
    AddSharedPages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = physical address of the pages to share
        page_addr: u64,
        /// a2 = page size
        page_type: TsmPageType,
        /// a3 = number of pages
        num_pages: u64,
        /// a4 = guest physical address
        guest_addr: u64,
    },
    /// Creates vCPU `vcpu_id` using the converted pages at `state_page_addr` for its state.
    /// vCPUs may not be added after the TVM is finalized.
    ///
    /// a6 = 13
    CreateVcpu {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
        /// a2 = physical address of the vCPU state pages
        state_page_addr: u64,
    },
    /// Runs the given vCPU. A non-zero return value means the vCPU has terminated.
    ///
    /// a6 = 14
    RunVcpu {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
    },
    /// Initiates a TLB invalidation sequence for the TVM. The TSM completes it as each vCPU
    /// exits to the host.
    ///
    /// a6 = 15
    TvmInitiateFence {
        /// a0 = TVM ID
        tvm_id: u64,
    },
    /// Marks the mappings in the range as invalid. They stay in place until `RemovePages` or
    /// `ValidatePages`.
    ///
    /// a6 = 16
    InvalidatePages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = guest physical address
        guest_addr: u64,
        /// a2 = length in bytes
        len: u64,
    },
    /// Restores mappings previously invalidated with `InvalidatePages`.
    ///
    /// a6 = 17
    ValidatePages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = guest physical address
        guest_addr: u64,
        /// a2 = length in bytes
        len: u64,
    },
    /// Promotes the invalidated mappings at `guest_addr` to a larger page of `page_type`.
    ///
    /// a6 = 18
    PromotePage {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = guest physical address
        guest_addr: u64,
        /// a2 = page size after promotion
        page_type: TsmPageType,
    },
    /// Splits the invalidated mapping at `guest_addr` of `page_type` into smaller pages.
    ///
    /// a6 = 19
    DemotePage {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = guest physical address
        guest_addr: u64,
        /// a2 = page size before demotion
        page_type: TsmPageType,
    },
    /// Removes invalidated mappings in the range after a TVM fence has completed.
    ///
    /// a6 = 20
    RemovePages {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = guest physical address
        guest_addr: u64,
        /// a2 = length in bytes
        len: u64,
    },
    /// Converts the calling ordinary VM into a TVM in place. Returns the TVM ID.
    ///
    /// a6 = 21
    PromoteToTvm {
        /// a0 = guest physical address of the flattened device tree
        fdt_addr: u64,
        /// a1 = guest physical address of the TVM attestation payload
        tap_addr: u64,
        /// a2 = resume address of the promoting vCPU
        sepc: u64,
    },
}

impl SbiFunction for CovhFunction {
    const EXTENSION_ID: u64 = EXT_COVH;

    fn function_id(&self) -> u64 {
        use CovhFunction::*;
        match self {
            TsmGetInfo { .. } => 0,
            TsmConvertPages { .. } => 1,
            TsmReclaimPages { .. } => 2,
            TsmInitiateFence => 3,
            TsmLocalFence => 4,
            CreateTvm { .. } => 5,
            FinalizeTvm { .. } => 6,
            DestroyTvm { .. } => 7,
            AddMemoryRegion { .. } => 8,
            AddPageTablePages { .. } => 9,
            AddMeasuredPages { .. } => 10,
            AddZeroPages { .. } => 11,
            AddSharedPages { .. } => 12,
            CreateVcpu { .. } => 13,
            RunVcpu { .. } => 14,
            TvmInitiateFence { .. } => 15,
            InvalidatePages { .. } => 16,
            ValidatePages { .. } => 17,
            PromotePage { .. } => 18,
            DemotePage { .. } => 19,
            RemovePages { .. } => 20,
            PromoteToTvm { .. } => 21,
        }
    }

    fn args(&self) -> SbiArgs {
        use CovhFunction::*;
        match *self {
            TsmGetInfo { dest_addr, len } => [dest_addr, len, 0, 0, 0, 0],
            TsmConvertPages {
                page_addr,
                num_pages,
            }
            | TsmReclaimPages {
                page_addr,
                num_pages,
            } => [page_addr, num_pages, 0, 0, 0, 0],
            TsmInitiateFence | TsmLocalFence => [0; SBI_ARG_REGS],
            CreateTvm { params_addr, len } => [params_addr, len, 0, 0, 0, 0],
            FinalizeTvm {
                tvm_id,
                sepc,
                entry_arg,
            } => [tvm_id, sepc, entry_arg, 0, 0, 0],
            DestroyTvm { tvm_id } | TvmInitiateFence { tvm_id } => [tvm_id, 0, 0, 0, 0, 0],
            AddMemoryRegion {
                tvm_id,
                guest_addr,
                len,
            }
            | InvalidatePages {
                tvm_id,
                guest_addr,
                len,
            }
            | ValidatePages {
                tvm_id,
                guest_addr,
                len,
            }
            | RemovePages {
                tvm_id,
                guest_addr,
                len,
            } => [tvm_id, guest_addr, len, 0, 0, 0],
            AddPageTablePages {
                tvm_id,
                page_addr,
                num_pages,
            } => [tvm_id, page_addr, num_pages, 0, 0, 0],
            AddMeasuredPages {
                tvm_id,
                src_addr,
                dest_addr,
                page_type,
                num_pages,
                guest_addr,
            } => [
                tvm_id,
                src_addr,
                dest_addr,
                page_type as u64,
                num_pages,
                guest_addr,
            ],
            AddZeroPages {
                tvm_id,
                page_addr,
                page_type,
                num_pages,
                guest_addr,
            }
            | AddSharedPages {
                tvm_id,
                page_addr,
                page_type,
                num_pages,
                guest_addr,
            } => [
                tvm_id,
                page_addr,
                page_type as u64,
                num_pages,
                guest_addr,
                0,
            ],
            CreateVcpu {
                tvm_id,
                vcpu_id,
                state_page_addr,
            } => [tvm_id, vcpu_id, state_page_addr, 0, 0, 0],
            RunVcpu { tvm_id, vcpu_id } => [tvm_id, vcpu_id, 0, 0, 0, 0],
            PromotePage {
                tvm_id,
                guest_addr,
                page_type,
            }
            | DemotePage {
                tvm_id,
                guest_addr,
                page_type,
            } => [tvm_id, guest_addr, page_type as u64, 0, 0, 0],
            PromoteToTvm {
                fdt_addr,
                tap_addr,
                sepc,
            } => [fdt_addr, tap_addr, sepc, 0, 0, 0],
        }
    }

    fn from_regs(regs: &[u64; 8]) -> Result<Self> {
        use CovhFunction::*;
        let a = regs;
        match a[6] {
            0 => Ok(TsmGetInfo {
                dest_addr: a[0],
                len: a[1],
            }),
            1 => Ok(TsmConvertPages {
                page_addr: a[0],
                num_pages: a[1],
            }),
            2 => Ok(TsmReclaimPages {
                page_addr: a[0],
                num_pages: a[1],
            }),
            3 => Ok(TsmInitiateFence),
            4 => Ok(TsmLocalFence),
            5 => Ok(CreateTvm {
                params_addr: a[0],
                len: a[1],
            }),
            6 => Ok(FinalizeTvm {
                tvm_id: a[0],
                sepc: a[1],
                entry_arg: a[2],
            }),
            7 => Ok(DestroyTvm { tvm_id: a[0] }),
            8 => Ok(AddMemoryRegion {
                tvm_id: a[0],
                guest_addr: a[1],
                len: a[2],
            }),
            9 => Ok(AddPageTablePages {
                tvm_id: a[0],
                page_addr: a[1],
                num_pages: a[2],
            }),
            10 => Ok(AddMeasuredPages {
                tvm_id: a[0],
                src_addr: a[1],
                dest_addr: a[2],
                page_type: TsmPageType::from_reg(a[3])?,
                num_pages: a[4],
                guest_addr: a[5],
            }),
            11 => Ok(AddZeroPages {
                tvm_id: a[0],
                page_addr: a[1],
                page_type: TsmPageType::from_reg(a[2])?,
                num_pages: a[3],
                guest_addr: a[4],
            }),
            12 => Ok(AddSharedPages {
                tvm_id: a[0],
                page_addr: a[1],
                page_type: TsmPageType::from_reg(a[2])?,
                num_pages: a[3],
                guest_addr: a[4],
            }),
            13 => Ok(CreateVcpu {
                tvm_id: a[0],
                vcpu_id: a[1],
                state_page_addr: a[2],
            }),
            14 => Ok(RunVcpu {
                tvm_id: a[0],
                vcpu_id: a[1],
            }),
            15 => Ok(TvmInitiateFence { tvm_id: a[0] }),
            16 => Ok(InvalidatePages {
                tvm_id: a[0],
                guest_addr: a[1],
                len: a[2],
            }),
            17 => Ok(ValidatePages {
                tvm_id: a[0],
                guest_addr: a[1],
                len: a[2],
            }),
            18 => Ok(PromotePage {
                tvm_id: a[0],
                guest_addr: a[1],
                page_type: TsmPageType::from_reg(a[2])?,
            }),
            19 => Ok(DemotePage {
                tvm_id: a[0],
                guest_addr: a[1],
                page_type: TsmPageType::from_reg(a[2])?,
            }),
            20 => Ok(RemovePages {
                tvm_id: a[0],
                guest_addr: a[1],
                len: a[2],
            }),
            21 => Ok(PromoteToTvm {
                fdt_addr: a[0],
                tap_addr: a[1],
                sepc: a[2],
            }),
            _ => Err(Error::NotSupported),
        }
    }
}
