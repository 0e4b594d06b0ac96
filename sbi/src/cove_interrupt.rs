// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The CoVE Interrupt (COVI) extension supplements COVH with hardware-assisted interrupt
//! virtualization using the RISC-V Advanced Interrupt Architecture (AIA).

use static_assertions::const_assert_eq;

use crate::consts::EXT_COVI;
use crate::error::*;
use crate::function::*;

/// Describes a TVM's AIA configuration.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TvmAiaParams {
    /// The base address of the virtualized IMSIC in guest physical address space, i.e. the
    /// address of the IMSIC with group ID, hart ID and guest ID of 0.
    ///
    /// XLEN-1           >=24                                 12    0
    /// |                  |                                  |     |
    /// -------------------------------------------------------------
    /// |xxxxxx|Group Index|xxxxxxxxxxx|Hart Index|Guest Index|  0  |
    /// -------------------------------------------------------------
    pub imsic_base_addr: u64,
    /// The number of group index bits in an IMSIC address.
    pub group_index_bits: u32,
    /// The location of the group index in an IMSIC address. Must be >= 24.
    pub group_index_shift: u32,
    /// The number of hart index bits in an IMSIC address.
    pub hart_index_bits: u32,
    /// The number of guest index bits in an IMSIC address. Must be >= log2(guests_per_hart + 1).
    pub guest_index_bits: u32,
    /// The number of guest interrupt files to be implemented per vCPU.
    pub guests_per_hart: u32,
}

const_assert_eq!(core::mem::size_of::<TvmAiaParams>(), 32);

/// Functions provided by the CoVE Interrupt extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoviFunction {
    /// Configures AIA virtualization for the TVM from the `TvmAiaParams` at `params_addr`. Only
    /// valid prior to finalization.
    ///
    /// a6 = 0
    TvmAiaInit {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = physical address of the `TvmAiaParams` structure
        params_addr: u64,
        /// a2 = length of the `TvmAiaParams` structure in bytes
        len: u64,
    },
    /// Sets the guest physical address of the vCPU's virtualized IMSIC.
    ///
    /// a6 = 1
    TvmCpuSetImsicAddr {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
        /// a2 = guest physical address of the vCPU's IMSIC
        imsic_addr: u64,
    },
    /// Converts the guest interrupt file at `imsic_addr` for use with a TVM. A TSM fence must
    /// complete before the file may be bound.
    ///
    /// a6 = 2
    TsmConvertImsic {
        /// a0 = physical address of the interrupt file
        imsic_addr: u64,
    },
    /// Reclaims a confidential guest interrupt file that is no longer bound to any vCPU.
    ///
    /// a6 = 3
    TsmReclaimImsic {
        /// a0 = physical address of the interrupt file
        imsic_addr: u64,
    },
    /// Binds a vCPU to the current physical CPU using the guest interrupt files in `imsic_mask`
    /// (bit N is guest interrupt file N, as in `hgeie`). The TVM must be finalized.
    ///
    /// a6 = 4
    TvmCpuBindImsic {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
        /// a2 = bit mask of interrupt files to be bound
        imsic_mask: u64,
    },
    /// Begins unbinding a vCPU from its interrupt files. Must run on the CPU the vCPU is bound
    /// to; a TVM fence must complete before `TvmCpuUnbindImsicEnd`.
    ///
    /// a6 = 5
    TvmCpuUnbindImsicBegin {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
    },
    /// Completes the unbind after the TVM fence, saving interrupt state to the vCPU's software
    /// interrupt file.
    ///
    /// a6 = 6
    TvmCpuUnbindImsicEnd {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
    },
    /// Injects external interrupt `interrupt_id` into the vCPU's virtualized IMSIC.
    ///
    /// a6 = 7
    TvmCpuInjectExtInterrupt {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
        /// a2 = interrupt ID
        interrupt_id: u64,
    },
    /// Begins moving a bound vCPU to the interrupt files in `imsic_mask` on the current CPU.
    ///
    /// a6 = 8
    TvmRebindImsicBegin {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
        /// a2 = bit mask of the new interrupt files
        imsic_mask: u64,
    },
    /// Copies interrupt state out of the old interrupt files. Must run on the old CPU after the
    /// TVM fence.
    ///
    /// a6 = 9
    TvmRebindImsicClone {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
    },
    /// Completes the rebind on the new CPU.
    ///
    /// a6 = 10
    TvmRebindImsicEnd {
        /// a0 = TVM ID
        tvm_id: u64,
        /// a1 = vCPU ID
        vcpu_id: u64,
    },
}

impl SbiFunction for CoviFunction {
    const EXTENSION_ID: u64 = EXT_COVI;

    fn function_id(&self) -> u64 {
        use CoviFunction::*;
        match self {
            TvmAiaInit { .. } => 0,
            TvmCpuSetImsicAddr { .. } => 1,
            TsmConvertImsic { .. } => 2,
            TsmReclaimImsic { .. } => 3,
            TvmCpuBindImsic { .. } => 4,
            TvmCpuUnbindImsicBegin { .. } => 5,
            TvmCpuUnbindImsicEnd { .. } => 6,
            TvmCpuInjectExtInterrupt { .. } => 7,
            TvmRebindImsicBegin { .. } => 8,
            TvmRebindImsicClone { .. } => 9,
            TvmRebindImsicEnd { .. } => 10,
        }
    }

    fn args(&self) -> SbiArgs {
        use CoviFunction::*;
        match *self {
            TvmAiaInit {
                tvm_id,
                params_addr,
                len,
            } => [tvm_id, params_addr, len, 0, 0, 0],
            TvmCpuSetImsicAddr {
                tvm_id,
                vcpu_id,
                imsic_addr,
            } => [tvm_id, vcpu_id, imsic_addr, 0, 0, 0],
            TsmConvertImsic { imsic_addr } | TsmReclaimImsic { imsic_addr } => {
                [imsic_addr, 0, 0, 0, 0, 0]
            }
            TvmCpuBindImsic {
                tvm_id,
                vcpu_id,
                imsic_mask,
            }
            | TvmRebindImsicBegin {
                tvm_id,
                vcpu_id,
                imsic_mask,
            } => [tvm_id, vcpu_id, imsic_mask, 0, 0, 0],
            TvmCpuInjectExtInterrupt {
                tvm_id,
                vcpu_id,
                interrupt_id,
            } => [tvm_id, vcpu_id, interrupt_id, 0, 0, 0],
            TvmCpuUnbindImsicBegin { tvm_id, vcpu_id }
            | TvmCpuUnbindImsicEnd { tvm_id, vcpu_id }
            | TvmRebindImsicClone { tvm_id, vcpu_id }
            | TvmRebindImsicEnd { tvm_id, vcpu_id } => [tvm_id, vcpu_id, 0, 0, 0, 0],
        }
    }

    fn from_regs(regs: &[u64; 8]) -> Result<Self> {
        use CoviFunction::*;
        let (tvm_id, vcpu_id) = (regs[0], regs[1]);
        match regs[6] {
            0 => Ok(TvmAiaInit {
                tvm_id,
                params_addr: regs[1],
                len: regs[2],
            }),
            1 => Ok(TvmCpuSetImsicAddr {
                tvm_id,
                vcpu_id,
                imsic_addr: regs[2],
            }),
            2 => Ok(TsmConvertImsic {
                imsic_addr: regs[0],
            }),
            3 => Ok(TsmReclaimImsic {
                imsic_addr: regs[0],
            }),
            4 => Ok(TvmCpuBindImsic {
                tvm_id,
                vcpu_id,
                imsic_mask: regs[2],
            }),
            5 => Ok(TvmCpuUnbindImsicBegin { tvm_id, vcpu_id }),
            6 => Ok(TvmCpuUnbindImsicEnd { tvm_id, vcpu_id }),
            7 => Ok(TvmCpuInjectExtInterrupt {
                tvm_id,
                vcpu_id,
                interrupt_id: regs[2],
            }),
            8 => Ok(TvmRebindImsicBegin {
                tvm_id,
                vcpu_id,
                imsic_mask: regs[2],
            }),
            9 => Ok(TvmRebindImsicClone { tvm_id, vcpu_id }),
            10 => Ok(TvmRebindImsicEnd { tvm_id, vcpu_id }),
            _ => Err(Error::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_functions_follow_inject() {
        let begin = CoviFunction::TvmRebindImsicBegin {
            tvm_id: 2,
            vcpu_id: 1,
            imsic_mask: 1 << 3,
        };
        assert_eq!(begin.function_id(), 8);
        assert_eq!(begin.args(), [2, 1, 8, 0, 0, 0]);
        let regs = [2, 1, 0, 0, 0, 0, 9, EXT_COVI];
        assert_eq!(
            CoviFunction::from_regs(&regs),
            Ok(CoviFunction::TvmRebindImsicClone {
                tvm_id: 2,
                vcpu_id: 1
            })
        );
    }

    #[test]
    fn convert_imsic_uses_a0_only() {
        let f = CoviFunction::TsmConvertImsic {
            imsic_addr: 0x2800_1000,
        };
        assert_eq!(f.args(), [0x2800_1000, 0, 0, 0, 0, 0]);
        assert_eq!(f.function_id(), 2);
    }
}
