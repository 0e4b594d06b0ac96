// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The CoVE Guest (COVG) extension: calls a TVM makes that the TSM forwards to the host.

use crate::consts::EXT_COVG;
use crate::error::*;
use crate::function::*;

/// Selects the external interrupts affected by an allow or deny request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterruptSelector {
    /// Every external interrupt (the guest passed -1).
    All,
    /// A single interrupt identity.
    Id(u64),
}

impl InterruptSelector {
    /// Parses the signed a0 value of an allow/deny call.
    pub fn from_raw(id: i64) -> Result<Self> {
        match id {
            -1 => Ok(InterruptSelector::All),
            id if id >= 0 => Ok(InterruptSelector::Id(id as u64)),
            _ => Err(Error::InvalidParam),
        }
    }
}

/// Functions provided by the CoVE Guest extension to TVM guests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CovgFunction {
    /// Marks the range as emulated MMIO. Both `addr` and `len` must be 4kB-aligned.
    ///
    /// a6 = 0
    AddMmioRegion {
        /// a0 = start address of the region
        addr: u64,
        /// a1 = length of the region
        len: u64,
    },
    /// Removes a range previously added with `AddMmioRegion`.
    ///
    /// a6 = 1
    RemoveMmioRegion {
        /// a0 = start address of the region
        addr: u64,
        /// a1 = length of the region
        len: u64,
    },
    /// Requests conversion of the range from confidential to shared. The caller is blocked until
    /// the host has removed any confidential pages mapped in the range.
    ///
    /// a6 = 2
    ShareMemory {
        /// a0 = start address of the region
        addr: u64,
        /// a1 = length of the region
        len: u64,
    },
    /// Requests conversion of the range from shared back to confidential.
    ///
    /// a6 = 3
    UnshareMemory {
        /// a0 = start address of the region
        addr: u64,
        /// a1 = length of the region
        len: u64,
    },
    /// Allows injection of the given external interrupt ID, or of all of them for -1.
    ///
    /// a6 = 4
    AllowExternalInterrupt {
        /// a0 = interrupt ID
        id: i64,
    },
    /// Denies injection of the given external interrupt ID, or of all of them for -1.
    ///
    /// a6 = 5
    DenyExternalInterrupt {
        /// a0 = interrupt ID
        id: i64,
    },
}

impl SbiFunction for CovgFunction {
    const EXTENSION_ID: u64 = EXT_COVG;

    fn function_id(&self) -> u64 {
        use CovgFunction::*;
        match self {
            AddMmioRegion { .. } => 0,
            RemoveMmioRegion { .. } => 1,
            ShareMemory { .. } => 2,
            UnshareMemory { .. } => 3,
            AllowExternalInterrupt { .. } => 4,
            DenyExternalInterrupt { .. } => 5,
        }
    }

    fn args(&self) -> SbiArgs {
        use CovgFunction::*;
        match *self {
            AddMmioRegion { addr, len }
            | RemoveMmioRegion { addr, len }
            | ShareMemory { addr, len }
            | UnshareMemory { addr, len } => [addr, len, 0, 0, 0, 0],
            AllowExternalInterrupt { id } | DenyExternalInterrupt { id } => {
                [id as u64, 0, 0, 0, 0, 0]
            }
        }
    }

    fn from_regs(regs: &[u64; 8]) -> Result<Self> {
        use CovgFunction::*;
        let (addr, len) = (regs[0], regs[1]);
        match regs[6] {
            0 => Ok(AddMmioRegion { addr, len }),
            1 => Ok(RemoveMmioRegion { addr, len }),
            2 => Ok(ShareMemory { addr, len }),
            3 => Ok(UnshareMemory { addr, len }),
            4 => Ok(AllowExternalInterrupt { id: regs[0] as i64 }),
            5 => Ok(DenyExternalInterrupt { id: regs[0] as i64 }),
            _ => Err(Error::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_is_function_two() {
        let regs = [0x8010_0000, 0x2000, 0, 0, 0, 0, 2, EXT_COVG];
        assert_eq!(
            CovgFunction::from_regs(&regs),
            Ok(CovgFunction::ShareMemory {
                addr: 0x8010_0000,
                len: 0x2000
            })
        );
    }

    #[test]
    fn interrupt_selector() {
        assert_eq!(InterruptSelector::from_raw(-1), Ok(InterruptSelector::All));
        assert_eq!(InterruptSelector::from_raw(5), Ok(InterruptSelector::Id(5)));
        assert_eq!(InterruptSelector::from_raw(-2), Err(Error::InvalidParam));
        let regs = [u64::MAX, 0, 0, 0, 0, 0, 5, EXT_COVG];
        assert_eq!(
            CovgFunction::from_regs(&regs),
            Ok(CovgFunction::DenyExternalInterrupt { id: -1 })
        );
    }
}
