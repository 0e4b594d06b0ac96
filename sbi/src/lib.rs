// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Encodings of the SBI calls a CoVE host hypervisor exchanges with the TSM.
//!
//! `SbiMessage` is an enum of the supported extensions. Each extension's functions implement
//! `SbiFunction`, which maps them to and from the a0-a7 registers of an `ecall`.

#![no_std]
#![deny(missing_docs)]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod base;
mod consts;
mod cove_guest;
mod cove_host;
mod cove_interrupt;
mod error;
mod function;

pub use base::BaseFunction;
pub use consts::*;
pub use cove_guest::{CovgFunction, InterruptSelector};
pub use cove_host::{
    CovhFunction, TsmCapability, TsmInfo, TsmPageType, TsmState, TvmCreateParams,
};
pub use cove_interrupt::{CoviFunction, TvmAiaParams};
pub use error::{Error, Result};
pub use function::{SbiFunction, SbiArgs, SBI_ARG_REGS};

/// The a0/a1 pair written back to the caller of an SBI function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbiReturn {
    /// Status code placed in a0.
    pub error_code: i64,
    /// Return value placed in a1.
    pub return_value: u64,
}

impl SbiReturn {
    /// Returns a successful reply carrying `return_value`.
    pub fn success(return_value: u64) -> Self {
        Self {
            error_code: SBI_SUCCESS,
            return_value,
        }
    }
}

impl From<Result<u64>> for SbiReturn {
    fn from(result: Result<u64>) -> SbiReturn {
        match result {
            Ok(rv) => Self::success(rv),
            Err(e) => Self::from(e),
        }
    }
}

impl From<Error> for SbiReturn {
    fn from(error: Error) -> SbiReturn {
        SbiReturn {
            error_code: error.to_code(),
            return_value: 0,
        }
    }
}

/// SBI message used to invoke a function of one of the supported extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SbiMessage {
    /// The Base extension, used for probing.
    Base(BaseFunction),
    /// The CoVE Host extension.
    CovH(CovhFunction),
    /// The CoVE Interrupt extension.
    CovI(CoviFunction),
    /// The CoVE Guest extension.
    CovG(CovgFunction),
}

impl SbiMessage {
    /// Creates an `SbiMessage` from the a0-a7 registers of a call. a7 selects the extension and
    /// the remaining registers are interpreted by that extension.
    pub fn from_regs(regs: &[u64; 8]) -> Result<Self> {
        match regs[7] {
            EXT_BASE => BaseFunction::from_regs(regs).map(SbiMessage::Base),
            EXT_COVH => CovhFunction::from_regs(regs).map(SbiMessage::CovH),
            EXT_COVI => CoviFunction::from_regs(regs).map(SbiMessage::CovI),
            EXT_COVG => CovgFunction::from_regs(regs).map(SbiMessage::CovG),
            _ => Err(Error::NotSupported),
        }
    }

    /// Returns the extension ID for a7.
    pub fn a7(&self) -> u64 {
        match self {
            SbiMessage::Base(_) => BaseFunction::EXTENSION_ID,
            SbiMessage::CovH(_) => CovhFunction::EXTENSION_ID,
            SbiMessage::CovI(_) => CoviFunction::EXTENSION_ID,
            SbiMessage::CovG(_) => CovgFunction::EXTENSION_ID,
        }
    }

    /// Returns the function ID for a6.
    pub fn a6(&self) -> u64 {
        match self {
            SbiMessage::Base(f) => f.function_id(),
            SbiMessage::CovH(f) => f.function_id(),
            SbiMessage::CovI(f) => f.function_id(),
            SbiMessage::CovG(f) => f.function_id(),
        }
    }

    /// Returns the a0-a5 argument registers.
    pub fn args(&self) -> SbiArgs {
        match self {
            SbiMessage::Base(f) => f.args(),
            SbiMessage::CovH(f) => f.args(),
            SbiMessage::CovI(f) => f.args(),
            SbiMessage::CovG(f) => f.args(),
        }
    }

    /// Returns all eight registers, a0 first.
    pub fn regs(&self) -> [u64; 8] {
        let a = self.args();
        [a[0], a[1], a[2], a[3], a[4], a[5], self.a6(), self.a7()]
    }

    /// Interprets the a0/a1 registers after the call has been handled.
    pub fn result(&self, a0: u64, a1: u64) -> Result<u64> {
        match self {
            SbiMessage::Base(f) => f.result(a0, a1),
            SbiMessage::CovH(f) => f.result(a0, a1),
            SbiMessage::CovI(f) => f.result(a0, a1),
            SbiMessage::CovG(f) => f.result(a0, a1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_regs_round_trip() {
        let msg = SbiMessage::CovH(CovhFunction::AddZeroPages {
            tvm_id: 4,
            page_addr: 0x8800_0000,
            page_type: TsmPageType::Page4k,
            num_pages: 1,
            guest_addr: 0x8000_1000,
        });
        let regs = msg.regs();
        assert_eq!(regs[7], EXT_COVH);
        assert_eq!(regs[6], 11);
        assert_eq!(SbiMessage::from_regs(&regs), Ok(msg));
    }

    #[test]
    fn unknown_extension() {
        let regs = [0, 0, 0, 0, 0, 0, 0, 0x4442434E];
        assert_eq!(SbiMessage::from_regs(&regs), Err(Error::NotSupported));
    }

    #[test]
    fn sbi_return_from_result() {
        assert_eq!(SbiReturn::from(Ok(0x1000)), SbiReturn::success(0x1000));
        let ret = SbiReturn::from(Err(Error::InvalidParam));
        assert_eq!(ret.error_code, SBI_ERR_INVALID_PARAM);
        assert_eq!(ret.return_value, 0);
    }

    #[test]
    fn probe_message() {
        let msg = SbiMessage::Base(BaseFunction::ProbeSbiExtension(EXT_COVI));
        assert_eq!(msg.regs(), [EXT_COVI, 0, 0, 0, 0, 0, 3, EXT_BASE]);
    }
}
