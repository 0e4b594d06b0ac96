// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::error::*;

/// Number of argument registers (a0-a5) an SBI function may use.
pub const SBI_ARG_REGS: usize = 6;

/// The a0-a5 argument registers of a call.
pub type SbiArgs = [u64; SBI_ARG_REGS];

/// A function of a single SBI extension. Implementers describe how they are laid out in the
/// a0-a6 registers; the extension ID in a7 comes from `EXTENSION_ID`.
pub trait SbiFunction: Sized {
    /// The extension ID placed in a7.
    const EXTENSION_ID: u64;

    /// Returns the function ID placed in a6.
    fn function_id(&self) -> u64;

    /// Returns the a0-a5 argument registers. Unused registers are zero.
    fn args(&self) -> SbiArgs;

    /// Parses the function from the a0-a7 registers of a call. `regs[6]` holds the function ID.
    fn from_regs(regs: &[u64; 8]) -> Result<Self>;

    /// Returns a result parsed from the a0 and a1 return value registers.
    fn result(&self, a0: u64, a1: u64) -> Result<u64> {
        match a0 {
            0 => Ok(a1),
            e => Err(Error::from_code(e as i64)),
        }
    }
}
