// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::consts::EXT_BASE;
use crate::error::*;
use crate::function::*;

/// The subset of the Base extension used to discover the CoVE extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseFunction {
    /// Returns the implemented version of the SBI standard.
    GetSpecificationVersion,
    /// Checks if the given SBI extension is supported. Returns 0 if it isn't.
    ProbeSbiExtension(u64),
}

impl SbiFunction for BaseFunction {
    const EXTENSION_ID: u64 = EXT_BASE;

    fn function_id(&self) -> u64 {
        match self {
            BaseFunction::GetSpecificationVersion => 0,
            BaseFunction::ProbeSbiExtension(_) => 3,
        }
    }

    fn args(&self) -> SbiArgs {
        match self {
            BaseFunction::ProbeSbiExtension(ext) => [*ext, 0, 0, 0, 0, 0],
            _ => [0; SBI_ARG_REGS],
        }
    }

    fn from_regs(regs: &[u64; 8]) -> Result<Self> {
        match regs[6] {
            0 => Ok(BaseFunction::GetSpecificationVersion),
            3 => Ok(BaseFunction::ProbeSbiExtension(regs[0])),
            _ => Err(Error::NotSupported),
        }
    }
}
