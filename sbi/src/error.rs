// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::consts::*;

/// Status codes returned in a0 by the TSM.
///
/// Constants from the SBI [spec](https://github.com/riscv-non-isa/riscv-sbi-doc/releases).
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Generic failure in execution of the SBI call.
    Failed = SBI_ERR_FAILED,
    /// Extension or function is not supported.
    NotSupported = SBI_ERR_NOT_SUPPORTED,
    /// Parameter passed isn't valid.
    InvalidParam = SBI_ERR_INVALID_PARAM,
    /// Permission denied.
    Denied = SBI_ERR_DENIED,
    /// Address passed is invalid.
    InvalidAddress = SBI_ERR_INVALID_ADDRESS,
    /// The resource is already available.
    AlreadyAvailable = SBI_ERR_ALREADY_AVAILABLE,
    /// The operation has already been started, e.g. a fence sequence is in flight.
    AlreadyStarted = SBI_ERR_ALREADY_STARTED,
    /// The operation has already been stopped.
    AlreadyStopped = SBI_ERR_ALREADY_STOPPED,
}

impl Error {
    /// Parses the given error code. Unknown negative codes collapse to `Failed`.
    pub fn from_code(e: i64) -> Self {
        use Error::*;
        match e {
            SBI_ERR_NOT_SUPPORTED => NotSupported,
            SBI_ERR_INVALID_PARAM => InvalidParam,
            SBI_ERR_DENIED => Denied,
            SBI_ERR_INVALID_ADDRESS => InvalidAddress,
            SBI_ERR_ALREADY_AVAILABLE => AlreadyAvailable,
            SBI_ERR_ALREADY_STARTED => AlreadyStarted,
            SBI_ERR_ALREADY_STOPPED => AlreadyStopped,
            _ => Failed,
        }
    }

    /// Returns the code placed in a0 when replying with this error.
    pub fn to_code(self) -> i64 {
        self as i64
    }
}

/// Holds the result of an SBI call.
pub type Result<T> = core::result::Result<T, Error>;
