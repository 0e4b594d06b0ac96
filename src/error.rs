// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use sbi_rs::Error as SbiError;

/// Errors returned by the CoVE host layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied address, size or identifier was malformed or out of range.
    InvalidArgument,
    /// Host memory or another bounded resource ran out.
    ResourceExhausted,
    /// The TSM refused the request.
    MonitorDenied,
    /// The TSM doesn't implement the requested extension or function.
    MonitorNotSupported,
    /// The TSM rejected an address passed to it.
    MonitorInvalidAddress,
    /// Any other TSM failure, carrying the raw SBI status code.
    MonitorFailure(i64),
    /// The operation is only valid before the TVM is finalized.
    AlreadyFinalized,
    /// The operation was interrupted by a pending termination request.
    Cancelled,
    /// A confidential page could not be returned to the host.
    ReclaimFailed,
    /// The operation isn't valid in the object's current lifecycle state.
    InvalidState,
    /// The TSM is present but hasn't reached the ready state.
    MonitorNotReady,
    /// The host configuration can't be used with a TVM.
    Unsupported,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<SbiError> for Error {
    fn from(e: SbiError) -> Self {
        use SbiError::*;
        match e {
            InvalidParam => Error::InvalidArgument,
            NotSupported => Error::MonitorNotSupported,
            Denied => Error::MonitorDenied,
            InvalidAddress => Error::MonitorInvalidAddress,
            Failed | AlreadyAvailable | AlreadyStarted | AlreadyStopped => {
                Error::MonitorFailure(e.to_code())
            }
        }
    }
}

impl From<Error> for SbiError {
    fn from(e: Error) -> Self {
        use Error::*;
        match e {
            InvalidArgument => SbiError::InvalidParam,
            MonitorNotSupported | Unsupported => SbiError::NotSupported,
            MonitorDenied | AlreadyFinalized | InvalidState => SbiError::Denied,
            MonitorInvalidAddress => SbiError::InvalidAddress,
            MonitorFailure(code) => SbiError::from_code(code),
            ResourceExhausted | Cancelled | ReclaimFailed | MonitorNotReady => SbiError::Failed,
        }
    }
}

/// Failure of a measured load part way through.
///
/// `completed` pages were measured and recorded before the failure; `remaining` pages, including
/// the one that failed, were not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeasureError {
    pub error: Error,
    pub completed: u64,
    pub remaining: u64,
}

impl From<MeasureError> for Error {
    fn from(e: MeasureError) -> Self {
        e.error
    }
}
