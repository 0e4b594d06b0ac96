// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # CoVE host
//!
//! Host hypervisor side of running RISC-V confidential VMs (TVMs). The TSM, reached through
//! COVH/COVI calls, owns and measures TVM memory; this crate decides which host pages are handed
//! over, tracks them until they come back, fences address translations when ownership changes,
//! and serves the COVG calls a TVM makes to the host.
//!
//! The host kernel's page allocator, CPU dispatch and per-VM state are reached through the traits
//! in `host`, so the same code runs on a real host and against the fakes used in tests.
#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod capabilities;
pub mod config;
mod cove;
mod error;
mod fence;
mod guest_calls;
pub mod host;
mod monitor;
mod page_ledger;
mod tvm;
mod vcpu;

#[cfg(test)]
mod test_env;

pub use capabilities::MonitorCapabilities;
pub use cove::CoveHost;
pub use error::{Error, MeasureError, Result};
pub use fence::{DomainFence, FenceEpoch, GlobalFence};
pub use guest_calls::{handle_guest_call, promote_self, share_memory, unshare_memory};
pub use monitor::{Ecall, FirmwareEcall, Monitor, TvmId};
pub use page_ledger::{
    AssignKind, Collection, Mapping, OwnershipState, PageLedger, PageRecord, Rejected,
};
pub use tvm::{
    AiaConfig, AiaMode, BootEntry, DomainState, PromoteRequest, TrustDomain, MAX_MEMORY_REGIONS,
};
pub use vcpu::{ExecutionContext, RunOutcome};
