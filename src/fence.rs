// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use log::error;
use spin::Mutex;

use crate::error::Result;
use crate::host::{CpuDispatch, VcpuId, VmHooks};
use crate::monitor::{Monitor, TvmId};

/// A fence epoch: the number of fences a coordinator has completed.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FenceEpoch(u64);

impl FenceEpoch {
    /// Creates a new epoch, starting from 0.
    pub fn new() -> Self {
        FenceEpoch(0)
    }

    /// Returns the following epoch.
    pub fn increment(self) -> Self {
        FenceEpoch(self.0 + 1)
    }

    /// Returns the number of completed fences.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Serializes TSM-wide fences, which are needed after converting pages and interrupt files.
#[derive(Default)]
pub struct GlobalFence {
    epoch: Mutex<FenceEpoch>,
}

impl GlobalFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fence with the TSM then completes it on every online CPU. A CPU failing its
    /// local fence is logged but doesn't fail the fence.
    pub fn fence(&self, monitor: &Monitor, cpus: &dyn CpuDispatch) -> Result<FenceEpoch> {
        let mut epoch = self.epoch.lock();
        monitor.initiate_fence().map_err(|e| {
            error!("TSM initiate fence failed: {:?}", e);
            e
        })?;
        cpus.run_on_each(&|cpu| {
            if let Err(e) = monitor.local_fence() {
                error!("local TSM fence failed on CPU {}: {:?}", cpu.raw(), e);
            }
        });
        *epoch = epoch.increment();
        Ok(*epoch)
    }

    /// Returns the epoch of the last completed fence.
    pub fn epoch(&self) -> FenceEpoch {
        *self.epoch.lock()
    }
}

/// Serializes fences of a single TVM's translations, needed before removing pages from it or
/// moving its interrupt files.
#[derive(Default)]
pub struct DomainFence {
    epoch: Mutex<FenceEpoch>,
}

impl DomainFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fence of `tvm` and kicks every vCPU in `vcpus` other than `requester` out of
    /// guest mode so that the TSM can flush their translations on the way out. Doesn't wait for
    /// the vCPUs to acknowledge.
    pub fn fence(
        &self,
        monitor: &Monitor,
        tvm: TvmId,
        requester: Option<VcpuId>,
        vcpus: &[VcpuId],
        vm: &dyn VmHooks,
    ) -> Result<FenceEpoch> {
        let mut epoch = self.epoch.lock();
        monitor.tvm_initiate_fence(tvm)?;
        vcpus
            .iter()
            .filter(|&&v| Some(v) != requester)
            .for_each(|&v| vm.request_exit(v));
        *epoch = epoch.increment();
        Ok(*epoch)
    }

    pub fn epoch(&self) -> FenceEpoch {
        *self.epoch.lock()
    }
}
