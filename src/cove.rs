// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::capabilities::MonitorCapabilities;
use crate::config::CoveConfig;
use crate::error::Result;
use crate::fence::{FenceEpoch, GlobalFence};
use crate::host::{CpuDispatch, HostMemory, Scheduler};
use crate::monitor::{Ecall, Monitor};

/// Host-wide CoVE state: the TSM connection, what it supports, and the global fence. Created once
/// at boot and shared by every TVM.
pub struct CoveHost<'a> {
    monitor: Monitor<'a>,
    caps: MonitorCapabilities,
    global_fence: GlobalFence,
    memory: &'a dyn HostMemory,
    cpus: &'a dyn CpuDispatch,
    sched: &'a dyn Scheduler,
    config: CoveConfig,
}

impl<'a> CoveHost<'a> {
    /// Connects to the TSM through `ecall`, failing if it doesn't support COVH or isn't ready.
    pub fn init(
        ecall: &'a dyn Ecall,
        memory: &'a dyn HostMemory,
        cpus: &'a dyn CpuDispatch,
        sched: &'a dyn Scheduler,
        config: CoveConfig,
    ) -> Result<Self> {
        let monitor = Monitor::new(ecall);
        let caps = MonitorCapabilities::discover(&monitor, memory)?;
        Ok(Self {
            monitor,
            caps,
            global_fence: GlobalFence::new(),
            memory,
            cpus,
            sched,
            config,
        })
    }

    pub fn monitor(&self) -> &Monitor<'a> {
        &self.monitor
    }

    pub fn capabilities(&self) -> &MonitorCapabilities {
        &self.caps
    }

    pub fn memory(&self) -> &'a dyn HostMemory {
        self.memory
    }

    pub fn cpus(&self) -> &'a dyn CpuDispatch {
        self.cpus
    }

    pub fn scheduler(&self) -> &'a dyn Scheduler {
        self.sched
    }

    pub fn config(&self) -> &CoveConfig {
        &self.config
    }

    /// Runs a TSM-wide fence on every online CPU.
    pub fn fence(&self) -> Result<FenceEpoch> {
        self.global_fence.fence(&self.monitor, self.cpus)
    }

    pub fn fence_epoch(&self) -> FenceEpoch {
        self.global_fence.epoch()
    }
}
