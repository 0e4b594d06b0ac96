// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use flagset::FlagSet;
use log::{info, warn};
use sbi_rs::{TsmCapability, TsmInfo, TsmState, EXT_COVH, EXT_COVI};

use crate::error::{Error, Result};
use crate::host::HostMemory;
use crate::monitor::Monitor;

/// What the TSM told us about itself at boot.
#[derive(Clone, Copy, Debug)]
pub struct MonitorCapabilities {
    info: TsmInfo,
    covi_available: bool,
}

impl MonitorCapabilities {
    /// Probes for the CoVE extensions and reads the TSM's info. COVH is required and the TSM
    /// must be ready; COVI is optional.
    pub fn discover(monitor: &Monitor, memory: &dyn HostMemory) -> Result<Self> {
        if !monitor.probe_extension(EXT_COVH)? {
            warn!("TSM doesn't implement COVH");
            return Err(Error::MonitorNotSupported);
        }
        let covi_available = monitor.probe_extension(EXT_COVI)?;

        let info = monitor.get_info(memory)?;
        if info.state() != TsmState::TsmReady {
            warn!("TSM not ready: {:?}", info.state());
            return Err(Error::MonitorNotReady);
        }
        info!(
            "TSM ready: impl {:#x} version {:#x}, {} state pages, {} pages per vCPU, COVI {}",
            info.tsm_impl_id,
            info.tsm_version,
            info.tvm_state_pages,
            info.tvm_vcpu_state_pages,
            if covi_available { "present" } else { "absent" }
        );
        Ok(Self {
            info,
            covi_available,
        })
    }

    pub fn info(&self) -> &TsmInfo {
        &self.info
    }

    /// Returns true if interrupt files can be bound to TVM vCPUs.
    pub fn covi_available(&self) -> bool {
        self.covi_available
    }

    pub fn capabilities(&self) -> FlagSet<TsmCapability> {
        self.info.capabilities()
    }

    pub fn has(&self, cap: TsmCapability) -> bool {
        self.capabilities().contains(cap)
    }

    /// Pages the host must donate for a TVM's global state.
    pub fn tvm_state_pages(&self) -> u64 {
        self.info.tvm_state_pages
    }

    /// Pages the host must donate per vCPU. Zero if the TSM partitions memory statically.
    pub fn vcpu_state_pages(&self) -> u64 {
        self.info.tvm_vcpu_state_pages
    }

    pub fn max_vcpus(&self) -> u64 {
        self.info.tvm_max_vcpus
    }
}
