// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use riscv_pages::PageSize;
use static_assertions::const_assert;

/// Maximum number of vCPUs tracked per TVM.
pub const MAX_TVM_VCPUS: usize = 64;

/// Upper bound on the external interrupt identities an IMSIC file implements.
pub const MAX_EXT_INTERRUPT_IDS: usize = 2048;

/// Size of the stage-2 root table handed to `CreateTvm` (Sv48x4).
pub const PGD_PAGES: u64 = 4;
pub const PGD_ALIGN: u64 = PGD_PAGES * PageSize::Size4k as u64;

// The allow list is a bitmap of whole u64 words.
const_assert!(MAX_EXT_INTERRUPT_IDS % 64 == 0);
const_assert!(MAX_TVM_VCPUS > 0);
const_assert!(PGD_ALIGN == 16 * 1024);

/// What happens to the pages already measured when a measured load fails part way through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MeasureFailurePolicy {
    /// Keep them, so the caller can retry with the remaining range.
    #[default]
    Retain,
    /// Reclaim every measured page of the TVM.
    Reclaim,
}

/// Tunables for a CoVE host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoveConfig {
    /// Pages donated to the TSM for the TVM's stage-2 page tables.
    pub pgtable_pool_pages: u64,
    /// Pages in the stage-2 root. Always allocated `PGD_ALIGN`-aligned.
    pub pgd_pages: u64,
    pub measure_failure: MeasureFailurePolicy,
    /// External interrupt identities implemented by the platform's IMSICs.
    pub ext_interrupt_ids: usize,
}

impl Default for CoveConfig {
    fn default() -> Self {
        Self {
            pgtable_pool_pages: 1024,
            pgd_pages: PGD_PAGES,
            measure_failure: MeasureFailurePolicy::Retain,
            ext_interrupt_ids: MAX_EXT_INTERRUPT_IDS,
        }
    }
}
