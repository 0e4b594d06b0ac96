// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping for the host pages a TVM owns or shares.
//!
//! Every page handed to a TVM is tracked by a `PageRecord` whose `OwnershipState` follows the
//! TSM's view of the page:
//!
//! ```text
//! Ordinary --convert--> ConfidentialUnassigned --assign--> Assigned(kind)
//! Assigned(Zero) --invalidate, fence, remove, reclaim--> Shared
//! Shared --invalidate, fence, remove--> (unpinned and dropped)
//! Assigned(any) --TVM destroyed, reclaim--> Ordinary
//! ```
//!
//! Records of guest-mapped pages live in exactly one `Collection` of the `PageLedger`. A record
//! is never dropped or released to the host while the TSM still considers the page confidential.

use alloc::vec::Vec;
use log::{debug, error, warn};
use riscv_pages::{GuestPageAddr, HostPageAddr, HostVirtAddr, PageSize};
use sbi_rs::TsmPageType;

use crate::error::{Error, Result};
use crate::host::{HostMemory, HostPage};
use crate::monitor::{Monitor, TvmId};

/// The use a TVM has made of a confidential page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignKind {
    /// Zero-filled guest memory mapped on a stage-2 fault.
    Zero,
    /// Guest memory populated and measured before finalization.
    Measured,
    /// Stage-2 page-table pool.
    PageTable,
    /// TVM-wide TSM state, including the stage-2 root.
    DomainState,
    /// Per-vCPU TSM state.
    ContextState,
}

/// Where a page stands with respect to the TSM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipState {
    Ordinary,
    ConfidentialUnassigned,
    Assigned(AssignKind),
    Shared,
}

impl OwnershipState {
    /// Returns true if the TSM must reclaim the page before the host may touch it.
    pub fn is_confidential(&self) -> bool {
        matches!(
            self,
            OwnershipState::ConfidentialUnassigned | OwnershipState::Assigned(_)
        )
    }
}

/// A guest mapping of a tracked page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub gpa: GuestPageAddr,
    /// The host mapping the guest page is backed by, or was loaded from for measured pages.
    pub hva: HostVirtAddr,
}

/// A run of host pages and its ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRecord {
    page: HostPage,
    size: PageSize,
    state: OwnershipState,
    mapping: Option<Mapping>,
    pinned: bool,
}

impl PageRecord {
    /// Tracks pages that came from the host page allocator.
    pub fn allocated(page: HostPage) -> Self {
        Self {
            page,
            size: PageSize::Size4k,
            state: OwnershipState::Ordinary,
            mapping: None,
            pinned: false,
        }
    }

    /// Tracks a page pinned behind the guest mapping `mapping`.
    pub fn pinned(page: HostPage, mapping: Mapping) -> Self {
        Self {
            page,
            size: PageSize::Size4k,
            state: OwnershipState::Ordinary,
            mapping: Some(mapping),
            pinned: true,
        }
    }

    pub fn page(&self) -> HostPage {
        self.page
    }

    pub fn phys(&self) -> HostPageAddr {
        self.page.phys()
    }

    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn state(&self) -> OwnershipState {
        self.state
    }

    pub fn mapping(&self) -> Option<Mapping> {
        self.mapping
    }

    pub fn gpa(&self) -> Option<GuestPageAddr> {
        self.mapping.map(|m| m.gpa)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Marks the pages as taken over by a TSM call the caller issued itself, e.g. `CreateTvm`.
    pub(crate) fn mark_assigned(&mut self, kind: AssignKind) {
        self.state = OwnershipState::Assigned(kind);
    }

    fn page_type(&self) -> TsmPageType {
        match self.size {
            PageSize::Size4k => TsmPageType::Page4k,
            PageSize::Size2M => TsmPageType::Page2M,
            PageSize::Size1G => TsmPageType::Page1G,
            PageSize::Size512G => TsmPageType::Page512G,
        }
    }

    /// Returns a non-confidential page to the host: unpinned if it was pinned, freed otherwise.
    pub(crate) fn release(self, memory: &dyn HostMemory) {
        debug_assert!(!self.state.is_confidential());
        if self.pinned {
            memory.unpin(self.page, true);
        } else {
            memory.free_pages(self.page);
        }
    }
}

/// A record the TSM refused to take, handed back to the caller for disposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejected {
    pub error: Error,
    pub record: PageRecord,
}

impl From<Rejected> for Error {
    fn from(r: Rejected) -> Self {
        r.error
    }
}

/// The per-TVM page collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Zero,
    Measured,
    Shared,
    /// vCPU state pages that can only be reclaimed once the TVM is gone.
    PendingReclaim,
}

/// The pages a TVM has been given, grouped by how they're used.
#[derive(Default)]
pub struct PageLedger {
    zero: Vec<PageRecord>,
    measured: Vec<PageRecord>,
    shared: Vec<PageRecord>,
    pending: Vec<PageRecord>,
}

impl PageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, c: Collection) -> &Vec<PageRecord> {
        match c {
            Collection::Zero => &self.zero,
            Collection::Measured => &self.measured,
            Collection::Shared => &self.shared,
            Collection::PendingReclaim => &self.pending,
        }
    }

    fn list_mut(&mut self, c: Collection) -> &mut Vec<PageRecord> {
        match c {
            Collection::Zero => &mut self.zero,
            Collection::Measured => &mut self.measured,
            Collection::Shared => &mut self.shared,
            Collection::PendingReclaim => &mut self.pending,
        }
    }

    fn collections() -> [Collection; 4] {
        [
            Collection::Zero,
            Collection::Measured,
            Collection::Shared,
            Collection::PendingReclaim,
        ]
    }

    /// Returns true if any tracked record covers `phys`.
    pub fn holds(&self, phys: HostPageAddr) -> bool {
        Self::collections()
            .iter()
            .any(|&c| self.list(c).iter().any(|r| r.page.contains(phys)))
    }

    /// Converts `record`'s pages to confidential memory, refusing pages this ledger already
    /// tracks. The caller is responsible for the global fence that must follow before the pages
    /// are assigned.
    pub fn convert(
        &self,
        monitor: &Monitor,
        record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        if self.holds(record.phys()) {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        Self::convert_record(monitor, record)
    }

    /// Like `convert()`, for callers that checked `holds()` themselves.
    pub fn convert_record(
        monitor: &Monitor,
        mut record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        if record.state != OwnershipState::Ordinary || !record.size.is_aligned(record.phys().bits())
        {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        match monitor.convert_pages(record.phys(), record.page.count()) {
            Ok(()) => {
                record.state = OwnershipState::ConfidentialUnassigned;
                Ok(record)
            }
            Err(error) => Err(Rejected { error, record }),
        }
    }

    /// Returns confidential pages to the host's ownership. The record is handed back either way;
    /// on failure it is still confidential and must not be released.
    pub fn reclaim(
        monitor: &Monitor,
        mut record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        if !record.state.is_confidential() {
            return Ok(record);
        }
        match monitor.reclaim_pages(record.phys(), record.page.count()) {
            Ok(()) => {
                record.state = OwnershipState::Ordinary;
                Ok(record)
            }
            Err(error) => Err(Rejected { error, record }),
        }
    }

    fn require_unassigned(record: PageRecord) -> core::result::Result<PageRecord, Rejected> {
        if record.state == OwnershipState::ConfidentialUnassigned {
            Ok(record)
        } else {
            Err(Rejected {
                error: Error::InvalidArgument,
                record,
            })
        }
    }

    /// Maps a converted page as zero-filled memory at `mapping.gpa`. The assigned record is
    /// returned for the caller to `track()` in `Zero`.
    pub fn assign_zero(
        monitor: &Monitor,
        tvm: TvmId,
        record: PageRecord,
        mapping: Mapping,
    ) -> core::result::Result<PageRecord, Rejected> {
        let mut record = Self::require_unassigned(record)?;
        if let Err(error) = monitor.add_zero_pages(
            tvm,
            record.phys(),
            record.page_type(),
            record.page.count(),
            mapping.gpa,
        ) {
            return Err(Rejected { error, record });
        }
        record.state = OwnershipState::Assigned(AssignKind::Zero);
        record.mapping = Some(mapping);
        debug!("zero page {} at {}", record.phys(), mapping.gpa);
        Ok(record)
    }

    /// Loads `src` into the converted page and measures it at `mapping.gpa`. The assigned record
    /// is returned for the caller to `track()` in `Measured`.
    pub fn assign_measured(
        monitor: &Monitor,
        tvm: TvmId,
        record: PageRecord,
        src: HostPageAddr,
        mapping: Mapping,
    ) -> core::result::Result<PageRecord, Rejected> {
        let mut record = Self::require_unassigned(record)?;
        if let Err(error) = monitor.add_measured_pages(
            tvm,
            src,
            record.phys(),
            record.page_type(),
            record.page.count(),
            mapping.gpa,
        ) {
            return Err(Rejected { error, record });
        }
        record.state = OwnershipState::Assigned(AssignKind::Measured);
        record.mapping = Some(mapping);
        debug!("measured page {} at {}", record.phys(), mapping.gpa);
        Ok(record)
    }

    /// Donates converted pages to the TVM's page-table pool. The record is returned for the
    /// TVM to hold on to.
    pub fn assign_pgtable(
        monitor: &Monitor,
        tvm: TvmId,
        record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        let mut record = Self::require_unassigned(record)?;
        if let Err(error) = monitor.add_pgt_pages(tvm, record.phys(), record.page.count()) {
            return Err(Rejected { error, record });
        }
        record.state = OwnershipState::Assigned(AssignKind::PageTable);
        Ok(record)
    }

    /// Starts tracking `record` in `collection`. Refused if another record is already mapped at
    /// the same guest address.
    pub fn track(
        &mut self,
        collection: Collection,
        record: PageRecord,
    ) -> core::result::Result<(), Rejected> {
        if record.gpa().and_then(|g| self.collection_of(g)).is_some() {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        self.list_mut(collection).push(record);
        Ok(())
    }

    /// Parks a record that can't be reclaimed until the TVM is destroyed.
    pub fn defer_reclaim(&mut self, record: PageRecord) {
        self.pending.push(record);
    }

    /// Reclaims a zero page the TSM has already removed from the guest and marks it shared.
    /// Returns the record for the caller to `track()` in `Shared`.
    ///
    /// If the reclaim fails the record is handed back still confidential; it belongs in `Zero`
    /// so that destroying the TVM retries the reclaim.
    pub fn share_removed(
        monitor: &Monitor,
        mut record: PageRecord,
    ) -> core::result::Result<PageRecord, Rejected> {
        if record.state != OwnershipState::Assigned(AssignKind::Zero) {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        record.state = OwnershipState::ConfidentialUnassigned;
        let mut record = Self::reclaim(monitor, record)?;
        record.state = OwnershipState::Shared;
        debug!("zero page {} now shared", record.phys());
        Ok(record)
    }

    /// Tracks a pinned ordinary page as shared with the guest.
    pub fn share_pinned(&mut self, mut record: PageRecord) -> core::result::Result<(), Rejected> {
        let gpa = record.gpa();
        if record.state != OwnershipState::Ordinary
            || gpa.is_none()
            || gpa.and_then(|g| self.collection_of(g)).is_some()
        {
            return Err(Rejected {
                error: Error::InvalidArgument,
                record,
            });
        }
        record.state = OwnershipState::Shared;
        self.shared.push(record);
        Ok(())
    }

    /// Stops tracking the shared page at `gpa` and returns it. The caller must have removed it
    /// from the guest first.
    pub fn unshare(&mut self, gpa: GuestPageAddr) -> Option<PageRecord> {
        self.take(Collection::Shared, gpa).map(|mut r| {
            r.state = OwnershipState::Ordinary;
            r
        })
    }

    /// Removes the record mapped at `gpa` from `collection`.
    pub fn take(&mut self, collection: Collection, gpa: GuestPageAddr) -> Option<PageRecord> {
        let list = self.list_mut(collection);
        let idx = list.iter().position(|r| r.gpa() == Some(gpa))?;
        Some(list.remove(idx))
    }

    /// Reclaims every record in `collection` and returns the pages to the host. Returns the
    /// number of records that couldn't be reclaimed; those pages are leaked rather than handed
    /// back while still confidential.
    pub fn reclaim_list(
        &mut self,
        monitor: &Monitor,
        memory: &dyn HostMemory,
        collection: Collection,
    ) -> usize {
        let records = core::mem::take(self.list_mut(collection));
        let mut leaked = 0;
        for record in records {
            match Self::reclaim(monitor, record) {
                Ok(record) => record.release(memory),
                Err(r) => {
                    error!("reclaiming {} failed: {:?}", r.record.phys(), r.error);
                    leaked += 1;
                }
            }
        }
        if leaked != 0 {
            warn!("leaked {} pages from {:?}", leaked, collection);
        }
        leaked
    }

    /// Finds the record mapped at `gpa`.
    pub fn find(&self, gpa: GuestPageAddr) -> Option<(Collection, &PageRecord)> {
        Self::collections().into_iter().find_map(|c| {
            self.list(c)
                .iter()
                .find(|r| r.gpa() == Some(gpa))
                .map(|r| (c, r))
        })
    }

    /// Returns the collection the page mapped at `gpa` is in.
    pub fn collection_of(&self, gpa: GuestPageAddr) -> Option<Collection> {
        self.find(gpa).map(|(c, _)| c)
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.list(collection).len()
    }

    /// Returns true if every collection is empty.
    pub fn is_empty(&self) -> bool {
        Self::collections().iter().all(|&c| self.list(c).is_empty())
    }

    /// Iterates over the records of `collection`.
    pub fn records(&self, collection: Collection) -> impl Iterator<Item = &PageRecord> {
        self.list(collection).iter()
    }
}
