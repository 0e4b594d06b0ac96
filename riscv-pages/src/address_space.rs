// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt::Debug;
use core::hash::Hash;

/// `AddressSpace` tags a raw address with the space it lives in so that host-physical,
/// host-virtual and guest-physical addresses can't be mixed up.
pub trait AddressSpace: Clone + Copy + Debug + Default + PartialEq + Eq + PartialOrd + Ord + Hash {
    /// Short name used when formatting addresses.
    const NAME: &'static str;
}

/// The host (supervisor) physical address space, i.e. what the TSM sees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPhys;

impl AddressSpace for HostPhys {
    const NAME: &'static str = "hpa";
}

/// The host kernel or user virtual address space backing guest memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostVirt;

impl AddressSpace for HostVirt {
    const NAME: &'static str = "hva";
}

/// A guest physical address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestPhys;

impl AddressSpace for GuestPhys {
    const NAME: &'static str = "gpa";
}
