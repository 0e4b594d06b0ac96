// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # RiscV page types
//!
//! Typed addresses for the three address spaces a CoVE host juggles: host physical (what the
//! TSM is handed), host virtual (what backs guest memory) and guest physical.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod address_space;
mod page;

pub use address_space::{AddressSpace, GuestPhys, HostPhys, HostVirt};
pub use page::*;
