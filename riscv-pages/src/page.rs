// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use crate::{AddressSpace, GuestPhys, HostPhys, HostVirt};

/// Page sizes the TSM understands. Only `Size4k` is used for confidential memory today, but
/// the larger sizes are accepted by the page-type encoding.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
    Size512G = 512 * 1024 * 1024 * 1024,
}

impl PageSize {
    /// Returns `val` divided by 4kB, rounded up.
    pub const fn num_4k_pages(val: u64) -> u64 {
        (val + PageSize::Size4k as u64 - 1) / (PageSize::Size4k as u64)
    }

    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds up the quantity to the nearest multiple of this page size.
    pub fn round_up(&self, val: u64) -> u64 {
        (val + *self as u64 - 1) & !(*self as u64 - 1)
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }

    /// Returns if the size is a huge page (> 4kB) size.
    pub fn is_huge(&self) -> bool {
        !matches!(*self, PageSize::Size4k)
    }
}

/// A raw address in an address space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawAddr<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> RawAddr<AS> {
    /// Wraps `addr` as an address in `AS`.
    pub fn new(addr: u64) -> Self {
        Self(addr, AS::default())
    }

    /// Returns the inner 64 address.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the address incremented by the given number of bytes.
    /// Returns None if the result would overflow.
    pub fn checked_increment(&self, increment: u64) -> Option<Self> {
        let addr = self.0.checked_add(increment)?;
        Some(Self(addr, self.1))
    }
}

impl<AS: AddressSpace> fmt::Display for RawAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", AS::NAME, self.0)
    }
}

impl<AS: AddressSpace> From<PageAddr<AS>> for RawAddr<AS> {
    fn from(p: PageAddr<AS>) -> RawAddr<AS> {
        p.addr
    }
}

pub type HostPhysAddr = RawAddr<HostPhys>;
pub type HostVirtAddr = RawAddr<HostVirt>;
pub type GuestPhysAddr = RawAddr<GuestPhys>;

/// An address of a Page in an address space. It is guaranteed to be aligned to a page boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageAddr<AS: AddressSpace> {
    addr: RawAddr<AS>,
}

pub type HostPageAddr = PageAddr<HostPhys>;
pub type HostVirtPageAddr = PageAddr<HostVirt>;
pub type GuestPageAddr = PageAddr<GuestPhys>;

impl<AS: AddressSpace> PageAddr<AS> {
    /// Creates a 4kB-aligned `PageAddr` from a `RawAddr`, returning `None` if the address isn't
    /// aligned.
    pub fn new(addr: RawAddr<AS>) -> Option<Self> {
        Self::with_alignment(addr, PageSize::Size4k)
    }

    /// Creates a `PageAddr` from a `RawAddr`, returns `None` if the address isn't aligned to the
    /// requested page size.
    pub fn with_alignment(addr: RawAddr<AS>, alignment: PageSize) -> Option<Self> {
        if alignment.is_aligned(addr.bits()) {
            Some(PageAddr { addr })
        } else {
            None
        }
    }

    /// Shorthand for `PageAddr::new(RawAddr::new(bits))`.
    pub fn from_bits(bits: u64) -> Option<Self> {
        Self::new(RawAddr::new(bits))
    }

    /// Creates a `PageAddr` from a `RawAddr`, rounding down to the nearest multiple of the page
    /// size.
    pub fn with_round_down(addr: RawAddr<AS>, alignment: PageSize) -> Self {
        Self {
            addr: RawAddr::new(alignment.round_down(addr.bits())),
        }
    }

    /// Gets the raw bits of the page address.
    pub fn bits(&self) -> u64 {
        self.addr.0
    }

    /// Returns if this address is aligned to the given page size.
    pub fn is_aligned(&self, alignment: PageSize) -> bool {
        alignment.is_aligned(self.addr.0)
    }

    /// Iterates from this address in 4kB chunks.
    pub fn iter_from(&self) -> PageAddrIter<AS> {
        PageAddrIter {
            next: Some(*self),
            page_size: PageSize::Size4k,
        }
    }

    /// Adds `n` 4kB pages to the current address.
    pub fn checked_add_pages(&self, n: u64) -> Option<Self> {
        n.checked_mul(PageSize::Size4k as u64)
            .and_then(|inc| self.addr.checked_increment(inc))
            .map(|addr| Self { addr })
    }
}

impl<AS: AddressSpace> fmt::Display for PageAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

/// Iterates over consecutive page addresses, stopping at the top of the address space.
pub struct PageAddrIter<AS: AddressSpace> {
    next: Option<PageAddr<AS>>,
    page_size: PageSize,
}

impl<AS: AddressSpace> Iterator for PageAddrIter<AS> {
    type Item = PageAddr<AS>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur
            .addr
            .checked_increment(self.page_size as u64)
            .map(|addr| PageAddr { addr });
        Some(cur)
    }
}

/// A page-aligned span of `num_pages` 4kB pages starting at `base`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRange<AS: AddressSpace> {
    base: PageAddr<AS>,
    num_pages: u64,
}

pub type GuestPageRange = PageRange<GuestPhys>;

impl<AS: AddressSpace> PageRange<AS> {
    /// Builds the range covering `[addr, addr + len)`. Returns `None` unless both `addr` and
    /// `len` are 4kB-aligned and `len` is non-zero, or if the range reaches past the top of the
    /// address space.
    pub fn from_raw(addr: u64, len: u64) -> Option<Self> {
        if len == 0 || !PageSize::Size4k.is_aligned(len) {
            return None;
        }
        let base = PageAddr::from_bits(addr)?;
        addr.checked_add(len)?;
        Some(Self {
            base,
            num_pages: len / PageSize::Size4k as u64,
        })
    }

    /// Builds the range of `num_pages` pages starting at `base`.
    pub fn with_pages(base: PageAddr<AS>, num_pages: u64) -> Option<Self> {
        Self::from_raw(base.bits(), num_pages.checked_mul(PageSize::Size4k as u64)?)
    }

    pub fn base(&self) -> PageAddr<AS> {
        self.base
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.num_pages * PageSize::Size4k as u64
    }

    /// Exclusive end address of the range.
    pub fn end(&self) -> u64 {
        self.base.bits() + self.len()
    }

    /// Returns if `addr` lies inside the range.
    pub fn contains(&self, addr: RawAddr<AS>) -> bool {
        addr.bits() >= self.base.bits() && addr.bits() < self.end()
    }

    /// Returns if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &Self) -> bool {
        other.base.bits() >= self.base.bits() && other.end() <= self.end()
    }

    /// Returns if the two ranges share at least one page.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.base.bits() < other.end() && other.base.bits() < self.end()
    }

    /// Iterates over every page address in the range.
    pub fn pages(&self) -> impl Iterator<Item = PageAddr<AS>> {
        self.base.iter_from().take(self.num_pages as usize)
    }
}
