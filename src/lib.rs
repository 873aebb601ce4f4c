//! A flash area and mutex adapter for running a flash circular buffer (FCB)
//! on top of a raw flash device.
//!
//! FCB code written against the Mynewt `flash_area` and `os_mutex` APIs
//! expects a byte-addressed flash area it can read, write and erase, plus a
//! recursive mutex. This crate provides both on top of a much thinner raw
//! flash driver that only knows how to report its geometry, erase whole
//! sectors and transfer bytes at an absolute address.
//!
//! The raw device is exposed through the [`Driver`] and [`RawFlash`] traits.
//! The device always backs exactly one flash area, see
//! [`FlashAreaId`](config::FlashAreaId).
//!
//! With the `std` feature enabled, the [`host`] module provides an in-memory
//! simulator, a file backed device and a thread based mutex kernel.

#![doc(html_root_url = "https://docs.rs/fcb-rawflash/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod log;
pub mod config;
pub mod endian;
mod error;
pub mod flash_area;
#[cfg(any(test, feature = "std"))]
pub mod host;
pub mod os_mutex;
pub mod prelude;
pub mod sector_range;
mod utils;

pub use crate::error::Error;
pub use crate::utils::HexSlice;

use bitflags::bitflags;

bitflags! {
    /// Flags passed to [`Driver::open`].
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
    }
}

/// Physical layout of a raw flash device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Geometry {
    /// Size of one erase sector in bytes.
    pub sector_size: u32,
    /// Number of sectors on the device.
    pub sector_count: u32,
}

impl Geometry {
    /// Total device size in bytes, or `None` if it does not fit in a `u32`.
    pub fn total_size(&self) -> Option<u32> {
        self.sector_size.checked_mul(self.sector_count)
    }
}

/// A sector erase request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EraseSectors {
    /// Index of the first sector to erase.
    pub sector: u32,
    /// Number of consecutive sectors to erase.
    pub count: u32,
}

/// An open raw flash device.
pub trait RawFlash {
    /// Error reported by the driver.
    type Error;

    /// Queries the device geometry.
    fn geometry(&mut self) -> Result<Geometry, Self::Error>;

    /// Erases `erase.count` sectors starting at sector `erase.sector`.
    ///
    /// Erased bytes read back as `0xFF`.
    fn erase_sectors(&mut self, erase: EraseSectors) -> Result<(), Self::Error>;

    /// Reads bytes at the absolute device address `addr` into `buf`.
    ///
    /// Returns the number of bytes transferred, which may be less than
    /// `buf.len()`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Programs `data` at the absolute device address `addr`.
    ///
    /// Returns the number of bytes transferred, which may be less than
    /// `data.len()`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<usize, Self::Error>;

    /// Closes the device.
    ///
    /// Dropping a device also releases it, but without reporting errors.
    fn close(self) -> Result<(), Self::Error>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// A raw flash driver that opens devices by path.
pub trait Driver {
    /// The device type handed out by [`open`](Driver::open).
    type Device: RawFlash;

    /// Opens the device at `path`.
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Self::Device, <Self::Device as RawFlash>::Error>;
}

impl<D: Driver + ?Sized> Driver for &D {
    type Device = D::Device;

    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Self::Device, <Self::Device as RawFlash>::Error> {
        (**self).open(path, flags)
    }
}
