//! Byte addressed flash area on top of a raw flash device.

use crate::config::{Config, FlashAreaId};
use crate::{Driver, EraseSectors, Error, Geometry, HexSlice, OpenFlags, RawFlash};
use core::convert::TryFrom;

/// Value every byte of an erased sector reads back as.
pub const ERASED_VAL: u8 = 0xFF;

/// Location and layout of a flash area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    /// Which area this describes.
    pub id: FlashAreaId,
    /// Offset of the area on the device. Always 0.
    pub offset: u32,
    /// Area size in bytes.
    pub size: u32,
    /// Geometry of the underlying device.
    pub geometry: Geometry,
}

impl AreaInfo {
    /// Queries the geometry of `device` and derives the area layout from it.
    pub(crate) fn query<D: RawFlash>(
        device: &mut D,
        config: &Config<'_>,
        id: FlashAreaId,
    ) -> Result<Self, Error<D::Error>> {
        let geometry = device.geometry().map_err(Error::Device)?;
        if geometry.sector_size == 0 {
            return Err(Error::InvalidGeometry);
        }
        let size = config
            .sizing
            .area_size(&geometry)
            .ok_or(Error::InvalidGeometry)?;

        Ok(AreaInfo {
            id,
            offset: 0,
            size,
            geometry,
        })
    }

    /// Checks that `len` bytes at `off` lie inside the area and returns the
    /// absolute device address of `off`.
    ///
    /// An access ending exactly at the end of the area is rejected.
    fn check(&self, off: u32, len: usize) -> Option<u32> {
        let len = u32::try_from(len).ok()?;
        let end = off.checked_add(len)?;
        if off >= self.size || end >= self.size {
            return None;
        }
        self.offset.checked_add(off)
    }

    /// Computes the sectors that have to be erased to cover `len` bytes at
    /// the absolute device address `addr`.
    fn erase_span(&self, addr: u32, len: u32) -> Option<EraseSectors> {
        let sector_size = self.geometry.sector_size;
        let sector = addr / sector_size;
        let start = sector * sector_size;

        let len = len.checked_add(addr - start)?;
        let count = len / sector_size + u32::from(len % sector_size != 0);

        Some(EraseSectors { sector, count })
    }
}

/// An open flash area.
///
/// The area owns the raw flash device handle; closing or dropping the area
/// releases it. Accesses are not synchronized, callers sharing an area must
/// serialize access themselves (eg. with an
/// [`OsMutex`](crate::os_mutex::OsMutex)).
#[derive(Debug)]
pub struct FlashArea<D> {
    device: D,
    info: AreaInfo,
}

impl<D: RawFlash> FlashArea<D> {
    /// Opens the raw flash device named by `config` as flash area `id`.
    ///
    /// If the device opens but its geometry cannot be queried, the device is
    /// released again before returning the error.
    pub fn open<Dr>(driver: &Dr, config: &Config<'_>, id: FlashAreaId) -> Result<Self, Error<D::Error>>
    where
        Dr: Driver<Device = D> + ?Sized,
    {
        let mut device = driver
            .open(config.path, OpenFlags::WRITE)
            .map_err(Error::Device)?;
        let info = AreaInfo::query(&mut device, config, id)?;

        info!(
            "FlashArea::open: {}: {} sectors of {} bytes, area size {}",
            config.path, info.geometry.sector_count, info.geometry.sector_size, info.size
        );

        Ok(FlashArea { device, info })
    }

    /// Closes the area and the underlying device.
    pub fn close(self) -> Result<(), Error<D::Error>> {
        self.device.close().map_err(Error::Device)
    }

    /// The area layout.
    pub fn info(&self) -> &AreaInfo {
        &self.info
    }

    /// Offset of the area on the device.
    pub fn offset(&self) -> u32 {
        self.info.offset
    }

    /// Area size in bytes.
    pub fn size(&self) -> u32 {
        self.info.size
    }

    /// Device geometry as queried on open.
    pub fn geometry(&self) -> Geometry {
        self.info.geometry
    }

    /// Reads `buf.len()` bytes at `off` into `buf`.
    ///
    /// Only succeeds if the whole buffer was filled.
    pub fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        let addr = self.bounds(off, buf.len())?;
        self.read_at(addr, buf)
    }

    /// Writes `data` at `off`.
    ///
    /// Only succeeds if all of `data` was transferred. The target range is
    /// expected to be erased.
    pub fn write(&mut self, off: u32, data: &[u8]) -> Result<(), Error<D::Error>> {
        let addr = self.bounds(off, data.len())?;

        trace!("FlashArea::write: {:#x}: {:?}", addr, HexSlice(data));
        let n = self.device.write(addr, data).map_err(Error::Device)?;
        if n != data.len() {
            warn!("FlashArea::write: short write at {:#x}: {} of {}", addr, n, data.len());
            return Err(Error::ShortTransfer);
        }
        Ok(())
    }

    /// Erases at least `len` bytes at `off`.
    ///
    /// Flash is erased in whole sectors, so everything from the start of the
    /// sector containing `off` up to the end of the sector containing the
    /// last byte is erased.
    pub fn erase(&mut self, off: u32, len: u32) -> Result<(), Error<D::Error>> {
        let addr = self.bounds(off, len as usize)?;
        let span = self.info.erase_span(addr, len).ok_or(Error::OutOfBounds)?;

        debug!(
            "FlashArea::erase: {} bytes at {:#x}: sectors {}..{}",
            len,
            addr,
            span.sector,
            span.sector + span.count
        );
        self.device.erase_sectors(span).map_err(Error::Device)
    }

    /// Reads `buf.len()` bytes at `off` into `buf` and reports whether they
    /// are all in the erased state.
    ///
    /// Returns `Ok(true)` if every byte is [`ERASED_VAL`].
    ///
    /// Unlike [`read`](FlashArea::read) this does not check the range
    /// against the area size, the device decides whether it can be read.
    /// FCB reads the end of its last sector this way.
    pub fn read_is_empty(&mut self, off: u32, buf: &mut [u8]) -> Result<bool, Error<D::Error>> {
        let addr = u32::try_from(buf.len())
            .ok()
            .and_then(|len| off.checked_add(len))
            .and_then(|_| self.info.offset.checked_add(off))
            .ok_or(Error::OutOfBounds)?;

        self.read_at(addr, buf)?;
        Ok(buf.iter().all(|&b| b == ERASED_VAL))
    }

    /// Maps `read_is_empty` to the FCB status convention: 1 if empty, 0 if
    /// not, negative on error.
    pub fn read_is_empty_code(&mut self, off: u32, buf: &mut [u8]) -> i32 {
        match self.read_is_empty(off, buf) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => e.code(),
        }
    }

    /// Reads into `buf` at the absolute device address `addr`.
    fn read_at(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        let n = self.device.read(addr, buf).map_err(Error::Device)?;
        if n != buf.len() {
            warn!("FlashArea::read: short read at {:#x}: {} of {}", addr, n, buf.len());
            return Err(Error::ShortTransfer);
        }
        trace!("FlashArea::read: {:#x}: {:?}", addr, HexSlice(&*buf));
        Ok(())
    }

    fn bounds(&self, off: u32, len: usize) -> Result<u32, Error<D::Error>> {
        self.info.check(off, len).ok_or_else(|| {
            warn!(
                "FlashArea: {} bytes at {:#x} outside of area of {} bytes",
                len, off, self.info.size
            );
            Error::OutOfBounds
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaSizing;
    use crate::host::{Faults, SimDriver, SimError};
    use proptest::prelude::*;

    const SECTOR: u32 = 64;
    const SECTORS: u32 = 16;

    fn area() -> (SimDriver, FlashArea<crate::host::SimFlash>) {
        let driver = SimDriver::new(Geometry {
            sector_size: SECTOR,
            sector_count: SECTORS,
        });
        let area = FlashArea::open(&driver, &Config::default(), FlashAreaId::RawFlash).unwrap();
        (driver, area)
    }

    #[test]
    fn open_reports_geometry() {
        let (driver, area) = area();
        assert_eq!(area.offset(), 0);
        assert_eq!(area.size(), SECTOR * SECTORS);
        assert_eq!(area.geometry().sector_count, SECTORS);
        assert_eq!(driver.open_handles(), 1);

        area.close().unwrap();
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn open_legacy_sizing() {
        let driver = SimDriver::new(Geometry {
            sector_size: SECTOR,
            sector_count: SECTORS,
        });
        let config = Config::default().sizing(AreaSizing::SectorSizeSquared);
        let area = FlashArea::open(&driver, &config, FlashAreaId::RawFlash).unwrap();
        assert_eq!(area.size(), SECTOR * SECTOR);
    }

    #[test]
    fn open_unknown_path() {
        let driver = SimDriver::new(Geometry {
            sector_size: SECTOR,
            sector_count: SECTORS,
        });
        let config = Config::new("/dev/nothing");
        match FlashArea::open(&driver, &config, FlashAreaId::RawFlash) {
            Err(Error::Device(SimError::NoSuchDevice)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_geometry_failure_releases_device() {
        let driver = SimDriver::new(Geometry {
            sector_size: SECTOR,
            sector_count: SECTORS,
        });
        driver.inject(Faults::GEOMETRY);
        let res = FlashArea::open(&driver, &Config::default(), FlashAreaId::RawFlash);
        assert!(matches!(res, Err(Error::Device(SimError::Injected))));
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn open_zero_sector_size() {
        let driver = SimDriver::new(Geometry {
            sector_size: 0,
            sector_count: SECTORS,
        });
        let res = FlashArea::open(&driver, &Config::default(), FlashAreaId::RawFlash);
        assert!(matches!(res, Err(Error::InvalidGeometry)));
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn write_then_read() {
        let (_driver, mut area) = area();
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        area.write(100, &data).unwrap();

        let mut buf = [0; 5];
        area.read(100, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn out_of_bounds_skips_device() {
        let (driver, mut area) = area();
        let size = area.size();
        let ops = driver.device_ops();

        let mut buf = [0; 4];
        assert!(matches!(area.read(size, &mut buf), Err(Error::OutOfBounds)));
        assert!(matches!(area.read(size - 4, &mut buf), Err(Error::OutOfBounds)));
        assert!(matches!(area.write(size - 2, &buf), Err(Error::OutOfBounds)));
        assert!(matches!(area.write(u32::MAX, &buf), Err(Error::OutOfBounds)));
        assert!(matches!(area.erase(size - 1, 1), Err(Error::OutOfBounds)));
        assert!(matches!(area.erase(0, u32::MAX), Err(Error::OutOfBounds)));
        assert!(matches!(
            area.read_is_empty(u32::MAX, &mut buf),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(driver.device_ops(), ops);

        // One byte short of the end is the last accepted access.
        area.read(size - 5, &mut buf).unwrap();
        assert_eq!(driver.device_ops(), ops + 1);
    }

    #[test]
    fn short_transfers_fail() {
        let (driver, mut area) = area();
        let mut buf = [0; 8];

        driver.inject(Faults::SHORT_READ);
        assert!(matches!(area.read(0, &mut buf), Err(Error::ShortTransfer)));
        assert_eq!(area.read_is_empty_code(0, &mut buf), -1);

        driver.inject(Faults::SHORT_WRITE);
        assert!(matches!(area.write(0, &buf), Err(Error::ShortTransfer)));
    }

    #[test]
    fn erase_rounds_to_sectors() {
        let (driver, mut area) = area();
        area.erase(SECTOR + 10, 20).unwrap();
        assert_eq!(
            driver.last_erase(),
            Some(EraseSectors {
                sector: 1,
                count: 1
            })
        );

        area.erase(SECTOR - 1, 2).unwrap();
        assert_eq!(
            driver.last_erase(),
            Some(EraseSectors {
                sector: 0,
                count: 2
            })
        );

        area.erase(2 * SECTOR, 3 * SECTOR).unwrap();
        assert_eq!(
            driver.last_erase(),
            Some(EraseSectors {
                sector: 2,
                count: 3
            })
        );
    }

    #[test]
    fn erase_device_failure() {
        let (driver, mut area) = area();
        driver.inject(Faults::ERASE);
        assert!(matches!(
            area.erase(0, 1),
            Err(Error::Device(SimError::Injected))
        ));
    }

    #[test]
    fn read_is_empty_after_erase() {
        let (_driver, mut area) = area();
        let mut buf = [0; 40];
        area.write(SECTOR, &[0u8; 40]).unwrap();
        assert!(!area.read_is_empty(SECTOR, &mut buf).unwrap());

        area.erase(SECTOR, 40).unwrap();
        assert!(area.read_is_empty(SECTOR, &mut buf).unwrap());
        assert_eq!(area.read_is_empty_code(SECTOR, &mut buf), 1);

        area.write(SECTOR + 39, &[0x7f]).unwrap();
        assert!(!area.read_is_empty(SECTOR, &mut buf).unwrap());
        assert_eq!(area.read_is_empty_code(SECTOR, &mut buf), 0);
        assert_eq!(buf[39], 0x7f);
    }

    #[test]
    fn read_is_empty_at_area_end() {
        let (driver, mut area) = area();
        let size = area.size();
        let ops = driver.device_ops();

        let mut buf = [0; 4];
        assert_eq!(area.read_is_empty_code(size - 4, &mut buf), 1);
        assert_eq!(driver.device_ops(), ops + 1);

        // Past the end of the device it is the device that refuses.
        assert!(matches!(
            area.read_is_empty(size, &mut buf),
            Err(Error::Device(SimError::OutOfRange))
        ));
        assert_eq!(area.read_is_empty_code(size - 2, &mut buf), -1);
    }

    proptest! {
        #[test]
        fn write_read_round_trip(
            off in 0..(SECTOR * SECTORS - 1),
            data in proptest::collection::vec(any::<u8>(), 1..200),
        ) {
            let (_driver, mut area) = area();
            prop_assume!(off + (data.len() as u32) < area.size());

            area.write(off, &data).unwrap();
            let mut buf = vec![0u8; data.len()];
            area.read(off, &mut buf).unwrap();
            prop_assert_eq!(buf, data);
        }

        #[test]
        fn out_of_bounds_never_reaches_device(
            off in 0..(2 * SECTOR * SECTORS),
            len in 1u32..(2 * SECTOR * SECTORS),
        ) {
            let (driver, mut area) = area();
            prop_assume!(off + len >= area.size());
            let ops = driver.device_ops();

            let mut buf = vec![0u8; len as usize];
            prop_assert!(matches!(area.read(off, &mut buf), Err(Error::OutOfBounds)));
            prop_assert!(matches!(area.write(off, &buf), Err(Error::OutOfBounds)));
            prop_assert!(matches!(area.erase(off, len), Err(Error::OutOfBounds)));
            prop_assert_eq!(driver.device_ops(), ops);
        }

        #[test]
        fn empty_after_erase(
            off in 0..(SECTOR * SECTORS - 1),
            len in 1u32..(SECTOR * SECTORS),
            pos in any::<prop::sample::Index>(),
            byte in 0u8..ERASED_VAL,
        ) {
            let (_driver, mut area) = area();
            prop_assume!(off + len < area.size());

            area.erase(off, len).unwrap();
            let mut buf = vec![0u8; len as usize];
            prop_assert!(area.read_is_empty(off, &mut buf).unwrap());

            let at = off + pos.index(len as usize) as u32;
            area.write(at, &[byte]).unwrap();
            prop_assert!(!area.read_is_empty(off, &mut buf).unwrap());
            prop_assert_eq!(area.read_is_empty_code(off, &mut buf), 0);
        }

        #[test]
        fn erase_covers_sector_aligned_superset(
            off in 0..(SECTOR * SECTORS - 1),
            len in 0..(SECTOR * SECTORS),
        ) {
            let (_driver, mut area) = area();
            let size = area.size();
            prop_assume!(off + len < size);

            let zeros = vec![0u8; size as usize - 1];
            area.write(0, &zeros).unwrap();
            area.erase(off, len).unwrap();

            let start = off / SECTOR * SECTOR;
            let end = (off + len + SECTOR - 1) / SECTOR * SECTOR;

            let mut contents = vec![0u8; size as usize - 1];
            area.read(0, &mut contents).unwrap();
            for (addr, byte) in contents.iter().enumerate() {
                let addr = addr as u32;
                let erased = addr >= start && addr < end;
                prop_assert_eq!(*byte == ERASED_VAL, erased, "byte at {}", addr);
            }
        }
    }
}
