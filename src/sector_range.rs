//! Sector layout queries.

use crate::config::{Config, FlashAreaId};
use crate::flash_area::AreaInfo;
use crate::{Driver, Error, OpenFlags, RawFlash};

/// A run of equally sized sectors within a flash area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashSectorRange {
    /// The area the range belongs to.
    pub area: AreaInfo,
    /// Offset of the first sector of the range within the area.
    pub range_start: u32,
    /// Index of the first sector of the range within the area.
    pub first_sector: u32,
    /// Number of sectors in the range.
    pub sector_count: u32,
    /// Size of each sector in bytes.
    pub sector_size: u32,
    /// Write alignment in bytes.
    pub align: u8,
}

/// Number of sector ranges in area `id`.
///
/// The raw flash device has uniform sectors, so this is always 1.
pub fn sector_range_count(id: FlashAreaId) -> usize {
    match id {
        FlashAreaId::RawFlash => 1,
    }
}

/// Describes the sector layout of area `id`.
///
/// Returns the number of sector ranges in the area. If `range` is given, the
/// device is opened, its geometry queried, and `range` filled in with a
/// single range spanning the whole device. Without `range` the device is not
/// touched.
pub fn to_sector_ranges<Dr>(
    driver: &Dr,
    config: &Config<'_>,
    id: FlashAreaId,
    range: Option<&mut FlashSectorRange>,
) -> Result<usize, Error<<Dr::Device as RawFlash>::Error>>
where
    Dr: Driver + ?Sized,
{
    let count = sector_range_count(id);
    let range = match range {
        Some(range) => range,
        None => return Ok(count),
    };

    let mut device = driver
        .open(config.path, OpenFlags::WRITE)
        .map_err(Error::Device)?;
    let info = AreaInfo::query(&mut device, config, id)?;
    device.close().map_err(Error::Device)?;

    debug!(
        "to_sector_ranges: {}: {} sectors of {} bytes",
        config.path, info.geometry.sector_count, info.geometry.sector_size
    );

    *range = FlashSectorRange {
        area: info,
        range_start: 0,
        first_sector: 0,
        sector_count: info.geometry.sector_count,
        sector_size: info.geometry.sector_size,
        align: 1,
    };
    Ok(count)
}
