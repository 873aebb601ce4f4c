//! Adapter configuration.

use crate::Geometry;

/// Path of the raw flash device used when no other path is configured.
pub const DEFAULT_RAWFLASH_PATH: &str = "/dev/rawflash";

/// Identifies a flash area.
///
/// The raw flash device is exposed as exactly one flash area spanning the
/// whole device, so there is only one identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlashAreaId {
    /// The area covering the entire raw flash device.
    RawFlash,
}

impl Default for FlashAreaId {
    fn default() -> Self {
        FlashAreaId::RawFlash
    }
}

/// How the size of a flash area is derived from the device geometry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AreaSizing {
    /// `sector_size * sector_count`, the size of the whole device.
    Geometry,
    /// `sector_size * sector_size`.
    ///
    /// Matches the area size reported by earlier ports of this adapter. Only
    /// useful for reading back flash laid out by those ports.
    SectorSizeSquared,
}

impl AreaSizing {
    /// Computes the area size in bytes, or `None` on overflow.
    pub fn area_size(self, geometry: &Geometry) -> Option<u32> {
        match self {
            AreaSizing::Geometry => geometry.total_size(),
            AreaSizing::SectorSizeSquared => geometry.sector_size.checked_mul(geometry.sector_size),
        }
    }
}

impl Default for AreaSizing {
    fn default() -> Self {
        AreaSizing::Geometry
    }
}

/// Adapter configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config<'a> {
    /// Path of the raw flash device.
    pub path: &'a str,
    /// How the area size is computed.
    pub sizing: AreaSizing,
}

impl<'a> Config<'a> {
    /// Creates a configuration for the device at `path`.
    pub fn new(path: &'a str) -> Self {
        Config {
            path,
            sizing: AreaSizing::default(),
        }
    }

    /// Sets the area sizing rule.
    pub fn sizing(mut self, sizing: AreaSizing) -> Self {
        self.sizing = sizing;
        self
    }
}

impl Default for Config<'static> {
    fn default() -> Self {
        Config::new(DEFAULT_RAWFLASH_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing() {
        let geometry = Geometry {
            sector_size: 512,
            sector_count: 8,
        };
        assert_eq!(AreaSizing::Geometry.area_size(&geometry), Some(4096));
        assert_eq!(
            AreaSizing::SectorSizeSquared.area_size(&geometry),
            Some(512 * 512)
        );

        let big = Geometry {
            sector_size: 64 * 1024,
            sector_count: 4,
        };
        assert_eq!(AreaSizing::SectorSizeSquared.area_size(&big), None);
    }

    #[test]
    fn default_path() {
        let config = Config::default();
        assert_eq!(config.path, "/dev/rawflash");
        assert_eq!(config.sizing, AreaSizing::Geometry);
    }
}
