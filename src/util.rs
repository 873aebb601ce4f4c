use log::{error, info};

use structopt::StructOpt;

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use ihex::{Reader, Record};

use fcb_rawflash::config::{AreaSizing, Config, FlashAreaId};
use fcb_rawflash::flash_area::FlashArea;
use fcb_rawflash::host::{create_image, FileDriver, FileFlash};
use fcb_rawflash::sector_range::{self, FlashSectorRange};
use fcb_rawflash::{Geometry, HexSlice};

#[derive(Debug, PartialEq, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// Raw flash image file
    #[structopt(long, default_value = "/dev/rawflash", env = "RAWFLASH_PATH")]
    image: String,

    /// Sector size in bytes
    #[structopt(long, default_value = "4096", env = "RAWFLASH_SECTOR_SIZE")]
    sector_size: u32,

    /// Number of sectors
    #[structopt(long, default_value = "16", env = "RAWFLASH_SECTOR_COUNT")]
    sector_count: u32,

    /// Size the area as sector_size * sector_size, like earlier ports
    #[structopt(long)]
    legacy_size: bool,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, PartialEq, StructOpt)]
pub enum Operations {
    /// Create an erased flash image
    Create,
    #[structopt(flatten)]
    Area(AreaOperations),
}

/// Operations on an opened flash area
#[derive(Debug, PartialEq, StructOpt)]
pub enum AreaOperations {
    /// Show area and sector layout
    Info,
    /// Read data from the area
    Read {
        /// Area offset for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        offset: u32,
        /// Length of read in bytes
        #[structopt()]
        length: u32,
    },
    /// Write data to the area
    Write {
        /// Area offset for write start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        offset: u32,

        // Data to write in hexadecimal
        #[structopt(long)]
        data: HexData,
    },
    /// Erase the sectors covering a byte range
    Erase {
        /// Area offset for erase start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        offset: u32,

        /// Number of bytes to erase
        #[structopt()]
        length: u32,
    },
    /// Check whether a byte range is erased
    IsEmpty {
        /// Area offset for check start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        offset: u32,

        /// Number of bytes to check
        #[structopt()]
        length: u32,
    },
    /// Dump the area into a hex file
    Dump {
        /// Area offset for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        offset: u32,

        /// Length of read in bytes
        #[structopt()]
        length: u32,

        /// Output ihex file
        #[structopt(long, default_value = "dump.ihex")]
        file: String,
    },
    /// Load the area from a hex file
    Load {
        /// Input ihex file
        file: String,
    },
}

#[derive(Debug, PartialEq)]
pub struct HexData(Vec<u8>);

impl std::str::FromStr for HexData {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexData)
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

type Error = Box<dyn std::error::Error + 'static>;

fn main() -> Result<(), Error> {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    TermLogger::init(opts.log_level, simplelog::Config::default(), TerminalMode::Mixed)
        .map_err(|e| format!("logger setup failed: {:?}", e))?;

    let geometry = Geometry {
        sector_size: opts.sector_size,
        sector_count: opts.sector_count,
    };
    let sizing = if opts.legacy_size {
        AreaSizing::SectorSizeSquared
    } else {
        AreaSizing::Geometry
    };
    let config = Config::new(&opts.image).sizing(sizing);
    let driver = FileDriver::new(geometry);

    match &opts.operation {
        Operations::Create => {
            info!("Creating {:?} image at {}", geometry, opts.image);
            create_image(&opts.image, geometry)?;
        }
        Operations::Area(op) => {
            let mut area = match FlashArea::open(&driver, &config, FlashAreaId::RawFlash) {
                Ok(area) => area,
                Err(e) => {
                    error!("Error opening flash area: {}", e);
                    return Ok(());
                }
            };

            if let Err(e) = run(op, &driver, &config, &mut area) {
                error!("{}", e);
            }

            area.close()?;
        }
    }

    Ok(())
}

fn run(
    op: &AreaOperations,
    driver: &FileDriver,
    config: &Config<'_>,
    area: &mut FlashArea<FileFlash>,
) -> Result<(), Error> {
    match op {
        AreaOperations::Info => {
            let info = area.info();
            info!("Area size: {} bytes at offset {:#x}", info.size, info.offset);

            let count = sector_range::sector_range_count(FlashAreaId::RawFlash);
            let mut range = FlashSectorRange {
                area: *info,
                range_start: 0,
                first_sector: 0,
                sector_count: 0,
                sector_size: 0,
                align: 0,
            };
            sector_range::to_sector_ranges(driver, config, FlashAreaId::RawFlash, Some(&mut range))?;
            info!(
                "{} sector range(s): {} sectors of {} bytes, alignment {}",
                count, range.sector_count, range.sector_size, range.align
            );
        }
        AreaOperations::Read { offset, length } => {
            info!("Reading {} bytes from offset 0x{:08x}", length, offset);

            let mut buff = vec![0u8; *length as usize];
            area.read(*offset, &mut buff)?;

            info!("Read: {:?}", HexSlice(&buff));
        }
        AreaOperations::Write { offset, data } => {
            info!("Writing {} bytes to offset 0x{:08x}", data.0.len(), offset);

            area.write(*offset, &data.0)?;

            info!("Write complete");
        }
        AreaOperations::Erase { offset, length } => {
            info!("Erasing {} bytes at offset 0x{:08x}", length, offset);

            area.erase(*offset, *length)?;

            info!("Erase complete");
        }
        AreaOperations::IsEmpty { offset, length } => {
            let mut buff = vec![0u8; *length as usize];
            let empty = area.read_is_empty(*offset, &mut buff)?;

            info!(
                "{} bytes at offset 0x{:08x} are {}",
                length,
                offset,
                if empty { "erased" } else { "not erased" }
            );
        }
        AreaOperations::Dump {
            offset,
            length,
            file,
        } => {
            info!("Reading {} bytes from offset 0x{:08x} to file {}", length, offset, file);

            let mut buff = vec![0u8; *length as usize];
            area.read(*offset, &mut buff)?;

            let mut records = Vec::new();
            let mut segment = None;
            for (c, chunk) in buff.chunks(32).enumerate() {
                let addr = *offset as usize + c * 32;
                let upper = (addr >> 16) as u16;
                if segment != Some(upper) {
                    records.push(Record::ExtendedLinearAddress(upper));
                    segment = Some(upper);
                }
                records.push(Record::Data {
                    offset: addr as u16,
                    value: chunk.to_vec(),
                });
            }
            records.push(Record::EndOfFile);

            let data = ihex::create_object_file_representation(&records)
                .map_err(|e| format!("ihex encoding failed: {:?}", e))?;

            std::fs::write(file, data)?;

            info!("Dump complete");
        }
        AreaOperations::Load { file } => {
            info!("Loading file {}", file);

            let data = String::from_utf8(std::fs::read(file)?)?;

            let reader = Reader::new(&data);
            let mut upper = 0u32;

            for record in reader {
                match record {
                    Ok(Record::Data { offset, value }) => {
                        let addr = (upper << 16) | u32::from(offset);
                        info!("Writing {} bytes at offset 0x{:08x}", value.len(), addr);
                        area.write(addr, &value)?;
                    }
                    Ok(Record::ExtendedLinearAddress(segment)) => upper = u32::from(segment),
                    Ok(Record::EndOfFile) => (),
                    Err(e) => {
                        error!("Reader error: {:?}", e);
                        return Ok(());
                    }
                    _ => {
                        error!("Unrecognised record: {:?}", record);
                        return Ok(());
                    }
                }
            }

            info!("Load complete");
        }
    }

    Ok(())
}
