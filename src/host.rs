//! Host implementations of the raw flash driver and the mutex kernel.
//!
//! These make it possible to run the adapter, and FCB on top of it, on a
//! development machine: [`SimDriver`] keeps the flash contents in memory,
//! [`FileDriver`] in an image file, and [`HostKernel`] implements mutexes
//! with OS threads as tasks.

use crate::os_mutex::{Kernel, OsTime, WaitType, OS_TIMEOUT_NEVER};
use crate::{Driver, EraseSectors, Geometry, OpenFlags, RawFlash};
use bitflags::bitflags;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Host kernel tick rate.
pub const TICKS_PER_SEC: u64 = 1000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounds checks a device access, returning the byte range it covers.
fn device_range(geometry: &Geometry, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
    let total = geometry.total_size()? as usize;
    let start = addr as usize;
    let end = start.checked_add(len)?;
    if end > total {
        return None;
    }
    Some(start..end)
}

fn sector_range(geometry: &Geometry, erase: EraseSectors) -> Option<std::ops::Range<usize>> {
    let end_sector = erase.sector.checked_add(erase.count)?;
    if end_sector > geometry.sector_count {
        return None;
    }
    let size = geometry.sector_size as usize;
    Some(erase.sector as usize * size..end_sector as usize * size)
}

/// Programs `data` over `flash` the way NOR flash does: bits can only be
/// cleared, never set.
fn program(flash: &mut [u8], data: &[u8]) {
    for (cell, byte) in flash.iter_mut().zip(data) {
        *cell &= *byte;
    }
}

bitflags! {
    /// Failures that can be injected into a [`SimDriver`].
    ///
    /// Injected faults stay active until [`SimDriver::clear`] is called.
    pub struct Faults: u8 {
        /// Opening the device fails.
        const OPEN = 1 << 0;
        /// The geometry query fails.
        const GEOMETRY = 1 << 1;
        /// Sector erases fail.
        const ERASE = 1 << 2;
        /// Reads transfer one byte less than requested.
        const SHORT_READ = 1 << 3;
        /// Writes transfer one byte less than requested.
        const SHORT_WRITE = 1 << 4;
    }
}

/// Errors reported by the simulated device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimError {
    /// No device exists at the requested path.
    NoSuchDevice,
    /// The request extends past the end of the device.
    OutOfRange,
    /// The operation failed because of an injected fault.
    Injected,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::NoSuchDevice => f.write_str("no such device"),
            SimError::OutOfRange => f.write_str("request outside of the device"),
            SimError::Injected => f.write_str("injected fault"),
        }
    }
}

impl std::error::Error for SimError {}

#[derive(Debug)]
struct SimState {
    geometry: Geometry,
    data: Vec<u8>,
    faults: Faults,
    last_erase: Option<EraseSectors>,
}

#[derive(Debug)]
struct SimShared {
    path: String,
    state: Mutex<SimState>,
    ops: AtomicUsize,
    handles: AtomicUsize,
}

/// A simulated raw flash driver with a single in-memory device.
///
/// All handles opened from one driver (and its clones) share the same flash
/// contents. The flash starts out erased.
#[derive(Debug, Clone)]
pub struct SimDriver {
    shared: Arc<SimShared>,
}

impl SimDriver {
    /// Creates a driver exposing an erased device at
    /// [`DEFAULT_RAWFLASH_PATH`](crate::config::DEFAULT_RAWFLASH_PATH).
    pub fn new(geometry: Geometry) -> Self {
        SimDriver::with_path(crate::config::DEFAULT_RAWFLASH_PATH, geometry)
    }

    /// Creates a driver exposing an erased device at `path`.
    pub fn with_path(path: &str, geometry: Geometry) -> Self {
        let size = geometry.total_size().unwrap_or(0) as usize;
        SimDriver {
            shared: Arc::new(SimShared {
                path: path.to_string(),
                state: Mutex::new(SimState {
                    geometry,
                    data: vec![0xFF; size],
                    faults: Faults::empty(),
                    last_erase: None,
                }),
                ops: AtomicUsize::new(0),
                handles: AtomicUsize::new(0),
            }),
        }
    }

    /// Activates `faults` in addition to any already active.
    pub fn inject(&self, faults: Faults) {
        lock(&self.shared.state).faults.insert(faults);
    }

    /// Deactivates all injected faults.
    pub fn clear(&self) {
        lock(&self.shared.state).faults = Faults::empty();
    }

    /// Number of read, write and erase requests that reached the device.
    pub fn device_ops(&self) -> usize {
        self.shared.ops.load(Ordering::SeqCst)
    }

    /// Number of currently open device handles.
    pub fn open_handles(&self) -> usize {
        self.shared.handles.load(Ordering::SeqCst)
    }

    /// The most recent sector erase request.
    pub fn last_erase(&self) -> Option<EraseSectors> {
        lock(&self.shared.state).last_erase
    }

    /// A copy of the whole flash contents.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.shared.state).data.clone()
    }
}

impl Driver for SimDriver {
    type Device = SimFlash;

    fn open(&self, path: &str, _flags: OpenFlags) -> Result<SimFlash, SimError> {
        if path != self.shared.path {
            return Err(SimError::NoSuchDevice);
        }
        if lock(&self.shared.state).faults.contains(Faults::OPEN) {
            return Err(SimError::Injected);
        }
        self.shared.handles.fetch_add(1, Ordering::SeqCst);
        Ok(SimFlash {
            shared: self.shared.clone(),
        })
    }
}

/// An open handle to a [`SimDriver`] device.
#[derive(Debug)]
pub struct SimFlash {
    shared: Arc<SimShared>,
}

impl SimFlash {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.shared.ops.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.state)
    }
}

impl RawFlash for SimFlash {
    type Error = SimError;

    fn geometry(&mut self) -> Result<Geometry, SimError> {
        let state = lock(&self.shared.state);
        if state.faults.contains(Faults::GEOMETRY) {
            return Err(SimError::Injected);
        }
        Ok(state.geometry)
    }

    fn erase_sectors(&mut self, erase: EraseSectors) -> Result<(), SimError> {
        let mut state = self.state();
        if state.faults.contains(Faults::ERASE) {
            return Err(SimError::Injected);
        }
        let range = sector_range(&state.geometry, erase).ok_or(SimError::OutOfRange)?;
        state.data[range].fill(0xFF);
        state.last_erase = Some(erase);
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, SimError> {
        let state = self.state();
        let range = device_range(&state.geometry, addr, buf.len()).ok_or(SimError::OutOfRange)?;
        let mut n = buf.len();
        if state.faults.contains(Faults::SHORT_READ) {
            n = n.saturating_sub(1);
        }
        buf[..n].copy_from_slice(&state.data[range][..n]);
        Ok(n)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<usize, SimError> {
        let mut state = self.state();
        let range = device_range(&state.geometry, addr, data.len()).ok_or(SimError::OutOfRange)?;
        let mut n = data.len();
        if state.faults.contains(Faults::SHORT_WRITE) {
            n = n.saturating_sub(1);
        }
        program(&mut state.data[range], &data[..n]);
        Ok(n)
    }
}

impl Drop for SimFlash {
    fn drop(&mut self) {
        self.shared.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Creates an erased flash image file of the given geometry at `path`,
/// replacing any existing file.
pub fn create_image<P: AsRef<Path>>(path: P, geometry: Geometry) -> io::Result<()> {
    let size = geometry
        .total_size()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "flash image too large"))?;
    let mut file = File::create(path)?;
    let sector = vec![0xFF; geometry.sector_size as usize];
    for _ in 0..geometry.sector_count {
        file.write_all(&sector)?;
    }
    file.flush()?;
    debug!("create_image: {} bytes", size);
    Ok(())
}

/// A raw flash driver backed by image files on the host file system.
///
/// Every path is opened as a file containing the raw contents of a device
/// with the configured geometry.
#[derive(Debug, Copy, Clone)]
pub struct FileDriver {
    geometry: Geometry,
}

impl FileDriver {
    /// Creates a driver treating image files as devices of `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        FileDriver { geometry }
    }
}

impl Driver for FileDriver {
    type Device = FileFlash;

    fn open(&self, path: &str, flags: OpenFlags) -> io::Result<FileFlash> {
        // Programming needs to read back the current contents.
        let file = OpenOptions::new()
            .read(true)
            .write(flags.contains(OpenFlags::WRITE))
            .open(path)?;
        Ok(FileFlash {
            file,
            geometry: self.geometry,
        })
    }
}

/// An open flash image file.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    geometry: Geometry,
}

impl FileFlash {
    /// Reads as much of `buf` as the file holds at `pos`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut n = 0;
        while n < buf.len() {
            match self.file.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(m) => n += m,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

fn out_of_range() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "request outside of the device")
}

impl RawFlash for FileFlash {
    type Error = io::Error;

    fn geometry(&mut self) -> io::Result<Geometry> {
        Ok(self.geometry)
    }

    fn erase_sectors(&mut self, erase: EraseSectors) -> io::Result<()> {
        let range = sector_range(&self.geometry, erase).ok_or_else(out_of_range)?;
        self.file.seek(SeekFrom::Start(range.start as u64))?;
        let erased = vec![0xFF; range.len()];
        self.file.write_all(&erased)
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> io::Result<usize> {
        device_range(&self.geometry, addr, buf.len()).ok_or_else(out_of_range)?;
        self.read_at(u64::from(addr), buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> io::Result<usize> {
        device_range(&self.geometry, addr, data.len()).ok_or_else(out_of_range)?;
        let mut cells = vec![0; data.len()];
        let n = self.read_at(u64::from(addr), &mut cells)?;
        program(&mut cells[..n], &data[..n]);

        self.file.seek(SeekFrom::Start(u64::from(addr)))?;
        self.file.write_all(&cells[..n])?;
        Ok(n)
    }

    fn close(self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Errors reported by [`HostKernel`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// A mutex with the requested name already exists.
    NameInUse,
    /// No more mutexes can be created.
    NoResources,
    /// The handle does not refer to a mutex.
    InvalidHandle,
    /// The mutex was not acquired before the timeout expired.
    Timeout,
    /// The calling thread does not hold the mutex.
    NotOwner,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NameInUse => f.write_str("name already in use"),
            KernelError::NoResources => f.write_str("out of mutexes"),
            KernelError::InvalidHandle => f.write_str("invalid handle"),
            KernelError::Timeout => f.write_str("timed out"),
            KernelError::NotOwner => f.write_str("not the owner"),
        }
    }
}

impl std::error::Error for KernelError {}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: u32,
}

#[derive(Debug)]
struct HostMutex {
    name: String,
    wait: WaitType,
    owner: Mutex<Owner>,
    released: Condvar,
}

#[derive(Debug)]
struct KernelState {
    mutexes: Vec<Arc<HostMutex>>,
    capacity: usize,
}

/// A mutex kernel for the host, treating each OS thread as a task.
///
/// Mutexes are recursive and owned by the thread that locked them. Names
/// must be unique. Waiters are woken in whatever order the host scheduler
/// picks, regardless of the requested [`WaitType`].
#[derive(Debug)]
pub struct HostKernel {
    state: Mutex<KernelState>,
}

impl HostKernel {
    /// Creates a kernel without any mutexes.
    pub fn new() -> Self {
        HostKernel {
            state: Mutex::new(KernelState {
                mutexes: Vec::new(),
                capacity: usize::MAX,
            }),
        }
    }

    /// Limits how many mutexes can be created in total.
    pub fn set_capacity(&self, capacity: usize) {
        lock(&self.state).capacity = capacity;
    }

    /// Number of mutexes created so far.
    pub fn mutex_count(&self) -> usize {
        lock(&self.state).mutexes.len()
    }

    /// The wait order `handle` was created with.
    pub fn wait_type(&self, handle: usize) -> Option<WaitType> {
        self.get(handle).ok().map(|m| m.wait)
    }

    /// The name `handle` was created with.
    pub fn mutex_name(&self, handle: usize) -> Option<String> {
        self.get(handle).ok().map(|m| m.name.clone())
    }

    fn get(&self, handle: usize) -> Result<Arc<HostMutex>, KernelError> {
        lock(&self.state)
            .mutexes
            .get(handle)
            .cloned()
            .ok_or(KernelError::InvalidHandle)
    }
}

impl Default for HostKernel {
    fn default() -> Self {
        HostKernel::new()
    }
}

/// Converts a tick count to a duration, or `None` for an unbounded wait.
fn ticks_to_duration(timeout: OsTime) -> Option<Duration> {
    if timeout == OS_TIMEOUT_NEVER {
        return None;
    }
    Some(Duration::from_millis(u64::from(timeout) * 1000 / TICKS_PER_SEC))
}

impl Kernel for HostKernel {
    type Handle = usize;
    type Error = KernelError;

    fn mutex_create(&self, name: &str, wait: WaitType) -> Result<usize, KernelError> {
        let mut state = lock(&self.state);
        if state.mutexes.len() >= state.capacity {
            return Err(KernelError::NoResources);
        }
        if state.mutexes.iter().any(|m| m.name == name) {
            return Err(KernelError::NameInUse);
        }
        state.mutexes.push(Arc::new(HostMutex {
            name: name.to_string(),
            wait,
            owner: Mutex::new(Owner::default()),
            released: Condvar::new(),
        }));
        trace!("HostKernel: created mutex {} ({:?})", name, wait);
        Ok(state.mutexes.len() - 1)
    }

    fn mutex_lock(&self, handle: usize, timeout: OsTime) -> Result<(), KernelError> {
        let mutex = self.get(handle)?;
        let me = thread::current().id();
        let deadline = ticks_to_duration(timeout).map(|d| Instant::now() + d);

        let mut owner = lock(&mutex.owner);
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    return Ok(());
                }
                Some(tid) if tid == me => {
                    owner.depth = owner.depth.checked_add(1).ok_or(KernelError::NoResources)?;
                    return Ok(());
                }
                Some(_) => {}
            }

            owner = match deadline {
                None => mutex
                    .released
                    .wait(owner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(KernelError::Timeout);
                    }
                    mutex
                        .released
                        .wait_timeout(owner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn mutex_unlock(&self, handle: usize) -> Result<(), KernelError> {
        let mutex = self.get(handle)?;
        let mut owner = lock(&mutex.owner);
        if owner.thread != Some(thread::current().id()) {
            return Err(KernelError::NotOwner);
        }
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            mutex.released.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process;

    const GEOMETRY: Geometry = Geometry {
        sector_size: 256,
        sector_count: 4,
    };

    #[test]
    fn sim_nor_semantics() {
        let driver = SimDriver::new(GEOMETRY);
        let mut flash = driver.open("/dev/rawflash", OpenFlags::WRITE).unwrap();

        assert_eq!(flash.write(10, &[0xF0, 0x0F]).unwrap(), 2);
        assert_eq!(flash.write(10, &[0x3C, 0xFF]).unwrap(), 2);
        let mut buf = [0; 2];
        flash.read(10, &mut buf).unwrap();
        assert_eq!(buf, [0x30, 0x0F]);

        flash
            .erase_sectors(EraseSectors {
                sector: 0,
                count: 1,
            })
            .unwrap();
        flash.read(10, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
    }

    #[test]
    fn sim_rejects_out_of_range() {
        let driver = SimDriver::new(GEOMETRY);
        let mut flash = driver.open("/dev/rawflash", OpenFlags::WRITE).unwrap();
        let mut buf = [0; 8];
        assert_eq!(flash.read(1020, &mut buf), Err(SimError::OutOfRange));
        assert_eq!(
            flash.erase_sectors(EraseSectors {
                sector: 3,
                count: 2
            }),
            Err(SimError::OutOfRange)
        );
    }

    #[test]
    fn sim_handles_share_contents() {
        let driver = SimDriver::new(GEOMETRY);
        let mut a = driver.open("/dev/rawflash", OpenFlags::WRITE).unwrap();
        let mut b = driver.clone().open("/dev/rawflash", OpenFlags::READ).unwrap();
        assert_eq!(driver.open_handles(), 2);

        a.write(0, &[1, 2, 3]).unwrap();
        let mut buf = [0; 3];
        b.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        drop(a);
        b.close().unwrap();
        assert_eq!(driver.open_handles(), 0);
        assert_eq!(&driver.contents()[..4], &[1, 2, 3, 0xFF]);
    }

    #[test]
    fn file_flash() {
        let path = env::temp_dir().join(format!("fcb-rawflash-{}.bin", process::id()));
        create_image(&path, GEOMETRY).unwrap();

        let driver = FileDriver::new(GEOMETRY);
        let path_str = path.to_str().unwrap();
        let mut flash = driver.open(path_str, OpenFlags::WRITE).unwrap();
        assert_eq!(flash.geometry().unwrap(), GEOMETRY);

        assert_eq!(flash.write(300, &[0x12, 0x34]).unwrap(), 2);
        let mut buf = [0; 2];
        assert_eq!(flash.read(300, &mut buf).unwrap(), 2);
        assert_eq!(buf, [0x12, 0x34]);

        flash
            .erase_sectors(EraseSectors {
                sector: 1,
                count: 1,
            })
            .unwrap();
        flash.read(300, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);

        assert!(flash.read(1023, &mut buf).is_err());
        flash.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn kernel_names_unique() {
        let kernel = HostKernel::new();
        let handle = kernel.mutex_create("lock", WaitType::Priority).unwrap();
        assert_eq!(kernel.wait_type(handle), Some(WaitType::Priority));
        assert_eq!(
            kernel.mutex_create("lock", WaitType::Fifo),
            Err(KernelError::NameInUse)
        );
        assert_eq!(kernel.mutex_lock(7, 0), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn ticks() {
        assert_eq!(ticks_to_duration(0), Some(Duration::from_millis(0)));
        assert_eq!(ticks_to_duration(250), Some(Duration::from_millis(250)));
        assert_eq!(ticks_to_duration(OS_TIMEOUT_NEVER), None);
    }
}
