//! Filesystem abstraction.
//!
//! Two kinds of storage back virtual memory:
//! - regular files, read and written at byte granularity through an open
//!   [`File`] handle (executables and memory-mapped files), and
//! - a raw block device addressed by [`Sector`] through a [`Disk`] (the swap
//!   partition).
//!
//! Both are consumed through the traits of [`traits`], so the virtual memory
//! subsystem never depends on a concrete filesystem or device driver.

use crate::{KernelError, sync::SpinLock};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Defines traits for file system operations.
pub mod traits {
    use super::{FileBlockNumber, Sector, SECTOR_SIZE};
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports basic read and write
    /// operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` which to read.
        /// - `buf`: A mutable array where the file content will be stored.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block lies within the file.
        /// - `Ok(false)`: If the block lies beyond the end of the file.
        /// - `Err(Error)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file may be extended up to `min_size` bytes to accommodate the
        /// write. Bytes of `buf` beyond the resulting file size are ignored.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` indicating the block to write to.
        /// - `buf`: A buffer containing exactly 4096 bytes of data to write.
        /// - `min_size`: The desired minimum file size (in bytes) after the
        ///   write. If this value is less than or equal to the current file
        ///   size, no growth occurs.
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; 4096],
            min_size: usize,
        ) -> Result<(), KernelError>;
    }

    /// Trait representing a block device.
    ///
    /// A block device is an array of [`SECTOR_SIZE`]-byte sectors.
    pub trait BlockDevice
    where
        Self: Send + Sync,
    {
        /// Returns the number of sectors of the device.
        fn nr_sectors(&self) -> usize;

        /// Reads a sector into `buf`.
        fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

        /// Writes `buf` into a sector.
        fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
    }
}

/// Represents a file block number within a file.
///
/// This number refers to the position of a block within a specific file.
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / 0x1000)
    }

    /// Byte offset where the block starts.
    pub const fn into_offset(self) -> usize {
        self.0 * 0x1000
    }
}

/// This struct provides a reference-counted handle to a file that supports
/// reading and writing operations at the kernel level.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data from the file at `position` into the provided buffer.
    ///
    /// Reading stops at the end of the file.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, mut position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let max_read = self
            .size()
            .min(position + buf.len())
            .saturating_sub(position);
        let mut read_bytes = 0;
        let first_segment = position & 0xfff;
        if first_segment != 0 && max_read != 0 {
            self.0.read(
                FileBlockNumber::from_offset(position & !0xfff),
                &mut bounce_buffer,
            )?;
            read_bytes += (0x1000 - first_segment).min(max_read);
            buf[..read_bytes]
                .copy_from_slice(&bounce_buffer[first_segment..first_segment + read_bytes]);
            position += read_bytes;
        }

        for i in (read_bytes..max_read).step_by(0x1000) {
            self.0
                .read(FileBlockNumber::from_offset(position), &mut bounce_buffer)?;
            let remainder = (max_read - i).min(0x1000);
            buf[i..i + remainder].copy_from_slice(&bounce_buffer[..remainder]);
            position += remainder;
            read_bytes += remainder;
        }
        Ok(read_bytes)
    }

    /// Writes data from the buffer into the file at `position`.
    ///
    /// If the write position is beyond the current file size, file will be
    /// extended to minimum size required to reflect the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, mut position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let mut write_bytes = 0;
        while write_bytes < buf.len() {
            let ofs = position & 0xfff;
            let chunk = (0x1000 - ofs).min(buf.len() - write_bytes);
            let fba = FileBlockNumber::from_offset(position);
            if chunk != 0x1000 {
                // Partial block: merge with what is already there.
                self.0.read(fba, &mut bounce_buffer)?;
            }
            bounce_buffer[ofs..ofs + chunk].copy_from_slice(&buf[write_bytes..write_bytes + chunk]);
            self.0.write(fba, &bounce_buffer, position + chunk)?;
            position += chunk;
            write_bytes += chunk;
        }
        Ok(write_bytes)
    }
}

/// An open file.
///
/// A [`File`] couples a [`RegularFile`] with a file position. Handles are
/// independent: [`File::duplicate`] returns a new handle whose position moves
/// separately from the original, while both observe the same file contents.
pub struct File {
    file: RegularFile,
    position: usize,
}

impl File {
    /// Opens a handle to `file` positioned at the beginning of the file.
    pub fn open(file: RegularFile) -> Self {
        Self { file, position: 0 }
    }

    /// Returns a new, independent handle to the same file.
    pub fn duplicate(&self) -> Self {
        Self {
            file: self.file.clone(),
            position: self.position,
        }
    }

    /// Closes the handle.
    pub fn close(self) {}

    /// Moves the file position to `position`.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Returns the current file position.
    pub fn tell(&self) -> usize {
        self.position
    }

    /// Length of the file in bytes.
    pub fn len(&self) -> usize {
        self.file.size()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads from the current position, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.file.read(self.position, buf)?;
        self.position += n;
        Ok(n)
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, KernelError> {
        let n = self.file.write(self.position, buf)?;
        self.position += n;
        Ok(n)
    }
}

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// The type for disk hooking.
///
/// A hook observes every sector access before it reaches the device, with
/// `true` for a write. Returning an error fails the access.
pub type Hook = Arc<
    dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync + 'static,
>;

/// The disk, a device that has byte sink.
pub struct Disk {
    dev: Arc<dyn traits::BlockDevice>,
    is_ro: bool,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new disk on top of a block device.
    pub fn new(dev: Arc<dyn traits::BlockDevice>) -> Self {
        Self {
            dev,
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(self) -> Self {
        Self {
            is_ro: true,
            ..self
        }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// Number of sectors of the disk.
    pub fn nr_sectors(&self) -> usize {
        self.dev.nr_sectors()
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.nr_sectors() {
            return Err(KernelError::IOError);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        self.dev.read(sector, buf)
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.nr_sectors() {
            Err(KernelError::IOError)
        } else if self.is_ro {
            Err(KernelError::NotSupportedOperation)
        } else {
            if let Some(hook) = self.hook.as_ref() {
                hook(sector, buf, true)?;
            }
            self.dev.write(sector, buf)
        }
    }
}

/// A block device backed by main memory.
pub struct RamDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
    /// Creates a zero-filled device of `nr_sectors` sectors.
    pub fn new(nr_sectors: usize) -> Self {
        Self {
            sectors: SpinLock::new(alloc::vec![[0; SECTOR_SIZE]; nr_sectors]),
        }
    }
}

impl traits::BlockDevice for RamDisk {
    fn nr_sectors(&self) -> usize {
        let sectors = self.sectors.lock();
        let n = sectors.len();
        sectors.unlock();
        n
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock();
        let result = match sectors.get(sector.into_usize()) {
            Some(s) => {
                buf.copy_from_slice(s);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock();
        let result = match sectors.get_mut(sector.into_usize()) {
            Some(s) => {
                s.copy_from_slice(buf);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }
}

/// A regular file whose contents live in main memory.
#[derive(Default)]
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
}

impl MemFile {
    /// Creates a file holding `contents`.
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: SpinLock::new(contents.to_vec()),
        }
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        let data = self.data.lock();
        let v = data.clone();
        data.unlock();
        v
    }

    /// Shrinks the file to `len` bytes.
    pub fn truncate(&self, len: usize) {
        let mut data = self.data.lock();
        data.truncate(len);
        data.unlock();
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        let data = self.data.lock();
        let size = data.len();
        data.unlock();
        size
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        let data = self.data.lock();
        let start = fba.into_offset();
        let found = start < data.len();
        buf.fill(0);
        if found {
            let n = (data.len() - start).min(4096);
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        data.unlock();
        Ok(found)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; 4096],
        min_size: usize,
    ) -> Result<(), KernelError> {
        let mut data = self.data.lock();
        let start = fba.into_offset();
        let size = data.len().max(min_size);
        let result = if start >= size {
            Err(KernelError::InvalidArgument)
        } else {
            data.resize(size, 0);
            let n = (size - start).min(4096);
            data[start..start + n].copy_from_slice(&buf[..n]);
            Ok(())
        };
        data.unlock();
        result
    }
}
