//! Access to the raw device backing a filesystem.

use crate::error::Error;
use crate::error::Result;
use crate::util::round_down;
use crate::util::round_up;
use libc::ioctl;
use std::ffi::c_int;
use std::ffi::c_long;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of the device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);
/// ioctl command: Get the logical sector size of the device in bytes.
const BLKSSZGET: c_long = ioc!(0, 0x12, 104, 0);

/// The IO unit assumed when the backing device is a regular file.
const FILE_IO_SIZE: usize = 512;

/// A handle on the raw device backing a filesystem.
///
/// The device itself only supports whole-IO-unit transfers. [`Device::read`]
/// and [`Device::write`] accept arbitrary byte ranges and translate them to
/// aligned unit accesses, so the layers above never deal with alignment.
pub struct Device {
    /// The device file.
    file: File,
    /// The atomic IO unit of the device, in bytes.
    sz_io: usize,
    /// The total size of the device, in bytes.
    sz_disk: u64,
}

impl Device {
    /// Opens the device at the given path and queries its geometry.
    ///
    /// Block and character devices report their size and IO unit through
    /// ioctls. A regular file stands in for a device, with its length as the
    /// size and a 512 byte IO unit.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let metadata = file.metadata()?;
        let file_type = metadata.file_type();
        let (sz_disk, sz_io) = if file_type.is_block_device() || file_type.is_char_device() {
            let mut size = 0u64;
            let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let mut io_size: c_int = 0;
            let ret = unsafe { ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut io_size) };
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
            (size, io_size as usize)
        } else if file_type.is_file() {
            (metadata.len(), FILE_IO_SIZE)
        } else {
            return Err(Error::Inval);
        };
        Ok(Self {
            file,
            sz_io,
            sz_disk,
        })
    }

    /// Returns the atomic IO unit of the device, in bytes.
    pub fn io_size(&self) -> usize {
        self.sz_io
    }

    /// Returns the total size of the device, in bytes.
    pub fn disk_size(&self) -> u64 {
        self.sz_disk
    }

    /// Reads `buf.len()` bytes at the byte offset `offset`.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let io = self.sz_io as u64;
        let aligned_off = round_down(offset, io);
        let bias = (offset - aligned_off) as usize;
        let aligned_len = round_up((bias + buf.len()) as u64, io) as usize;
        let mut scratch = vec![0u8; aligned_len];
        self.transfer_in(aligned_off, &mut scratch)?;
        buf.copy_from_slice(&scratch[bias..(bias + buf.len())]);
        Ok(())
    }

    /// Writes `buf` at the byte offset `offset`.
    ///
    /// A write that does not cover whole IO units reads the surrounding
    /// units back, patches them, then writes them out.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let io = self.sz_io as u64;
        let aligned_off = round_down(offset, io);
        let bias = (offset - aligned_off) as usize;
        let aligned_len = round_up((bias + buf.len()) as u64, io) as usize;
        let mut scratch = vec![0u8; aligned_len];
        self.transfer_in(aligned_off, &mut scratch)?;
        scratch[bias..(bias + buf.len())].copy_from_slice(buf);
        self.transfer_out(aligned_off, &scratch)
    }

    /// Reads whole IO units into `buf`, starting at the aligned offset
    /// `offset`.
    fn transfer_in(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        for unit in buf.chunks_mut(self.sz_io) {
            self.file.read_exact(unit)?;
        }
        Ok(())
    }

    /// Writes whole IO units from `buf`, starting at the aligned offset
    /// `offset`.
    fn transfer_out(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        for unit in buf.chunks(self.sz_io) {
            self.file.write_all(unit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::process;

    fn scratch_device(name: &str, len: u64) -> PathBuf {
        let path = env::temp_dir().join(format!("newfs-dev-{}-{name}", process::id()));
        let file = File::create(&path).unwrap();
        file.set_len(len).unwrap();
        path
    }

    #[test]
    fn geometry_from_regular_file() {
        let path = scratch_device("geom", 4 << 20);
        let dev = Device::open(&path).unwrap();
        assert_eq!(dev.disk_size(), 4 << 20);
        assert_eq!(dev.io_size(), 512);
        fs::remove_file(path).ok();
    }

    #[test]
    fn misaligned_roundtrip() {
        let path = scratch_device("rw", 8192);
        let mut dev = Device::open(&path).unwrap();
        // neither the offset nor the length is unit aligned
        dev.write(700, b"hello device").unwrap();
        let mut buf = [0u8; 12];
        dev.read(700, &mut buf).unwrap();
        assert_eq!(&buf, b"hello device");
        // a read spanning two IO units sees the same bytes
        let mut wide = [0u8; 600];
        dev.read(400, &mut wide).unwrap();
        assert_eq!(&wide[300..312], b"hello device");
        fs::remove_file(path).ok();
    }

    #[test]
    fn rewrite_same_bytes_is_noop() {
        let path = scratch_device("noop", 4096);
        let mut dev = Device::open(&path).unwrap();
        let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        dev.write(0, &pattern).unwrap();
        let before = fs::read(&path).unwrap();

        let mut buf = [0u8; 33];
        dev.read(777, &mut buf).unwrap();
        dev.write(777, &buf).unwrap();

        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
        fs::remove_file(path).ok();
    }
}
