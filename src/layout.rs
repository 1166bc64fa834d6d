//! On-disk structures of the filesystem.
//!
//! Every record is fixed-size, packed and host-endian: the codec is a plain
//! byte copy. Field sizes must not change, or images written by a previous
//! build become unreadable.

use crate::error::Error;

/// Signature identifying a formatted device ("NewF").
pub const MAGIC: u32 = 0x4e65_7746;
/// Inode number of the root directory.
pub const ROOT_INO: u32 = 0;
/// Maximum length of a file name, in bytes.
pub const MAX_NAME_LEN: usize = 24;
/// Number of direct block pointers per inode, bounding the size of a file.
pub const MAX_FILE_BLOCKS: usize = 6;

/// Type of a file.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    /// A directory.
    Dir = 1,
    /// A regular file.
    Reg = 2,
}

impl TryFrom<u32> for FileType {
    type Error = Error;

    fn try_from(n: u32) -> Result<Self, Error> {
        match n {
            1 => Ok(Self::Dir),
            2 => Ok(Self::Reg),
            _ => Err(Error::Inval),
        }
    }
}

/// The on-disk superblock, at byte offset zero of the device.
///
/// Region offsets and sizes are expressed in logical blocks.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DiskSuperblock {
    /// Filesystem signature.
    pub magic: u32,
    /// Usage counter.
    pub sz_usage: u32,
    /// Offset of the superblock region.
    pub sb_offset: u32,
    /// Size of the superblock region.
    pub sb_blks: u32,
    /// Offset of the inode bitmap.
    pub ino_map_offset: u32,
    /// Size of the inode bitmap.
    pub ino_map_blks: u32,
    /// Offset of the data bitmap.
    pub data_map_offset: u32,
    /// Size of the data bitmap.
    pub data_map_blks: u32,
    /// Offset of the inode table.
    pub ino_offset: u32,
    /// Size of the inode table.
    pub ino_blks: u32,
    /// Offset of the data region.
    pub data_offset: u32,
    /// Size of the data region.
    pub data_blks: u32,
    /// Volume identifier, stamped at format time.
    pub uuid: [u8; 16],
    /// Volume label, NUL padded.
    pub label: [u8; 16],
}

/// The on-disk inode record.
///
/// Records are addressed contiguously: the record of inode `i` starts at
/// byte `i * size_of::<DiskInode>()` within the inode table region.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// Inode number.
    pub ino: u32,
    /// Number of data blocks held by the file.
    pub size: u32,
    /// Type of the file, see [`FileType`].
    pub ftype: u32,
    /// Number of directory entries (directories only).
    pub dir_cnt: u32,
    /// Direct data block pointers; the first `size` entries are meaningful.
    pub block_pointer: [u32; MAX_FILE_BLOCKS],
}

/// The on-disk directory entry record.
///
/// Entries are packed back to back in the data blocks of the parent
/// directory; an entry never straddles a logical block boundary.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DiskDentry {
    /// File name, NUL padded.
    pub name: [u8; MAX_NAME_LEN],
    /// Type of the file, see [`FileType`].
    pub ftype: u32,
    /// Number of the named inode.
    pub ino: u32,
}

/// Packs `name` into a NUL padded record field, truncating it to
/// [`MAX_NAME_LEN`] bytes.
pub fn pack_name(name: &str) -> [u8; MAX_NAME_LEN] {
    let mut field = [0u8; MAX_NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_NAME_LEN);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Returns the name stored in a record field.
pub fn unpack_name(field: &[u8; MAX_NAME_LEN]) -> String {
    let len = field.iter().position(|b| *b == 0).unwrap_or(MAX_NAME_LEN);
    String::from_utf8_lossy(&field[..len]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_sizes() {
        // the on-disk format depends on these exact sizes
        assert_eq!(size_of::<DiskDentry>(), 32);
        assert_eq!(size_of::<DiskInode>(), 40);
        assert_eq!(size_of::<DiskSuperblock>(), 80);
    }

    #[test]
    fn records_per_block() {
        // with 512 byte IO units, one logical block holds 32 entries
        let blk = 1024;
        assert_eq!(blk / size_of::<DiskDentry>(), 32);
        assert_eq!(blk / size_of::<DiskInode>(), 25);
    }

    #[test]
    fn name_packing() {
        let field = pack_name("hello");
        assert_eq!(&field[..5], b"hello");
        assert_eq!(field[5], 0);
        assert_eq!(unpack_name(&field), "hello");
        // names at the limit survive unchanged
        let long = "a".repeat(MAX_NAME_LEN);
        assert_eq!(unpack_name(&pack_name(&long)), long);
    }

    #[test]
    fn file_type_tags() {
        assert_eq!(FileType::try_from(1).unwrap(), FileType::Dir);
        assert_eq!(FileType::try_from(2).unwrap(), FileType::Reg);
        assert!(FileType::try_from(7).is_err());
    }
}
