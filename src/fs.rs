/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Filesystem orchestration: mounting, allocation, persistence and path
//! resolution.
//!
//! Everything between mount and unmount happens in memory: allocation flips
//! bitmap bits, files grow in their buffers, directories relink their child
//! lists. The disk is read on first reference to an inode and written back
//! in one recursive pass when the filesystem is unmounted.

use crate::bitmap::Bitmap;
use crate::device::Device;
use crate::error::Error;
use crate::error::Result;
use crate::inode::Dentry;
use crate::inode::DentryRef;
use crate::inode::Inode;
use crate::inode::InodeRef;
use crate::layout::DiskDentry;
use crate::layout::DiskInode;
use crate::layout::DiskSuperblock;
use crate::layout::FileType;
use crate::layout::MAGIC;
use crate::layout::MAX_FILE_BLOCKS;
use crate::layout::ROOT_INO;
use crate::layout::pack_name;
use crate::layout::unpack_name;
use crate::util::ceil_division;
use crate::util::reinterpret;
use crate::util::reinterpret_mut;
use std::cell::RefCell;
use std::mem;
use std::mem::size_of;
use std::path::Path;
use std::rc::Rc;
use uuid::Uuid;

/// The in-memory superblock: region layout and volume identity.
///
/// Offsets and sizes are in logical blocks.
pub struct Superblock {
    /// Usage counter, persisted round-trip.
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
    /// Volume identifier.
    pub uuid: [u8; 16],
    /// Volume label, NUL padded.
    pub label: [u8; 16],
}

impl Superblock {
    fn from_disk(rec: &DiskSuperblock) -> Self {
        Self {
            sz_usage: rec.sz_usage,
            sb_offset: rec.sb_offset,
            sb_blks: rec.sb_blks,
            ino_map_offset: rec.ino_map_offset,
            ino_map_blks: rec.ino_map_blks,
            data_map_offset: rec.data_map_offset,
            data_map_blks: rec.data_map_blks,
            ino_offset: rec.ino_offset,
            ino_blks: rec.ino_blks,
            data_offset: rec.data_offset,
            data_blks: rec.data_blks,
            uuid: rec.uuid,
            label: rec.label,
        }
    }

    fn to_disk(&self) -> DiskSuperblock {
        DiskSuperblock {
            magic: MAGIC,
            sz_usage: self.sz_usage,
            sb_offset: self.sb_offset,
            sb_blks: self.sb_blks,
            ino_map_offset: self.ino_map_offset,
            ino_map_blks: self.ino_map_blks,
            data_map_offset: self.data_map_offset,
            data_map_blks: self.data_map_blks,
            ino_offset: self.ino_offset,
            ino_blks: self.ino_blks,
            data_offset: self.data_offset,
            data_blks: self.data_blks,
            uuid: self.uuid,
            label: self.label,
        }
    }
}

/// Result of a path lookup.
pub struct Lookup {
    /// The entry the path resolved to. On a miss, the closest existing
    /// ancestor, or the regular file that ended the walk early.
    pub dentry: DentryRef,
    /// Whether the full path resolved.
    pub found: bool,
    /// Whether the path names the root itself.
    pub is_root: bool,
}

/// Usage counters computed from the allocation bitmaps.
pub struct Usage {
    /// Allocated inode slots.
    pub inodes_used: usize,
    /// Total inode slots.
    pub inodes_total: usize,
    /// Allocated data blocks.
    pub blocks_used: usize,
    /// Total data blocks.
    pub blocks_total: usize,
}

/// A mounted filesystem.
pub struct NewFs {
    /// The backing device.
    dev: Device,
    /// The logical block size in bytes, twice the device IO unit.
    sz_logic: usize,
    /// The region layout and volume identity.
    sb: Superblock,
    /// The inode allocation bitmap.
    map_inode: Bitmap,
    /// The data block allocation bitmap.
    map_data: Bitmap,
    /// The root directory entry.
    root: DentryRef,
    /// Cleared once the filesystem has been unmounted.
    is_mounted: bool,
}

impl NewFs {
    /// Tells whether the device at `path` carries a formatted filesystem.
    pub fn probe(path: &Path) -> Result<bool> {
        let mut dev = Device::open(path)?;
        let mut rec: DiskSuperblock = unsafe { mem::zeroed() };
        dev.read(0, reinterpret_mut(&mut rec))?;
        Ok(rec.magic == MAGIC)
    }

    /// Mounts the filesystem on the device at `path`.
    ///
    /// A device whose superblock magic does not match is considered fresh
    /// and formatted on the fly.
    pub fn mount(path: &Path) -> Result<Self> {
        Self::mount_impl(path, None, false)
    }

    /// Formats the device at `path` unconditionally, then returns it
    /// mounted. `label` is the optional volume label.
    pub fn format(path: &Path, label: Option<&str>) -> Result<Self> {
        Self::mount_impl(path, label, true)
    }

    fn mount_impl(path: &Path, label: Option<&str>, force_format: bool) -> Result<Self> {
        let mut dev = Device::open(path)?;
        let sz_logic = dev.io_size() * 2;
        let mut rec: DiskSuperblock = unsafe { mem::zeroed() };
        dev.read(0, reinterpret_mut(&mut rec))?;
        let is_init = force_format || rec.magic != MAGIC;
        let sb = if is_init {
            Self::fresh_layout(&dev, sz_logic, label)?
        } else {
            Superblock::from_disk(&rec)
        };

        let ino_map_len = sb.ino_map_blks as usize * sz_logic;
        let data_map_len = sb.data_map_blks as usize * sz_logic;
        let ino_capacity = (sz_logic / size_of::<DiskInode>()) * sb.ino_blks as usize;
        let data_capacity = sb.data_blks as usize;
        let (map_inode, map_data) = if is_init {
            (
                Bitmap::zeroed(ino_map_len, ino_capacity),
                Bitmap::zeroed(data_map_len, data_capacity),
            )
        } else {
            let mut ino_bytes = vec![0u8; ino_map_len];
            dev.read(sb.ino_map_offset as u64 * sz_logic as u64, &mut ino_bytes)?;
            let mut data_bytes = vec![0u8; data_map_len];
            dev.read(sb.data_map_offset as u64 * sz_logic as u64, &mut data_bytes)?;
            (
                Bitmap::from_bytes(ino_bytes, ino_capacity),
                Bitmap::from_bytes(data_bytes, data_capacity),
            )
        };

        let root = Dentry::root();
        let mut fs = Self {
            dev,
            sz_logic,
            sb,
            map_inode,
            map_data,
            root: root.clone(),
            is_mounted: false,
        };
        if is_init {
            // allocate the root inode (bit 0) and one data block for its
            // initially empty listing, then flush it
            let root_inode = fs.alloc_inode(&root)?;
            let blk = fs.alloc_data_blk()?;
            {
                let mut node = root_inode.borrow_mut();
                node.blocks[0] = blk;
                node.size = 1;
            }
            fs.sync_inode(&root_inode)?;
            root.detach_inode();
        }
        fs.read_inode(&root, ROOT_INO)?;
        fs.is_mounted = true;
        Ok(fs)
    }

    /// Computes the region layout for a fresh device.
    fn fresh_layout(dev: &Device, sz_logic: usize, label: Option<&str>) -> Result<Superblock> {
        let logic_blk_num = (dev.disk_size() / sz_logic as u64) as u32;
        let ino_blks = ceil_division(
            logic_blk_num as u64 * size_of::<DiskInode>() as u64,
            sz_logic as u64,
        ) as u32;
        let sb_offset = 0;
        let sb_blks = 1;
        let ino_map_offset = sb_offset + sb_blks;
        let ino_map_blks = 1;
        let data_map_offset = ino_map_offset + ino_map_blks;
        let data_map_blks = 1;
        let ino_offset = data_map_offset + data_map_blks;
        let meta_blks = sb_blks + ino_map_blks + data_map_blks + ino_blks;
        if logic_blk_num <= meta_blks {
            return Err(Error::NoSpace);
        }
        let mut lab = [0u8; 16];
        if let Some(label) = label {
            let bytes = label.as_bytes();
            let len = bytes.len().min(lab.len());
            lab[..len].copy_from_slice(&bytes[..len]);
        }
        Ok(Superblock {
            sz_usage: 0,
            sb_offset,
            sb_blks,
            ino_map_offset,
            ino_map_blks,
            data_map_offset,
            data_map_blks,
            ino_offset,
            ino_blks,
            data_offset: ino_offset + ino_blks,
            data_blks: logic_blk_num - meta_blks,
            uuid: *Uuid::new_v4().as_bytes(),
            label: lab,
        })
    }

    /// Flushes the whole tree, the superblock and the bitmaps, then marks
    /// the filesystem unmounted. The device handle closes when the value is
    /// dropped.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.is_mounted {
            return Ok(());
        }
        if let Some(root_inode) = self.root.inode() {
            self.sync_inode(&root_inode)?;
        }
        let rec = self.sb.to_disk();
        self.dev.write(0, reinterpret(&rec))?;
        let ino_map_off = self.blks_sz(self.sb.ino_map_offset);
        let data_map_off = self.blks_sz(self.sb.data_map_offset);
        self.dev.write(ino_map_off, self.map_inode.as_bytes())?;
        self.dev.write(data_map_off, self.map_data.as_bytes())?;
        self.is_mounted = false;
        Ok(())
    }

    /// Returns the root directory entry.
    pub fn root(&self) -> DentryRef {
        self.root.clone()
    }

    /// Returns the logical block size in bytes.
    pub fn block_size(&self) -> usize {
        self.sz_logic
    }

    /// Returns the in-memory superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Returns the volume identifier.
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.sb.uuid)
    }

    /// Returns the volume label.
    pub fn label(&self) -> String {
        let len = self
            .sb
            .label
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.sb.label.len());
        String::from_utf8_lossy(&self.sb.label[..len]).into_owned()
    }

    /// Returns usage counters computed from the bitmaps.
    pub fn usage(&self) -> Usage {
        Usage {
            inodes_used: self.map_inode.used(),
            inodes_total: self.map_inode.capacity(),
            blocks_used: self.map_data.used(),
            blocks_total: self.map_data.capacity(),
        }
    }

    /// Converts a count of logical blocks to bytes.
    fn blks_sz(&self, blks: u32) -> u64 {
        blks as u64 * self.sz_logic as u64
    }

    /// Byte offset of the record of inode `ino`.
    fn ino_rec_offset(&self, ino: u32) -> u64 {
        self.blks_sz(self.sb.ino_offset) + ino as u64 * size_of::<DiskInode>() as u64
    }

    /// Byte offset of the data block `blk` (region-relative index).
    fn data_blk_offset(&self, blk: u32) -> u64 {
        self.blks_sz(self.sb.data_offset + blk)
    }

    /// Number of directory entry records per logical block.
    fn dentry_per_blk(&self) -> usize {
        self.sz_logic / size_of::<DiskDentry>()
    }

    /// Allocates a data block and returns its region-relative index.
    pub fn alloc_data_blk(&mut self) -> Result<u32> {
        let idx = self.map_data.alloc().ok_or(Error::NoSpace)?;
        Ok(idx as u32)
    }

    /// Allocates an inode number for `dentry` and links a zeroed in-memory
    /// inode to it.
    pub fn alloc_inode(&mut self, dentry: &DentryRef) -> Result<InodeRef> {
        let ino = self.map_inode.alloc().ok_or(Error::NoSpace)? as u32;
        let inode = Rc::new(RefCell::new(Inode::new(ino, dentry)));
        dentry.set_ino(ino);
        dentry.attach_inode(inode.clone());
        Ok(inode)
    }

    /// Inserts `dentry` as a child of the directory `inode` and returns the
    /// new entry count.
    ///
    /// A data block is allocated only when the new entry starts a block that
    /// `size` does not cover yet. Entries replayed from disk and the root's
    /// preallocated block therefore never allocate twice.
    pub fn alloc_dentry(&mut self, inode: &InodeRef, dentry: DentryRef) -> Result<u32> {
        let dpb = self.dentry_per_blk() as u32;
        let needs_blk = {
            let node = inode.borrow();
            node.dir_cnt % dpb == 0 && node.dir_cnt / dpb >= node.size
        };
        if needs_blk {
            if inode.borrow().size as usize >= MAX_FILE_BLOCKS {
                return Err(Error::NoSpace);
            }
            let blk = self.alloc_data_blk()?;
            let mut node = inode.borrow_mut();
            let size = node.size as usize;
            node.blocks[size] = blk;
            node.size += 1;
        }
        let mut node = inode.borrow_mut();
        if let Some(parent) = node.dentry() {
            dentry.set_parent(&parent);
        }
        node.insert_child(dentry);
        Ok(node.dir_cnt)
    }

    /// Ensures the inode named by `dentry` is loaded and returns it.
    pub fn load_inode(&mut self, dentry: &DentryRef) -> Result<InodeRef> {
        match dentry.inode() {
            Some(inode) => Ok(inode),
            None => self.read_inode(dentry, dentry.ino()),
        }
    }

    /// Reads the record of inode `ino` from disk, rebuilds the in-memory
    /// inode and attaches it to `dentry`.
    ///
    /// A directory gets its child entries rebuilt unloaded; a regular file
    /// gets its contents read in full.
    pub fn read_inode(&mut self, dentry: &DentryRef, ino: u32) -> Result<InodeRef> {
        let mut rec: DiskInode = unsafe { mem::zeroed() };
        let off = self.ino_rec_offset(ino);
        self.dev.read(off, reinterpret_mut(&mut rec))?;
        let inode = Rc::new(RefCell::new(Inode::new(rec.ino, dentry)));
        dentry.attach_inode(inode.clone());
        match dentry.ftype() {
            FileType::Dir => {
                // keep the block pointers from the record, then replay the
                // stored entries through the normal insertion path, which
                // rebuilds size and dir_cnt without re-allocating
                {
                    let mut node = inode.borrow_mut();
                    node.blocks = rec.block_pointer;
                    node.size = rec.size;
                    node.dir_cnt = 0;
                }
                let dpb = self.dentry_per_blk();
                let rec_sz = size_of::<DiskDentry>();
                let blocks = rec.block_pointer;
                for i in 0..rec.dir_cnt as usize {
                    let blk = *blocks.get(i / dpb).ok_or(Error::Inval)?;
                    let off = self.data_blk_offset(blk) + ((i % dpb) * rec_sz) as u64;
                    let mut drec: DiskDentry = unsafe { mem::zeroed() };
                    self.dev.read(off, reinterpret_mut(&mut drec))?;
                    let name = drec.name;
                    let child = Dentry::new(&unpack_name(&name), FileType::try_from(drec.ftype)?)?;
                    child.set_ino(drec.ino);
                    self.alloc_dentry(&inode, child)?;
                }
            }
            FileType::Reg => {
                let blocks = rec.block_pointer;
                let size = rec.size as usize;
                if size > MAX_FILE_BLOCKS {
                    return Err(Error::Inval);
                }
                let sz_logic = self.sz_logic;
                let mut data = vec![0u8; size * sz_logic];
                for (i, blk) in blocks[..size].iter().enumerate() {
                    let off = self.data_blk_offset(*blk);
                    let start = i * sz_logic;
                    self.dev.read(off, &mut data[start..start + sz_logic])?;
                }
                let mut node = inode.borrow_mut();
                node.blocks = blocks;
                node.size = rec.size;
                node.data = Some(data);
            }
        }
        Ok(inode)
    }

    /// Writes `inode` and everything below it back to disk.
    ///
    /// Directory contents are re-packed in child list order; children whose
    /// inode is loaded are synced recursively. Unloaded children were never
    /// touched, so their records on disk are still current.
    pub fn sync_inode(&mut self, inode: &InodeRef) -> Result<()> {
        let (rec, ftype, children) = {
            let node = inode.borrow();
            let ftype = node.dentry().map(|d| d.ftype()).ok_or(Error::Inval)?;
            let rec = DiskInode {
                ino: node.ino,
                size: node.size,
                ftype: ftype as u32,
                dir_cnt: node.dir_cnt,
                block_pointer: node.blocks,
            };
            (rec, ftype, node.children.clone())
        };
        let off = self.ino_rec_offset(rec.ino);
        self.dev.write(off, reinterpret(&rec))?;
        match ftype {
            FileType::Dir => {
                let dpb = self.dentry_per_blk();
                let rec_sz = size_of::<DiskDentry>();
                let blocks = rec.block_pointer;
                for (i, child) in children.iter().enumerate() {
                    let blk = *blocks.get(i / dpb).ok_or(Error::Inval)?;
                    let off = self.data_blk_offset(blk) + ((i % dpb) * rec_sz) as u64;
                    let drec = DiskDentry {
                        name: pack_name(child.name()),
                        ftype: child.ftype() as u32,
                        ino: child.ino(),
                    };
                    self.dev.write(off, reinterpret(&drec))?;
                }
                for child in &children {
                    if let Some(child_inode) = child.inode() {
                        self.sync_inode(&child_inode)?;
                    }
                }
            }
            FileType::Reg => {
                let sz_logic = self.sz_logic;
                let node = inode.borrow();
                if let Some(data) = &node.data {
                    for i in 0..node.size as usize {
                        let off = self.data_blk_offset(node.blocks[i]);
                        let start = i * sz_logic;
                        self.dev.write(off, &data[start..start + sz_logic])?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases `inode` and everything below it: every inode bit and data
    /// block bit of the subtree is cleared and the in-memory state is torn
    /// down.
    ///
    /// The entry naming the inode stays in its parent; unlinking it is the
    /// caller's move. Dropping the root is refused.
    pub fn drop_inode(&mut self, inode: &InodeRef) -> Result<()> {
        if self
            .root
            .inode()
            .is_some_and(|root| Rc::ptr_eq(&root, inode))
        {
            return Err(Error::Inval);
        }
        if inode.borrow().is_dir() {
            loop {
                let child = inode.borrow().children.first().cloned();
                let Some(child) = child else {
                    break;
                };
                // an unloaded child still owns disk blocks; load it so they
                // can be released
                let child_inode = match child.inode() {
                    Some(loaded) => loaded,
                    None => self.read_inode(&child, child.ino())?,
                };
                self.drop_inode(&child_inode)?;
                inode.borrow_mut().drop_dentry(&child)?;
            }
        }
        {
            let node = inode.borrow();
            self.map_inode.free(node.ino as usize);
            for i in 0..node.size as usize {
                self.map_data.free(node.blocks[i] as usize);
            }
        }
        let mut node = inode.borrow_mut();
        node.data = None;
        node.children.clear();
        if let Some(dentry) = node.dentry() {
            dentry.detach_inode();
        }
        Ok(())
    }

    /// Copies file contents at byte offset `offset` into `buf` and returns
    /// the number of bytes copied.
    ///
    /// An absent buffer is materialized as zeros covering the allocated
    /// blocks. A loaded file never hits that branch, since loading fills
    /// the buffer eagerly.
    pub fn read_file(&self, inode: &InodeRef, buf: &mut [u8], offset: usize) -> Result<usize> {
        let mut node = inode.borrow_mut();
        let len = node.size as usize * self.sz_logic;
        let data = node.data.get_or_insert_with(|| vec![0u8; len]);
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    /// Writes `buf` into the file at byte offset `offset`, allocating data
    /// blocks and growing the in-memory buffer as needed.
    ///
    /// The disk is untouched until the inode is synced.
    pub fn write_file(&mut self, inode: &InodeRef, buf: &[u8], offset: usize) -> Result<usize> {
        let required = ceil_division((offset + buf.len()) as u64, self.sz_logic as u64) as u32;
        if required > inode.borrow().size {
            if required as usize > MAX_FILE_BLOCKS {
                return Err(Error::NoSpace);
            }
            while inode.borrow().size < required {
                let blk = self.alloc_data_blk()?;
                let mut node = inode.borrow_mut();
                let size = node.size as usize;
                node.blocks[size] = blk;
                node.size += 1;
            }
        }
        let mut node = inode.borrow_mut();
        let len = node.size as usize * self.sz_logic;
        if let Some(data) = &mut node.data {
            // keep the bytes already written, zero fill the new region
            data.resize(len, 0);
        } else {
            node.data = Some(vec![0u8; len]);
        }
        let data = node.data.as_mut().ok_or(Error::Inval)?;
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    /// Resolves a `/` separated path from the root.
    ///
    /// On a miss the returned entry is the closest existing ancestor, with
    /// `found` cleared, so the caller can decide to create the missing
    /// entry. Walking through a regular file stops there and returns the
    /// file's entry, `found` cleared. The returned entry always has its
    /// inode loaded.
    pub fn lookup(&mut self, path: &str) -> Result<Lookup> {
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut cursor = self.root.clone();
        if names.is_empty() {
            self.load_inode(&cursor)?;
            return Ok(Lookup {
                dentry: cursor,
                found: true,
                is_root: true,
            });
        }
        let total = names.len();
        let mut found = false;
        for (lvl, name) in names.iter().enumerate() {
            let inode = self.load_inode(&cursor)?;
            if cursor.ftype() == FileType::Reg {
                // walked into a regular file with components left
                break;
            }
            let child = inode.borrow().find_child(name);
            let Some(child) = child else {
                break;
            };
            found = lvl + 1 == total;
            cursor = child;
        }
        self.load_inode(&cursor)?;
        Ok(Lookup {
            dentry: cursor,
            found,
            is_root: false,
        })
    }
}

/// Returns the last component of a `/` separated path, borrowed from the
/// input.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use std::fs;
    use std::fs::File;
    use std::path::PathBuf;
    use std::process;

    const IMAGE_SIZE: u64 = 4 << 20;

    /// A scratch image file, deleted when the value is dropped.
    struct TestImage(PathBuf);

    impl TestImage {
        fn new(name: &str) -> Self {
            let path = env::temp_dir().join(format!("newfs-img-{}-{name}", process::id()));
            let file = File::create(&path).unwrap();
            file.set_len(IMAGE_SIZE).unwrap();
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TestImage {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    /// Creates `name` of type `ftype` under the directory entry `parent`,
    /// the way the callback dispatcher composes the core operations.
    fn create(fs: &mut NewFs, parent: &DentryRef, name: &str, ftype: FileType) -> DentryRef {
        let dir_inode = fs.load_inode(parent).unwrap();
        let dentry = Dentry::new(name, ftype).unwrap();
        fs.alloc_dentry(&dir_inode, dentry.clone()).unwrap();
        fs.alloc_inode(&dentry).unwrap();
        dentry
    }

    #[test]
    fn fresh_format() {
        let img = TestImage::new("fresh");
        assert!(!NewFs::probe(img.path()).unwrap());
        let mut fs = NewFs::mount(img.path()).unwrap();
        // 4 MiB with 512 byte IO units: 1024 byte blocks, 4096 of them
        assert_eq!(fs.block_size(), 1024);
        let sb = fs.superblock();
        assert_eq!(sb.ino_offset, 3);
        assert_eq!(sb.ino_blks, 160);
        assert_eq!(sb.data_offset, 163);
        assert_eq!(sb.data_blks, 4096 - 163);
        // the root consumed inode 0 and one data block
        let root_inode = fs.root().inode().unwrap();
        assert_eq!(root_inode.borrow().ino(), ROOT_INO);
        assert_eq!(root_inode.borrow().size(), 1);
        assert_eq!(root_inode.borrow().dir_cnt(), 0);
        let usage = fs.usage();
        assert_eq!(usage.inodes_used, 1);
        assert_eq!(usage.blocks_used, 1);
        fs.unmount().unwrap();
        assert!(NewFs::probe(img.path()).unwrap());
    }

    #[test]
    fn remount_empty_root() {
        let img = TestImage::new("remount");
        let mut fs = NewFs::mount(img.path()).unwrap();
        fs.unmount().unwrap();
        drop(fs);
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root_inode = fs.root().inode().unwrap();
        assert_eq!(root_inode.borrow().dir_cnt(), 0);
        assert_eq!(fs.usage().inodes_used, 1);
        fs.unmount().unwrap();
    }

    #[test]
    fn mkdir_allocates_next_inode() {
        let img = TestImage::new("mkdir");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let a = create(&mut fs, &root, "a", FileType::Dir);
        assert_eq!(a.ino(), 1);
        let root_inode = root.inode().unwrap();
        assert_eq!(root_inode.borrow().dir_cnt(), 1);
        // no data block is consumed for the entry: the root's format-time
        // block covers it
        assert_eq!(fs.usage().blocks_used, 1);
        assert_eq!(fs.usage().inodes_used, 2);
        fs.unmount().unwrap();
    }

    #[test]
    fn write_survives_remount() {
        let img = TestImage::new("rw");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let a = create(&mut fs, &root, "a", FileType::Dir);
        let b = create(&mut fs, &a, "b", FileType::Reg);
        let b_inode = b.inode().unwrap();
        fs.write_file(&b_inode, b"hello", 0).unwrap();
        assert_eq!(b_inode.borrow().size(), 1);
        fs.unmount().unwrap();
        drop(fs);

        let mut fs = NewFs::mount(img.path()).unwrap();
        let hit = fs.lookup("/a/b").unwrap();
        assert!(hit.found);
        assert!(!hit.is_root);
        let inode = hit.dentry.inode().unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(fs.read_file(&inode, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.unmount().unwrap();
    }

    #[test]
    fn directory_spills_into_second_block() {
        let img = TestImage::new("spill");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        // 32 entries per 1024 byte block: the 33rd starts block two
        for i in 0..33 {
            create(&mut fs, &root, &format!("f{i:02}"), FileType::Reg);
        }
        let root_inode = root.inode().unwrap();
        assert_eq!(root_inode.borrow().dir_cnt(), 33);
        assert_eq!(root_inode.borrow().size(), 2);
        fs.unmount().unwrap();
        drop(fs);

        let mut fs = NewFs::mount(img.path()).unwrap();
        let root_inode = fs.root().inode().unwrap();
        assert_eq!(root_inode.borrow().dir_cnt(), 33);
        assert_eq!(root_inode.borrow().size(), 2);
        for i in 0..33 {
            let name = format!("f{i:02}");
            assert!(
                root_inode.borrow().find_child(&name).is_some(),
                "missing {name}"
            );
        }
        fs.unmount().unwrap();
    }

    #[test]
    fn drop_frees_bits_for_reuse() {
        let img = TestImage::new("drop");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let a = create(&mut fs, &root, "a", FileType::Dir);
        let b = create(&mut fs, &a, "b", FileType::Reg);
        let b_inode = b.inode().unwrap();
        fs.write_file(&b_inode, b"x", 0).unwrap();
        let b_ino = b.ino();
        let b_blk = b_inode.borrow().blocks()[0];

        fs.drop_inode(&b_inode).unwrap();
        let a_inode = a.inode().unwrap();
        a_inode.borrow_mut().drop_dentry(&b).unwrap();
        assert_eq!(a_inode.borrow().dir_cnt(), 0);

        // the freed slots are the lowest again
        let c = Dentry::new("c", FileType::Reg).unwrap();
        let c_inode = fs.alloc_inode(&c).unwrap();
        assert_eq!(c_inode.borrow().ino(), b_ino);
        assert_eq!(fs.alloc_data_blk().unwrap(), b_blk);
        fs.unmount().unwrap();
    }

    #[test]
    fn drop_directory_clears_whole_subtree() {
        let img = TestImage::new("subtree");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let d = create(&mut fs, &root, "d", FileType::Dir);
        let x = create(&mut fs, &d, "x", FileType::Reg);
        let y = create(&mut fs, &d, "y", FileType::Dir);
        let z = create(&mut fs, &y, "z", FileType::Reg);
        fs.write_file(&x.inode().unwrap(), b"xx", 0).unwrap();
        fs.write_file(&z.inode().unwrap(), b"zz", 0).unwrap();
        // root + 4 inodes; root + d + x + y + z data blocks
        assert_eq!(fs.usage().inodes_used, 5);
        assert_eq!(fs.usage().blocks_used, 5);

        let d_inode = d.inode().unwrap();
        fs.drop_inode(&d_inode).unwrap();
        fs.root()
            .inode()
            .unwrap()
            .borrow_mut()
            .drop_dentry(&d)
            .unwrap();
        assert_eq!(fs.usage().inodes_used, 1);
        assert_eq!(fs.usage().blocks_used, 1);
        assert!(d.inode().is_none());
        fs.unmount().unwrap();
    }

    #[test]
    fn drop_unloaded_subtree_after_remount() {
        let img = TestImage::new("lazydrop");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let d = create(&mut fs, &root, "d", FileType::Dir);
        let x = create(&mut fs, &d, "x", FileType::Reg);
        fs.write_file(&x.inode().unwrap(), b"data", 0).unwrap();
        fs.unmount().unwrap();
        drop(fs);

        let mut fs = NewFs::mount(img.path()).unwrap();
        let hit = fs.lookup("/d").unwrap();
        assert!(hit.found);
        // x is still an unloaded entry; dropping d must load it to release
        // its data block
        let d_inode = hit.dentry.inode().unwrap();
        fs.drop_inode(&d_inode).unwrap();
        assert_eq!(fs.usage().inodes_used, 1);
        assert_eq!(fs.usage().blocks_used, 1);
        fs.unmount().unwrap();
    }

    #[test]
    fn dropping_root_is_refused() {
        let img = TestImage::new("droproot");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root_inode = fs.root().inode().unwrap();
        assert!(matches!(fs.drop_inode(&root_inode), Err(Error::Inval)));
        fs.unmount().unwrap();
    }

    #[test]
    fn lookup_returns_nearest_ancestor() {
        let img = TestImage::new("lookup");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let a = create(&mut fs, &root, "a", FileType::Dir);
        let _b = create(&mut fs, &a, "b", FileType::Reg);

        let hit = fs.lookup("/").unwrap();
        assert!(hit.found);
        assert!(hit.is_root);

        let miss = fs.lookup("/a/zz").unwrap();
        assert!(!miss.found);
        assert!(!miss.is_root);
        assert_eq!(miss.dentry.name(), "a");

        // walking through a regular file stops at the file
        let through = fs.lookup("/a/b/c").unwrap();
        assert!(!through.found);
        assert_eq!(through.dentry.name(), "b");

        // a name prefix does not match
        let prefix = fs.lookup("/a/").unwrap();
        assert!(prefix.found);
        let short = fs.lookup("/ab").unwrap();
        assert!(!short.found);
        fs.unmount().unwrap();
    }

    #[test]
    fn write_grows_and_bounds_file() {
        let img = TestImage::new("grow");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let f = create(&mut fs, &root, "f", FileType::Reg);
        let inode = f.inode().unwrap();

        let payload = vec![7u8; 3000];
        fs.write_file(&inode, &payload, 100).unwrap();
        // 3100 bytes need 4 blocks of 1024
        assert_eq!(inode.borrow().size(), 4);
        let mut buf = vec![0u8; 3000];
        assert_eq!(fs.read_file(&inode, &mut buf, 100).unwrap(), 3000);
        assert_eq!(buf, payload);
        // the zero fill around the payload is preserved
        let mut head = [0xffu8; 100];
        fs.read_file(&inode, &mut head, 0).unwrap();
        assert!(head.iter().all(|b| *b == 0));

        // growing past the direct pointers is refused
        let off = MAX_FILE_BLOCKS * fs.block_size();
        assert!(matches!(
            fs.write_file(&inode, b"y", off),
            Err(Error::NoSpace)
        ));
        // reading past the end returns nothing
        assert_eq!(fs.read_file(&inode, &mut buf, off).unwrap(), 0);
        fs.unmount().unwrap();
    }

    #[test]
    fn bitmap_matches_reachable_blocks() {
        let img = TestImage::new("owners");
        let mut fs = NewFs::mount(img.path()).unwrap();
        let root = fs.root();
        let a = create(&mut fs, &root, "a", FileType::Dir);
        for i in 0..3 {
            let f = create(&mut fs, &a, &format!("f{i}"), FileType::Reg);
            let data = vec![i as u8; 1500];
            fs.write_file(&f.inode().unwrap(), &data, 0).unwrap();
        }

        fn collect_blocks(dentry: &DentryRef, out: &mut Vec<u32>) {
            let Some(inode) = dentry.inode() else {
                return;
            };
            let node = inode.borrow();
            out.extend_from_slice(node.blocks());
            for child in (0..).map_while(|i| node.get_dentry(i)) {
                collect_blocks(&child, out);
            }
        }
        let mut owned = Vec::new();
        collect_blocks(&fs.root(), &mut owned);
        // every owned block is allocated exactly once, and nothing else is
        let usage = fs.usage();
        assert_eq!(owned.len(), usage.blocks_used);
        let mut dedup = owned.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), owned.len());
        fs.unmount().unwrap();
    }

    #[test]
    fn format_stamps_volume_identity() {
        let img = TestImage::new("ident");
        let mut fs = NewFs::format(img.path(), Some("scratch")).unwrap();
        let uuid = fs.uuid();
        assert!(!uuid.is_nil());
        assert_eq!(fs.label(), "scratch");
        fs.unmount().unwrap();
        drop(fs);
        let mut fs = NewFs::mount(img.path()).unwrap();
        assert_eq!(fs.uuid(), uuid);
        assert_eq!(fs.label(), "scratch");
        fs.unmount().unwrap();
    }

    #[test]
    fn file_name_of_path() {
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/a"), "a");
        assert_eq!(file_name("name"), "name");
    }
}
