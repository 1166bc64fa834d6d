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

//! The in-memory inode and directory entry tree.
//!
//! The tree is owned from the root down: a directory inode owns its child
//! entries, each entry owns its inode once loaded. Back pointers (entry to
//! parent entry, inode to naming entry) are weak so the graph stays a tree.

use crate::error::Error;
use crate::error::Result;
use crate::layout::FileType;
use crate::layout::MAX_FILE_BLOCKS;
use crate::layout::MAX_NAME_LEN;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

/// Shared handle on a directory entry.
pub type DentryRef = Rc<Dentry>;
/// Shared handle on an inode.
pub type InodeRef = Rc<RefCell<Inode>>;

/// A directory entry: a name binding an inode into its parent directory.
pub struct Dentry {
    /// Name of the file.
    name: String,
    /// Type of the named file.
    ftype: FileType,
    /// Number of the named inode. Valid even while the inode itself has not
    /// been loaded.
    ino: Cell<u32>,
    /// The named inode, or `None` until it is loaded or allocated.
    inode: RefCell<Option<InodeRef>>,
    /// The entry of the parent directory.
    parent: RefCell<Weak<Dentry>>,
}

impl Dentry {
    /// Creates a detached entry with no inode.
    ///
    /// The name must be non-empty, at most [`MAX_NAME_LEN`] bytes and free
    /// of `/`.
    pub fn new(name: &str, ftype: FileType) -> Result<DentryRef> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            return Err(Error::Inval);
        }
        Ok(Rc::new(Self {
            name: name.to_owned(),
            ftype,
            ino: Cell::new(0),
            inode: RefCell::new(None),
            parent: RefCell::new(Weak::new()),
        }))
    }

    /// Creates the root entry. The root names inode 0 and has no parent.
    pub(crate) fn root() -> DentryRef {
        Rc::new(Self {
            name: "/".to_owned(),
            ftype: FileType::Dir,
            ino: Cell::new(0),
            inode: RefCell::new(None),
            parent: RefCell::new(Weak::new()),
        })
    }

    /// Returns the name of the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the type of the named file.
    pub fn ftype(&self) -> FileType {
        self.ftype
    }

    /// Returns the number of the named inode.
    pub fn ino(&self) -> u32 {
        self.ino.get()
    }

    pub(crate) fn set_ino(&self, ino: u32) {
        self.ino.set(ino);
    }

    /// Returns the named inode, or `None` while it is not loaded.
    pub fn inode(&self) -> Option<InodeRef> {
        self.inode.borrow().clone()
    }

    pub(crate) fn attach_inode(&self, inode: InodeRef) {
        *self.inode.borrow_mut() = Some(inode);
    }

    pub(crate) fn detach_inode(&self) {
        *self.inode.borrow_mut() = None;
    }

    /// Returns the entry of the parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<DentryRef> {
        self.parent.borrow().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &DentryRef) {
        *self.parent.borrow_mut() = Rc::downgrade(parent);
    }
}

/// An in-memory inode: file metadata plus, depending on the file type, the
/// list of child entries or the file contents.
pub struct Inode {
    /// Inode number.
    pub(crate) ino: u32,
    /// Number of data blocks held by the file.
    pub(crate) size: u32,
    /// Data block pointers. The first `size` entries are meaningful.
    pub(crate) blocks: [u32; MAX_FILE_BLOCKS],
    /// The entry naming this inode.
    pub(crate) dentry: Weak<Dentry>,
    /// Child entries, most recently inserted first (directories only).
    pub(crate) children: Vec<DentryRef>,
    /// Number of child entries (directories only).
    pub(crate) dir_cnt: u32,
    /// File contents. Absent until loaded or first written (regular files
    /// only).
    pub(crate) data: Option<Vec<u8>>,
}

impl Inode {
    /// Creates a zeroed inode numbered `ino`, named by `dentry`.
    pub(crate) fn new(ino: u32, dentry: &DentryRef) -> Self {
        Self {
            ino,
            size: 0,
            blocks: [0; MAX_FILE_BLOCKS],
            dentry: Rc::downgrade(dentry),
            children: Vec::new(),
            dir_cnt: 0,
            data: None,
        }
    }

    /// Returns the inode number.
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Returns the number of data blocks held by the file.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the data block pointers in use.
    pub fn blocks(&self) -> &[u32] {
        &self.blocks[..self.size as usize]
    }

    /// Returns the number of child entries.
    pub fn dir_cnt(&self) -> u32 {
        self.dir_cnt
    }

    /// Returns the file contents, if loaded.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Returns the entry naming this inode.
    pub fn dentry(&self) -> Option<DentryRef> {
        self.dentry.upgrade()
    }

    /// Tells whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.dentry
            .upgrade()
            .is_some_and(|d| d.ftype() == FileType::Dir)
    }

    /// Tells whether the inode is a regular file.
    pub fn is_reg(&self) -> bool {
        self.dentry
            .upgrade()
            .is_some_and(|d| d.ftype() == FileType::Reg)
    }

    /// Head-inserts `dentry` into the child list.
    pub(crate) fn insert_child(&mut self, dentry: DentryRef) {
        self.children.insert(0, dentry);
        self.dir_cnt += 1;
    }

    /// Returns the child entry with the given name.
    pub fn find_child(&self, name: &str) -> Option<DentryRef> {
        self.children.iter().find(|d| d.name() == name).cloned()
    }

    /// Returns the child entry at position `index` in the list. Position 0
    /// is the most recently inserted entry.
    pub fn get_dentry(&self, index: usize) -> Option<DentryRef> {
        self.children.get(index).cloned()
    }

    /// Unlinks `dentry` from the child list and returns the new entry
    /// count. The entry's inode and block allocations are not touched.
    pub fn drop_dentry(&mut self, dentry: &DentryRef) -> Result<u32> {
        let pos = self
            .children
            .iter()
            .position(|d| Rc::ptr_eq(d, dentry))
            .ok_or(Error::NotFound)?;
        self.children.remove(pos);
        self.dir_cnt -= 1;
        Ok(self.dir_cnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_with_children(names: &[&str]) -> (DentryRef, InodeRef) {
        let dentry = Dentry::root();
        let inode = Rc::new(RefCell::new(Inode::new(0, &dentry)));
        dentry.attach_inode(inode.clone());
        for name in names {
            let child = Dentry::new(name, FileType::Reg).unwrap();
            child.set_parent(&dentry);
            inode.borrow_mut().insert_child(child);
        }
        (dentry, inode)
    }

    #[test]
    fn name_validation() {
        assert!(Dentry::new("a", FileType::Dir).is_ok());
        assert!(Dentry::new("", FileType::Dir).is_err());
        assert!(Dentry::new("a/b", FileType::Dir).is_err());
        assert!(Dentry::new(&"x".repeat(MAX_NAME_LEN + 1), FileType::Dir).is_err());
    }

    #[test]
    fn head_insertion_order() {
        let (_d, inode) = dir_with_children(&["a", "b", "c"]);
        let inode = inode.borrow();
        assert_eq!(inode.dir_cnt(), 3);
        // position 0 is the most recent insertion
        assert_eq!(inode.get_dentry(0).unwrap().name(), "c");
        assert_eq!(inode.get_dentry(2).unwrap().name(), "a");
        assert!(inode.get_dentry(3).is_none());
    }

    #[test]
    fn find_child_matches_whole_name() {
        let (_d, inode) = dir_with_children(&["abc"]);
        let inode = inode.borrow();
        assert!(inode.find_child("abc").is_some());
        // a prefix of a stored name is not a match
        assert!(inode.find_child("ab").is_none());
        assert!(inode.find_child("abcd").is_none());
    }

    #[test]
    fn drop_dentry_unlinks() {
        let (_d, inode) = dir_with_children(&["a", "b", "c"]);
        let mut ino = inode.borrow_mut();
        // middle of the list
        let b = ino.find_child("b").unwrap();
        assert_eq!(ino.drop_dentry(&b).unwrap(), 2);
        assert!(ino.find_child("b").is_none());
        // head of the list
        let c = ino.find_child("c").unwrap();
        assert_eq!(ino.drop_dentry(&c).unwrap(), 1);
        // an entry that is not in the list
        assert!(matches!(ino.drop_dentry(&b), Err(Error::NotFound)));
    }
}
