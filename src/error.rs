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

//! Errors returned by filesystem operations.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// An error occurring during a filesystem operation.
#[derive(Debug)]
pub enum Error {
    /// A device read or write failed.
    Io(io::Error),
    /// A bitmap is exhausted: no free inode or data block is left.
    NoSpace,
    /// The requested name or directory entry does not exist.
    NotFound,
    /// The operation is illegal, such as dropping the root inode.
    Inval,
}

/// Result type of filesystem operations.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Returns the matching negated POSIX errno, for callers that speak the
    /// usual callback convention.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(_) => -libc::EIO,
            Self::NoSpace => -libc::ENOSPC,
            Self::NotFound => -libc::ENOENT,
            Self::Inval => -libc::EINVAL,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(fmt, "device I/O error: {err}"),
            Self::NoSpace => write!(fmt, "no space left on device"),
            Self::NotFound => write!(fmt, "no such file or directory"),
            Self::Inval => write!(fmt, "invalid operation"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NoSpace.errno(), -libc::ENOSPC);
        assert_eq!(Error::NotFound.errno(), -libc::ENOENT);
        assert_eq!(Error::Inval.errno(), -libc::EINVAL);
        let io = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(io.errno(), -libc::EIO);
    }
}
