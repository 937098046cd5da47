//! This module contains the errors used all over this crate.

use std::io;

use thiserror::Error;

/// Convenience wrapper around *Result<T, VfsError>*.
pub type VfsResult<T> = Result<T, VfsError>;

/// Error returned by operations on the virtual tree and its drivers.
#[derive(Error, Debug)]
pub enum VfsError {
    /// A path was syntactically rejected by a driver.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// A lookup found no entry under the requested name.
    #[error("element '{path}' not found in '{parent}'")]
    ElementNotFound {
        /// The path that failed to resolve.
        path: String,

        /// The directory the lookup started from.
        parent: String,
    },

    /// An operation expected the other kind of element, such as removing a
    /// directory through the file interface.
    #[error("element '{path}' has the wrong kind: {message}")]
    ElementKindInvalid {
        /// The offending path.
        path: String,

        /// What the operation expected to find.
        message: String,
    },

    /// The handle refers to an element that no longer exists and cannot be
    /// re-established. Broken handles never recover; discard and re-resolve.
    #[error("element is broken")]
    ElementBroken,

    /// `mount` was called on a directory that already carries a driver.
    #[error("'{0}' is already a mount point")]
    AlreadyMounted(String),

    /// `unmount` was called on a directory that is not a mount point.
    #[error("'{0}' is not a mount point")]
    NoMountPoint(String),

    /// A create operation collided with an existing entry.
    #[error("element '{0}' already exists")]
    ElementAlreadyExists(String),

    /// A driver refused to remove a non-empty directory. This is recovered
    /// internally by recursive removal and normally never reaches callers.
    #[error("directory '{0}' is not empty")]
    DirectoryNotEmpty(String),

    /// A lower-level driver failure.
    #[error("i/o failed on '{path}'")]
    IoFailed {
        /// The path the driver was working on.
        path: String,

        /// The underlying operating system error.
        #[source]
        source: io::Error,
    },

    /// An operation on a default-constructed stream or mapping.
    #[error("accessor ({0}) is not assigned to any file")]
    UnassignedAccessor(&'static str),

    /// A descriptor was asked to open while already open.
    #[error("descriptor is already opened")]
    AlreadyOpened,
}

impl VfsError {
    /// Wraps an operating system error together with the path it occurred on.
    pub fn io(path: impl ToString, source: io::Error) -> Self {
        Self::IoFailed {
            path: path.to_string(),
            source,
        }
    }

    pub fn not_found(path: impl ToString, parent: impl ToString) -> Self {
        Self::ElementNotFound {
            path: path.to_string(),
            parent: parent.to_string(),
        }
    }

    pub fn kind_invalid(path: impl ToString, message: impl ToString) -> Self {
        Self::ElementKindInvalid {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}
