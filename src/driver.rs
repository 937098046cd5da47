//! The backend driver contract: what a mounted backend must supply, and the
//! invalidation channel it uses to tell the tree about external changes.

use std::sync::{Arc, Weak};

use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{Mutex, RawMutex, RawThreadId, ReentrantMutex};

use crate::error::{VfsError, VfsResult};
use crate::object::Node;
use crate::path::VfsPath;

/// A single directory entry as reported by a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// The entry's basename.
    pub name: String,

    /// Whether the entry is a directory.
    pub directory: bool,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, directory: bool) -> Self {
        Self {
            name: name.into(),
            directory,
        }
    }
}

/// Byte-level I/O accessor over an open file.
/// Accessors bind directly to the driver and outlive the handle that opened
/// them; positions are always passed explicitly, cursors live in *Stream*.
pub trait OpenFile: Send + Sync {
    /// Reads up to `buffer.len()` bytes starting at `pos`, returning the
    /// number of bytes actually transferred. A position at or beyond the end
    /// of the file reads zero bytes.
    fn read(&self, pos: u64, buffer: &mut [u8]) -> VfsResult<usize>;

    /// Writes at `pos`, overwriting in place and appending past the end.
    /// Returns the number of bytes actually transferred.
    fn write(&self, pos: u64, buffer: &[u8]) -> VfsResult<usize>;

    /// The file's current size.
    fn size(&self) -> VfsResult<u64>;
}

/// Memory-style accessor over a file, guarded by a recursive exclusive lock.
/// A *Mapping* holds the lock for its whole lifetime, so two live mappings
/// of the same backing file serialise against each other.
pub trait MappedFile: Send + Sync {
    /// The lock a *Mapping* acquires on construction.
    fn map_lock(&self) -> &MapLock;

    /// Raw pointer to the mapped region. Only stable until the next resize;
    /// null when the file is empty.
    fn ptr(&self) -> VfsResult<*mut u8>;

    fn size(&self) -> VfsResult<u64>;

    fn resize(&self, size: u64) -> VfsResult<()>;
}

/// The recursive exclusive lock guarding a mapped file's view.
pub struct MapLock {
    inner: Arc<ReentrantMutex<()>>,
}

/// An owned guard of a *MapLock*; held by a *Mapping* for its lifetime.
pub struct MapLockGuard {
    _guard: ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>,
}

impl MapLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Blocks until the lock is available to this thread. Re-entrant: a
    /// thread that already holds the lock may acquire it again.
    pub fn acquire(&self) -> MapLockGuard {
        MapLockGuard {
            _guard: self.inner.lock_arc(),
        }
    }
}

impl Default for MapLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A pluggable backend supplying the leaf filesystem semantics for a subtree.
///
/// All paths handed to a driver are driver-relative and absolute: they start
/// at the mount point, which the driver sees as `/`.
pub trait Driver: Send + Sync {
    /// A human-readable name for logging.
    fn name(&self) -> &str;

    /// The driver's mount point registry, used by the tree to subscribe
    /// mount points and by the driver to publish invalidation.
    fn registry(&self) -> &MountRegistry;

    /// Stats a single entry. Fails with *ElementNotFound* if absent.
    fn stat(&self, path: &VfsPath) -> VfsResult<FileEntry>;

    /// Lists the children of a directory, excluding `.` and `..`.
    /// The order of entries is not specified.
    fn list(&self, path: &VfsPath) -> VfsResult<Vec<FileEntry>>;

    fn size(&self, path: &VfsPath) -> VfsResult<u64>;

    fn resize(&self, path: &VfsPath, size: u64) -> VfsResult<()>;

    /// Fails with *ElementAlreadyExists* if the entry exists.
    fn create_file(&self, path: &VfsPath) -> VfsResult<()>;

    /// Fails with *ElementAlreadyExists* if the entry exists.
    fn create_directory(&self, path: &VfsPath) -> VfsResult<()>;

    /// Fails with *ElementKindInvalid* if the target is a directory.
    fn remove_file(&self, path: &VfsPath) -> VfsResult<()>;

    /// Fails with *DirectoryNotEmpty* if the directory has children; the
    /// tree catches that and removes the children recursively first.
    fn remove_directory(&self, path: &VfsPath) -> VfsResult<()>;

    fn open(&self, path: &VfsPath) -> VfsResult<Arc<dyn OpenFile>>;

    fn map(&self, path: &VfsPath) -> VfsResult<Arc<dyn MappedFile>>;
}

/// The invalidation channel between a driver and its mount points.
///
/// The registry records weak references only; a driver never keeps its mount
/// point directories alive. When a change originates inside the driver, it
/// publishes the affected driver-relative path here and every subscribed
/// mount point propagates the transition down its subtree.
pub struct MountRegistry {
    points: Mutex<Vec<Weak<Node>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, node: &Arc<Node>) {
        self.points.lock().push(Arc::downgrade(node));
    }

    pub(crate) fn unregister(&self, node: &Arc<Node>) -> VfsResult<()> {
        let mut points = self.points.lock();
        let before = points.len();
        points.retain(|point| !std::ptr::eq(point.as_ptr(), Arc::as_ptr(node)));

        if points.len() == before {
            return Err(VfsError::NoMountPoint(node.path()?.to_string()));
        }
        Ok(())
    }

    /// Marks the object at `path` (and its subtree) Invalid on every
    /// subscribed mount point. `path` is driver-relative and absolute;
    /// `/` addresses the mount point itself.
    pub fn mark_invalid(&self, path: &VfsPath) -> VfsResult<()> {
        debug!("Publishing invalidation for '{path}'");
        self.mark(path, &Node::mark_invalid_tree)
    }

    /// Marks the object at `path` (and its subtree) Broken on every
    /// subscribed mount point.
    pub fn mark_broken(&self, path: &VfsPath) -> VfsResult<()> {
        debug!("Publishing breakage for '{path}'");
        self.mark(path, &Node::mark_broken_tree)
    }

    fn mark(&self, path: &VfsPath, apply: &dyn Fn(&Node)) -> VfsResult<()> {
        if path.is_empty() || !path.is_absolute() {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        let points = self.points.lock().clone();
        for point in points {
            // Losing a mount point while still subscribed is a logic error
            // in the caller; fail loudly instead of dropping the event.
            let mount = point
                .upgrade()
                .expect("Mount point is no longer available!");

            if path.len() == 1 {
                apply(&mount);
            } else {
                let target = Node::navigate(&mount, &path.subpath(1))?;
                apply(&target);
            }
        }

        Ok(())
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}
