//! File handles and their accessors. A *Stream* is a seekable byte cursor
//! over a driver's open file; a *Mapping* is an exclusive in-memory view.
//! Both bind directly to the driver and survive the handle that made them.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::slice;
use std::sync::Arc;

use crate::directory::{effective_driver, Directory};
use crate::driver::{Driver, MapLockGuard, MappedFile, OpenFile};
use crate::error::{VfsError, VfsResult};
use crate::object::{Handle, Node, Validity};
use crate::path::VfsPath;

/// A handle to a file of the virtual tree. The handle carries no content
/// and no descriptor of its own; both live in the driver.
#[derive(Clone)]
pub struct File {
    node: Arc<Node>,
}

impl File {
    pub(crate) fn from_node(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// This file's basename. Validates first.
    pub fn name(&self) -> VfsResult<String> {
        self.node.checked_name()
    }

    pub fn path(&self) -> VfsResult<VfsPath> {
        self.node.path()
    }

    pub fn parent(&self) -> VfsResult<Option<Directory>> {
        self.node.checked_parent()
    }

    /// Current validity; never fails and never touches the driver.
    pub fn validity(&self) -> Validity {
        self.node.validity()
    }

    pub fn ptr_eq(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// This file as an untyped handle.
    pub fn handle(&self) -> Handle {
        Handle::File(self.clone())
    }

    /// The driver responsible for this file and the file's driver-relative
    /// path, resolved through the enclosing directory.
    fn driver_path(&self) -> VfsResult<(VfsPath, Arc<dyn Driver>)> {
        let parent = self.node.parent.upgrade().ok_or(VfsError::ElementBroken)?;
        let (dir_path, driver) = effective_driver(&parent)?;
        Ok((dir_path.with(&self.node.name), driver))
    }

    pub fn size(&self) -> VfsResult<u64> {
        self.node.validate()?;
        let (path, driver) = self.driver_path()?;
        driver.size(&path)
    }

    pub fn resize(&self, size: u64) -> VfsResult<()> {
        self.node.validate()?;
        let (path, driver) = self.driver_path()?;
        driver.resize(&path, size)
    }

    /// Opens a stream positioned at the start of the file.
    pub fn open(&self) -> VfsResult<Stream> {
        self.open_at(SeekFrom::Start(0))
    }

    /// Opens a stream positioned at `pos`. Two streams opened on the same
    /// file keep independent cursors over the same content.
    pub fn open_at(&self, pos: SeekFrom) -> VfsResult<Stream> {
        self.node.validate()?;
        let (path, driver) = self.driver_path()?;

        let mut stream = Stream {
            file: Some(driver.open(&path)?),
            pos: 0,
        };
        stream.seek_to(pos)?;
        Ok(stream)
    }

    /// Maps the file, blocking until this thread holds the file's mapping
    /// lock. The returned *Mapping* keeps exclusive access to the mapped
    /// view until it is dropped.
    pub fn map(&self) -> VfsResult<Mapping> {
        self.node.validate()?;
        let (path, driver) = self.driver_path()?;

        let mapped = driver.map(&path)?;
        let guard = mapped.map_lock().acquire();
        Ok(Mapping {
            file: Some(mapped),
            _guard: Some(guard),
        })
    }

    /// Removes the file through its driver, breaking this handle.
    pub fn remove(&self) -> VfsResult<()> {
        self.node.validate()?;
        let (path, driver) = self.driver_path()?;
        debug!("Removing file '{}'", path);
        driver.remove_file(&path)?;

        if let Some(parent) = self.node.parent.upgrade() {
            parent.mark_invalid_tree();
        }
        self.node.mark_broken_tree();
        Ok(())
    }
}

/// Confirms a file still exists by statting it through the parent's driver.
/// A missing entry breaks the handle for good.
pub(crate) fn validate_file(node: &Arc<Node>) -> VfsResult<()> {
    match node.validity() {
        Validity::Valid => return Ok(()),
        Validity::Broken => return Err(VfsError::ElementBroken),
        Validity::Invalid => {}
    }

    let parent = node.parent.upgrade().ok_or(VfsError::ElementBroken)?;
    let (dir_path, driver) = effective_driver(&parent)?;

    match driver.stat(&dir_path.with(&node.name)) {
        Ok(_) => {
            node.set_validity(Validity::Valid);
            Ok(())
        }
        Err(VfsError::ElementNotFound { .. }) => {
            node.mark_broken_tree();
            Err(VfsError::ElementBroken)
        }
        Err(other) => Err(other),
    }
}

/// A seekable byte stream over an open file. The stream owns its cursor;
/// every read and write goes to the driver at an explicit position and
/// advances the cursor by the count actually transferred.
///
/// A default-constructed stream is unopened and fails every operation with
/// *UnassignedAccessor*. Cloning an opened stream shares the underlying
/// open file and starts at the source's current position.
#[derive(Clone, Default)]
pub struct Stream {
    file: Option<Arc<dyn OpenFile>>,
    pos: u64,
}

impl Stream {
    /// An unopened stream.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The file's size at the time of the call.
    pub fn size(&self) -> VfsResult<u64> {
        self.file()?.size()
    }

    fn file(&self) -> VfsResult<&Arc<dyn OpenFile>> {
        self.file
            .as_ref()
            .ok_or(VfsError::UnassignedAccessor("Stream"))
    }

    fn seek_to(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.file()?.size()?) + i128::from(delta),
        };

        if target < 0 || target > i128::from(u64::MAX) {
            return Err(VfsError::io(
                "<stream>",
                io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"),
            ));
        }

        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl Read for Stream {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let file = self.file().map_err(io::Error::other)?.clone();
        let count = file.read(self.pos, buffer).map_err(io::Error::other)?;
        self.pos += count as u64;
        Ok(count)
    }
}

impl Write for Stream {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        let file = self.file().map_err(io::Error::other)?.clone();
        let count = file.write(self.pos, buffer).map_err(io::Error::other)?;
        self.pos += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes go straight to the driver; there is nothing buffered here.
        Ok(())
    }
}

impl Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_to(pos).map_err(io::Error::other)
    }
}

/// An exclusive read-write view into a file. Construction acquires the
/// mapped file's recursive lock and holds it until the mapping is dropped,
/// so a second mapping of the same backing file blocks meanwhile.
///
/// Movable but not clonable. Raw pointers obtained from the view are only
/// stable until the next `resize`; refresh them through `get` afterwards.
#[derive(Default)]
pub struct Mapping {
    file: Option<Arc<dyn MappedFile>>,
    _guard: Option<MapLockGuard>,
}

impl Mapping {
    /// An unassigned mapping.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_assigned(&self) -> bool {
        self.file.is_some()
    }

    fn file(&self) -> VfsResult<&Arc<dyn MappedFile>> {
        self.file
            .as_ref()
            .ok_or(VfsError::UnassignedAccessor("Mapping"))
    }

    pub fn size(&self) -> VfsResult<u64> {
        self.file()?.size()
    }

    /// Changes the file's size. The view may move; refresh saved pointers.
    pub fn resize(&mut self, size: u64) -> VfsResult<()> {
        self.file()?.resize(size)
    }

    /// Raw pointer to the mapped region; null when the file is empty.
    pub fn get(&self) -> VfsResult<*mut u8> {
        self.file()?.ptr()
    }

    pub fn as_slice(&self) -> VfsResult<&[u8]> {
        let len = self.size()? as usize;
        if len == 0 {
            return Ok(&[]);
        }

        let ptr = self.get()?;
        // The mapping lock is held for our whole lifetime, so the region
        // stays in place between this size/pointer pair and the last use.
        Ok(unsafe { slice::from_raw_parts(ptr, len) })
    }

    pub fn as_mut_slice(&mut self) -> VfsResult<&mut [u8]> {
        let len = self.size()? as usize;
        if len == 0 {
            return Ok(&mut []);
        }

        let ptr = self.get()?;
        Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
    }

    /// Views the mapped region as a sequence of plain-old-data elements.
    /// The region must be aligned for `T`; trailing bytes that do not fill
    /// a whole element are cut off.
    pub fn view<T: Copy>(&self) -> VfsResult<&[T]> {
        if mem::size_of::<T>() == 0 {
            return Ok(&[]);
        }

        let len = self.size()? as usize / mem::size_of::<T>();
        if len == 0 {
            return Ok(&[]);
        }

        let ptr = self.get()?;
        assert!(
            ptr as usize % mem::align_of::<T>() == 0,
            "mapped region is not aligned for the requested element type"
        );
        Ok(unsafe { slice::from_raw_parts(ptr.cast(), len) })
    }

    /// Mutable variant of `view`.
    pub fn view_mut<T: Copy>(&mut self) -> VfsResult<&mut [T]> {
        if mem::size_of::<T>() == 0 {
            return Ok(&mut []);
        }

        let len = self.size()? as usize / mem::size_of::<T>();
        if len == 0 {
            return Ok(&mut []);
        }

        let ptr = self.get()?;
        assert!(
            ptr as usize % mem::align_of::<T>() == 0,
            "mapped region is not aligned for the requested element type"
        );
        Ok(unsafe { slice::from_raw_parts_mut(ptr.cast(), len) })
    }
}
