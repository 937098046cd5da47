//! The native-FS backend: maps the virtual tree one-to-one into a host
//! directory and shares open descriptors per path, so every accessor of a
//! file talks to one underlying descriptor of its kind.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use tap::Pipe;

use crate::driver::{Driver, FileEntry, MapLock, MappedFile, MountRegistry, OpenFile};
use crate::error::{VfsError, VfsResult};
use crate::path::VfsPath;
use crate::sys;

/// A driver backed by a directory of the host filesystem. Virtual paths map
/// one-to-one under it; host path normalisation and encoding stay the
/// host's business.
pub struct NativeFsDriver {
    name: String,
    registry: MountRegistry,
    native_root: PathBuf,

    /// Live descriptors per native path, held weakly. At most one shared
    /// descriptor of each kind (open vs mapped) is alive per path.
    descriptors: Mutex<HashMap<PathBuf, Vec<CachedDescriptor>>>,

    this: Weak<NativeFsDriver>,
}

enum CachedDescriptor {
    Open(Weak<NativeOpenFile>),
    Mapped(Weak<NativeMappedFile>),
}

impl NativeFsDriver {
    /// Builds a driver over `directory`, resolved against the current
    /// working directory when relative.
    pub fn new(directory: impl AsRef<Path>) -> VfsResult<Arc<Self>> {
        let directory = directory.as_ref();
        let name = format!("native{{{}}}", directory.display());
        Self::with_name(directory, name)
    }

    pub fn with_name(directory: impl AsRef<Path>, name: impl Into<String>) -> VfsResult<Arc<Self>> {
        let directory = directory.as_ref();
        let native_root = if directory.is_absolute() {
            directory.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|error| VfsError::io(directory.display(), error))?
                .join(directory)
        };

        Ok(Arc::new_cyclic(|this| Self {
            name: name.into(),
            registry: MountRegistry::new(),
            native_root,
            descriptors: Mutex::new(HashMap::new()),
            this: this.clone(),
        }))
    }

    /// Translates a driver-relative absolute path into its host equivalent.
    /// Dot and dot-dot components are rejected; the tree never produces
    /// them and the host directory must not be escaped.
    fn native_path(&self, path: &VfsPath) -> VfsResult<PathBuf> {
        if !path.is_absolute() {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        let mut native = self.native_root.clone();
        for component in path.iter().skip(1) {
            if component == "." || component == ".." {
                return Err(VfsError::InvalidPath(path.to_string()));
            }
            native.push(component);
        }
        Ok(native)
    }

    /// Truncates a native file while keeping every live descriptor usable:
    /// close them all under the cache lock, truncate, reopen each in place.
    fn resize_native(&self, native: &Path, size: u64) -> VfsResult<()> {
        let mut cache = self.descriptors.lock();
        cleanup(&mut cache);
        debug!("Resizing '{}' to {size}", native.display());

        let live: Vec<LiveDescriptor> = cache
            .get(native)
            .map(|entries| entries.iter().filter_map(LiveDescriptor::upgrade).collect())
            .unwrap_or_default();

        for descriptor in &live {
            descriptor.close_descriptor()?;
        }

        nix::unistd::truncate(native, size as libc::off_t)
            .map_err(|errno| VfsError::io(native.display(), errno_io(errno)))?;

        for descriptor in &live {
            descriptor.open_descriptor()?;
        }
        Ok(())
    }
}

/// A strong reference to a cached descriptor of either kind.
enum LiveDescriptor {
    Open(Arc<NativeOpenFile>),
    Mapped(Arc<NativeMappedFile>),
}

impl LiveDescriptor {
    fn upgrade(cached: &CachedDescriptor) -> Option<Self> {
        match cached {
            CachedDescriptor::Open(weak) => weak.upgrade().map(Self::Open),
            CachedDescriptor::Mapped(weak) => weak.upgrade().map(Self::Mapped),
        }
    }

    fn close_descriptor(&self) -> VfsResult<()> {
        match self {
            Self::Open(open) => open.close_descriptor(),
            Self::Mapped(mapped) => mapped.close_descriptor(),
        }
    }

    fn open_descriptor(&self) -> VfsResult<()> {
        match self {
            Self::Open(open) => open.open_descriptor(),
            Self::Mapped(mapped) => mapped.open_descriptor(),
        }
    }
}

fn cleanup(cache: &mut HashMap<PathBuf, Vec<CachedDescriptor>>) {
    cache.retain(|_, entries| {
        entries.retain(|entry| match entry {
            CachedDescriptor::Open(weak) => weak.strong_count() > 0,
            CachedDescriptor::Mapped(weak) => weak.strong_count() > 0,
        });
        !entries.is_empty()
    });
}

fn errno_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Maps host errno values onto the driver error taxonomy.
fn host_error(path: &VfsPath, error: io::Error) -> VfsError {
    match error.raw_os_error() {
        Some(libc::ENOENT) => VfsError::not_found(path, ""),
        Some(libc::EEXIST) => VfsError::ElementAlreadyExists(path.to_string()),
        Some(libc::ENOTEMPTY) => VfsError::DirectoryNotEmpty(path.to_string()),
        Some(libc::EISDIR) => VfsError::kind_invalid(path, "expected a file"),
        Some(libc::ENOTDIR) => VfsError::kind_invalid(path, "expected a directory"),
        _ => VfsError::io(path, error),
    }
}

impl Driver for NativeFsDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    fn stat(&self, path: &VfsPath) -> VfsResult<FileEntry> {
        let native = self.native_path(path)?;
        fs::metadata(&native)
            .map_err(|error| host_error(path, error))?
            .pipe(|data| Ok(FileEntry::new(path.last().unwrap_or("/"), data.is_dir())))
    }

    fn list(&self, path: &VfsPath) -> VfsResult<Vec<FileEntry>> {
        let native = self.native_path(path)?;
        debug!("Listing '{}'", native.display());

        let mut entries = Vec::new();
        for entry in fs::read_dir(&native).map_err(|error| host_error(path, error))? {
            let entry = entry.map_err(|error| host_error(path, error))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }

            let kind = entry.file_type().map_err(|error| host_error(path, error))?;
            entries.push(FileEntry::new(name, kind.is_dir()));
        }
        Ok(entries)
    }

    fn size(&self, path: &VfsPath) -> VfsResult<u64> {
        let native = self.native_path(path)?;
        Ok(fs::metadata(&native)
            .map_err(|error| host_error(path, error))?
            .len())
    }

    fn resize(&self, path: &VfsPath, size: u64) -> VfsResult<()> {
        let native = self.native_path(path)?;
        self.resize_native(&native, size)
    }

    fn create_file(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        debug!("Creating file '{}'", native.display());

        let fd = open(
            &native,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY,
            Mode::from_bits_truncate(0o644),
        )
        .map_err(|errno| host_error(path, errno_io(errno)))?;

        // Immediately closed again; creation was the point.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        debug!("Creating directory '{}'", native.display());
        fs::create_dir(&native).map_err(|error| host_error(path, error))
    }

    fn remove_file(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        debug!("Removing file '{}'", native.display());
        fs::remove_file(&native).map_err(|error| host_error(path, error))
    }

    fn remove_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        debug!("Removing directory '{}'", native.display());

        fs::remove_dir(&native).map_err(|error| {
            // POSIX allows rmdir to report a populated directory as EEXIST.
            if error.raw_os_error() == Some(libc::EEXIST) {
                return VfsError::DirectoryNotEmpty(path.to_string());
            }
            host_error(path, error)
        })
    }

    fn open(&self, path: &VfsPath) -> VfsResult<Arc<dyn OpenFile>> {
        let native = self.native_path(path)?;

        let mut cache = self.descriptors.lock();
        cleanup(&mut cache);

        if let Some(entries) = cache.get(&native) {
            for entry in entries {
                if let CachedDescriptor::Open(weak) = entry {
                    if let Some(live) = weak.upgrade() {
                        debug!("Reusing open descriptor for '{}'", native.display());
                        return Ok(live);
                    }
                }
            }
        }

        let descriptor = Arc::new(NativeOpenFile::create(path, native.clone())?);
        cache
            .entry(native)
            .or_default()
            .push(CachedDescriptor::Open(Arc::downgrade(&descriptor)));
        Ok(descriptor)
    }

    fn map(&self, path: &VfsPath) -> VfsResult<Arc<dyn MappedFile>> {
        let native = self.native_path(path)?;

        let mut cache = self.descriptors.lock();
        cleanup(&mut cache);

        if let Some(entries) = cache.get(&native) {
            for entry in entries {
                if let CachedDescriptor::Mapped(weak) = entry {
                    if let Some(live) = weak.upgrade() {
                        debug!("Reusing mapped descriptor for '{}'", native.display());
                        return Ok(live);
                    }
                }
            }
        }

        let descriptor = Arc::new(NativeMappedFile::create(
            path,
            native.clone(),
            self.this.clone(),
        )?);
        cache
            .entry(native)
            .or_default()
            .push(CachedDescriptor::Mapped(Arc::downgrade(&descriptor)));
        Ok(descriptor)
    }
}

/// The shared open-file descriptor for one native path. Reads and writes
/// seek to their explicit position before the transfer; cursors belong to
/// the streams above.
struct NativeOpenFile {
    native: PathBuf,
    fd: Mutex<Option<OwnedFd>>,
}

impl NativeOpenFile {
    fn create(path: &VfsPath, native: PathBuf) -> VfsResult<Self> {
        let descriptor = Self {
            native,
            fd: Mutex::new(None),
        };
        descriptor
            .open_descriptor()
            .map_err(|error| relabel_not_found(error, path))?;
        Ok(descriptor)
    }

    fn open_descriptor(&self) -> VfsResult<()> {
        let mut fd = self.fd.lock();
        if fd.is_some() {
            return Err(VfsError::AlreadyOpened);
        }

        let raw = open(&self.native, OFlag::O_RDWR, Mode::empty())
            .map_err(|errno| VfsError::io(self.native.display(), errno_io(errno)))?;
        *fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
        Ok(())
    }

    fn close_descriptor(&self) -> VfsResult<()> {
        self.fd.lock().take();
        Ok(())
    }

    fn io_error(&self, error: io::Error) -> VfsError {
        VfsError::io(self.native.display(), error)
    }

    fn closed_error(&self) -> VfsError {
        self.io_error(io::Error::other("descriptor is closed"))
    }
}

impl OpenFile for NativeOpenFile {
    fn read(&self, pos: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        let fd = self.fd.lock();
        let fd = fd.as_ref().ok_or_else(|| self.closed_error())?;

        sys::lseek(fd.as_raw_fd(), pos).map_err(|error| self.io_error(error))?;
        sys::read(fd.as_raw_fd(), buffer).map_err(|error| self.io_error(error))
    }

    fn write(&self, pos: u64, buffer: &[u8]) -> VfsResult<usize> {
        let fd = self.fd.lock();
        let fd = fd.as_ref().ok_or_else(|| self.closed_error())?;

        sys::lseek(fd.as_raw_fd(), pos).map_err(|error| self.io_error(error))?;
        sys::write(fd.as_raw_fd(), buffer).map_err(|error| self.io_error(error))
    }

    fn size(&self) -> VfsResult<u64> {
        let fd = self.fd.lock();
        let fd = fd.as_ref().ok_or_else(|| self.closed_error())?;
        sys::file_size(fd.as_raw_fd()).map_err(|error| self.io_error(error))
    }
}

/// The shared memory-mapped descriptor for one native path. Empty files
/// carry no mapping at all; a resize re-establishes the view through the
/// driver's descriptor cache.
struct NativeMappedFile {
    native: PathBuf,
    driver: Weak<NativeFsDriver>,
    lock: MapLock,
    view: Mutex<MapView>,
}

struct MapView {
    fd: Option<OwnedFd>,
    ptr: *mut u8,
    len: usize,
}

// The raw view pointer is only touched under the view mutex, and the data
// behind it is serialised by the map lock.
unsafe impl Send for NativeMappedFile {}
unsafe impl Sync for NativeMappedFile {}

impl NativeMappedFile {
    fn create(path: &VfsPath, native: PathBuf, driver: Weak<NativeFsDriver>) -> VfsResult<Self> {
        let descriptor = Self {
            native,
            driver,
            lock: MapLock::new(),
            view: Mutex::new(MapView {
                fd: None,
                ptr: std::ptr::null_mut(),
                len: 0,
            }),
        };
        descriptor
            .open_descriptor()
            .map_err(|error| relabel_not_found(error, path))?;
        Ok(descriptor)
    }

    fn open_descriptor(&self) -> VfsResult<()> {
        let mut view = self.view.lock();
        if view.fd.is_some() {
            return Err(VfsError::AlreadyOpened);
        }

        let raw = open(&self.native, OFlag::O_RDWR, Mode::empty())
            .map_err(|errno| VfsError::io(self.native.display(), errno_io(errno)))?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let len = sys::file_size(fd.as_raw_fd())
            .map_err(|error| VfsError::io(self.native.display(), error))? as usize;
        let ptr = if len > 0 {
            sys::mmap(fd.as_raw_fd(), len)
                .map_err(|error| VfsError::io(self.native.display(), error))?
        } else {
            std::ptr::null_mut()
        };

        *view = MapView {
            fd: Some(fd),
            ptr,
            len,
        };
        Ok(())
    }

    fn close_descriptor(&self) -> VfsResult<()> {
        let mut view = self.view.lock();

        // The view must go before the descriptor backing it.
        if !view.ptr.is_null() {
            sys::munmap(view.ptr, view.len)
                .map_err(|error| VfsError::io(self.native.display(), error))?;
        }
        view.ptr = std::ptr::null_mut();
        view.len = 0;
        view.fd.take();
        Ok(())
    }
}

impl MappedFile for NativeMappedFile {
    fn map_lock(&self) -> &MapLock {
        &self.lock
    }

    fn ptr(&self) -> VfsResult<*mut u8> {
        Ok(self.view.lock().ptr)
    }

    fn size(&self) -> VfsResult<u64> {
        Ok(fs::metadata(&self.native)
            .map_err(|error| VfsError::io(self.native.display(), error))?
            .len())
    }

    fn resize(&self, size: u64) -> VfsResult<()> {
        let driver = self.driver.upgrade().ok_or_else(|| {
            VfsError::io(self.native.display(), io::Error::other("driver is gone"))
        })?;
        driver.resize_native(&self.native, size)
    }
}

impl Drop for NativeMappedFile {
    fn drop(&mut self) {
        if let Err(error) = self.close_descriptor() {
            error!("Failed to tear down mapping of '{}': {error}", self.native.display());
        }
    }
}

/// Opening a descriptor for a path the host no longer has should surface as
/// a missing element, not as a bare I/O failure.
fn relabel_not_found(error: VfsError, path: &VfsPath) -> VfsError {
    match &error {
        VfsError::IoFailed { source, .. } if source.raw_os_error() == Some(libc::ENOENT) => {
            VfsError::not_found(path, "")
        }
        _ => error,
    }
}
