//! The in-memory backend: a tree of nodes holding byte vectors, useful on
//! its own for scratch space and as the reference driver in tests.

use std::io;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::driver::{Driver, FileEntry, MapLock, MappedFile, MountRegistry, OpenFile};
use crate::error::{VfsError, VfsResult};
use crate::path::VfsPath;

/// A driver keeping its whole tree in memory. Entry names are stored
/// verbatim and matched exactly; the tree above folds case on its own.
pub struct MemoryDriver {
    name: String,
    registry: MountRegistry,
    root: Arc<MemNode>,
}

struct MemNode {
    directory: bool,
    children: Mutex<IndexMap<String, Arc<MemNode>>>,
    data: Mutex<Vec<u8>>,

    /// The node's shared mapped-file accessor, created on the first `map`
    /// and pinned here so every mapping of this node shares one lock.
    mapping: Mutex<Option<Arc<MemoryMapping>>>,
}

impl MemNode {
    fn new(directory: bool) -> Arc<Self> {
        Arc::new(Self {
            directory,
            children: Mutex::new(IndexMap::new()),
            data: Mutex::new(Vec::new()),
            mapping: Mutex::new(None),
        })
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: MountRegistry::new(),
            root: MemNode::new(true),
        }
    }

    /// Resolves a driver-relative absolute path to its node.
    fn node(&self, path: &VfsPath) -> VfsResult<Arc<MemNode>> {
        if !path.is_absolute() {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        let mut current = self.root.clone();
        for component in path.iter().skip(1) {
            let child = current.children.lock().get(component).cloned();
            current = child.ok_or_else(|| VfsError::not_found(path, "/"))?;
        }
        Ok(current)
    }

    /// Resolves a path to its parent node plus the final basename.
    fn split(&self, path: &VfsPath) -> VfsResult<(Arc<MemNode>, String)> {
        if !path.is_absolute() || path.len() < 2 {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        let name = path.last().unwrap_or_default().to_owned();
        let mut current = self.root.clone();
        for component in path.iter().skip(1).take(path.len() - 2) {
            let child = current.children.lock().get(component).cloned();
            current = child.ok_or_else(|| VfsError::not_found(path, "/"))?;
        }

        if !current.directory {
            return Err(VfsError::kind_invalid(path, "expected a directory"));
        }
        Ok((current, name))
    }

    fn file_node(&self, path: &VfsPath) -> VfsResult<Arc<MemNode>> {
        let node = self.node(path)?;
        if node.directory {
            return Err(VfsError::kind_invalid(path, "expected a file"));
        }
        Ok(node)
    }

    fn create_node(&self, path: &VfsPath, directory: bool) -> VfsResult<()> {
        trace!("Creating node '{path}' (directory = {directory})");
        let (parent, name) = self.split(path)?;

        let mut children = parent.children.lock();
        if children.contains_key(&name) {
            return Err(VfsError::ElementAlreadyExists(path.to_string()));
        }

        children.insert(name, MemNode::new(directory));
        Ok(())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    fn stat(&self, path: &VfsPath) -> VfsResult<FileEntry> {
        let node = self.node(path)?;
        Ok(FileEntry::new(path.last().unwrap_or("/"), node.directory))
    }

    fn list(&self, path: &VfsPath) -> VfsResult<Vec<FileEntry>> {
        let node = self.node(path)?;
        let children = node.children.lock();
        Ok(children
            .iter()
            .map(|(name, child)| FileEntry::new(name.clone(), child.directory))
            .collect())
    }

    fn size(&self, path: &VfsPath) -> VfsResult<u64> {
        Ok(self.file_node(path)?.data.lock().len() as u64)
    }

    fn resize(&self, path: &VfsPath, size: u64) -> VfsResult<()> {
        self.file_node(path)?.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn create_file(&self, path: &VfsPath) -> VfsResult<()> {
        self.create_node(path, false)
    }

    fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        self.create_node(path, true)
    }

    fn remove_file(&self, path: &VfsPath) -> VfsResult<()> {
        let (parent, name) = self.split(path)?;

        let mut children = parent.children.lock();
        let node = children
            .get(&name)
            .ok_or_else(|| VfsError::not_found(path, "/"))?;
        if node.directory {
            return Err(VfsError::kind_invalid(path, "expected a file"));
        }

        children.shift_remove(&name);
        Ok(())
    }

    fn remove_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let (parent, name) = self.split(path)?;

        let mut children = parent.children.lock();
        let node = children
            .get(&name)
            .ok_or_else(|| VfsError::not_found(path, "/"))?;
        if !node.directory {
            return Err(VfsError::kind_invalid(path, "expected a directory"));
        }
        if !node.children.lock().is_empty() {
            return Err(VfsError::DirectoryNotEmpty(path.to_string()));
        }

        children.shift_remove(&name);
        Ok(())
    }

    fn open(&self, path: &VfsPath) -> VfsResult<Arc<dyn OpenFile>> {
        trace!("Opening '{path}'");
        let node = self.file_node(path)?;
        Ok(Arc::new(MemoryOpenFile { node }))
    }

    fn map(&self, path: &VfsPath) -> VfsResult<Arc<dyn MappedFile>> {
        trace!("Mapping '{path}'");
        let node = self.file_node(path)?;

        let mut mapping = node.mapping.lock();
        let shared = mapping.get_or_insert_with(|| {
            Arc::new(MemoryMapping {
                node: Arc::downgrade(&node),
                lock: MapLock::new(),
            })
        });
        Ok(shared.clone())
    }
}

/// A lightweight accessor bound to one node's byte vector.
struct MemoryOpenFile {
    node: Arc<MemNode>,
}

impl OpenFile for MemoryOpenFile {
    fn read(&self, pos: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        let data = self.node.data.lock();
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }

        let count = (data.len() - pos).min(buffer.len());
        buffer[..count].copy_from_slice(&data[pos..pos + count]);
        Ok(count)
    }

    fn write(&self, pos: u64, buffer: &[u8]) -> VfsResult<usize> {
        let mut data = self.node.data.lock();
        let pos = pos as usize;
        if pos > data.len() {
            // Seeking past the end writes a hole, like the native backend.
            data.resize(pos, 0);
        }

        let overwrite = (data.len() - pos).min(buffer.len());
        data[pos..pos + overwrite].copy_from_slice(&buffer[..overwrite]);
        data.extend_from_slice(&buffer[overwrite..]);
        Ok(buffer.len())
    }

    fn size(&self) -> VfsResult<u64> {
        Ok(self.node.data.lock().len() as u64)
    }
}

/// The shared mapped-file accessor pinned at a node. Holds the node weakly;
/// the node owns the pin, and a strong reference back would leak both.
struct MemoryMapping {
    node: Weak<MemNode>,
    lock: MapLock,
}

impl MemoryMapping {
    fn node(&self) -> VfsResult<Arc<MemNode>> {
        self.node
            .upgrade()
            .ok_or_else(|| VfsError::io("<memory>", io::Error::other("the mapped node is gone")))
    }
}

impl MappedFile for MemoryMapping {
    fn map_lock(&self) -> &MapLock {
        &self.lock
    }

    fn ptr(&self) -> VfsResult<*mut u8> {
        Ok(self.node()?.data.lock().as_mut_ptr())
    }

    fn size(&self) -> VfsResult<u64> {
        Ok(self.node()?.data.lock().len() as u64)
    }

    fn resize(&self, size: u64) -> VfsResult<()> {
        self.node()?.data.lock().resize(size as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> VfsPath {
        VfsPath::parse(text)
    }

    #[test]
    fn create_list_remove() {
        let driver = MemoryDriver::new();
        driver.create_directory(&path("/a")).unwrap();
        driver.create_file(&path("/a/one")).unwrap();
        driver.create_file(&path("/a/two")).unwrap();

        assert!(matches!(
            driver.create_file(&path("/a/one")),
            Err(VfsError::ElementAlreadyExists(_))
        ));

        let mut names: Vec<String> = driver
            .list(&path("/a"))
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        assert_eq!(names, ["one", "two"]);

        assert!(matches!(
            driver.remove_directory(&path("/a")),
            Err(VfsError::DirectoryNotEmpty(_))
        ));
        driver.remove_file(&path("/a/one")).unwrap();
        driver.remove_file(&path("/a/two")).unwrap();
        driver.remove_directory(&path("/a")).unwrap();
        assert!(matches!(
            driver.stat(&path("/a")),
            Err(VfsError::ElementNotFound { .. })
        ));
    }

    #[test]
    fn kind_checks() {
        let driver = MemoryDriver::new();
        driver.create_directory(&path("/dir")).unwrap();
        driver.create_file(&path("/file")).unwrap();

        assert!(matches!(
            driver.remove_file(&path("/dir")),
            Err(VfsError::ElementKindInvalid { .. })
        ));
        assert!(matches!(
            driver.remove_directory(&path("/file")),
            Err(VfsError::ElementKindInvalid { .. })
        ));
        assert!(matches!(
            driver.open(&path("/dir")),
            Err(VfsError::ElementKindInvalid { .. })
        ));
    }

    #[test]
    fn read_write_boundaries() {
        let driver = MemoryDriver::new();
        driver.create_file(&path("/f")).unwrap();
        let file = driver.open(&path("/f")).unwrap();

        assert_eq!(file.write(0, b"hello").unwrap(), 5);
        assert_eq!(file.size().unwrap(), 5);

        let mut buffer = [0u8; 16];
        assert_eq!(file.read(0, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"hello");

        // Reads at or past the end transfer nothing.
        assert_eq!(file.read(5, &mut buffer).unwrap(), 0);
        assert_eq!(file.read(100, &mut buffer).unwrap(), 0);

        // Overwrite in place, then extend past the end.
        assert_eq!(file.write(3, b"p!!").unwrap(), 3);
        assert_eq!(file.size().unwrap(), 6);

        // A write past the end zero-fills the gap.
        assert_eq!(file.write(8, b"x").unwrap(), 1);
        let mut all = [0u8; 16];
        assert_eq!(file.read(0, &mut all).unwrap(), 9);
        assert_eq!(&all[..9], b"help!!\0\0x");
    }

    #[test]
    fn mappings_share_one_accessor() {
        let driver = MemoryDriver::new();
        driver.create_file(&path("/f")).unwrap();

        let first = driver.map(&path("/f")).unwrap();
        let second = driver.map(&path("/f")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.resize(4).unwrap();
        assert_eq!(second.size().unwrap(), 4);
    }
}
