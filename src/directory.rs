//! Directory handles: mounting, validation against the driver's listing,
//! content snapshots, and the wildcard resolver.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::driver::{Driver, FileEntry};
use crate::error::{VfsError, VfsResult};
use crate::file::File;
use crate::object::{basename_key, DirState, Handle, Node, Validity};
use crate::path::{wildcard_match, VfsPath};

/// A handle to a directory of the virtual tree.
#[derive(Clone)]
pub struct Directory {
    node: Arc<Node>,
}

/// The root of a virtual tree: a directory named `/` with no parent. The
/// root (or a driver) must be mounted before the tree is usable.
pub struct Root {
    dir: Directory,
}

impl Root {
    pub fn new() -> Self {
        Self {
            dir: Directory::from_node(Node::new_root()),
        }
    }
}

impl Default for Root {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Root {
    type Target = Directory;

    fn deref(&self) -> &Directory {
        &self.dir
    }
}

impl Directory {
    pub(crate) fn from_node(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn state(&self) -> &DirState {
        self.node
            .dir_state()
            .expect("Directory handle over a non-directory node!")
    }

    /// This directory's basename (`/` for the root). Validates first.
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

    pub fn ptr_eq(&self, other: &Directory) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// This directory as an untyped handle.
    pub fn handle(&self) -> Handle {
        Handle::Directory(self.clone())
    }

    /// Attaches a driver, making this directory a mount point. The existing
    /// child index is not cleared; the next validation reconciles it against
    /// the driver's listing.
    pub fn mount(&self, driver: Arc<dyn Driver>) -> VfsResult<()> {
        let mut inner = self.state().inner.lock();
        if inner.driver.is_some() {
            return Err(VfsError::AlreadyMounted(self.node.path()?.to_string()));
        }

        info!("Mounting driver '{}' on '{}'", driver.name(), self.node.path()?);
        driver.registry().register(&self.node);
        inner.driver = Some(driver);
        drop(inner);

        self.node.mark_invalid_tree();
        Ok(())
    }

    /// Detaches the mounted driver. Every child handle becomes Broken and
    /// the child index is dropped; the directory itself stays usable.
    pub fn unmount(&self) -> VfsResult<()> {
        let mut inner = self.state().inner.lock();
        let driver = match inner.driver.take() {
            Some(driver) => driver,
            None => return Err(VfsError::NoMountPoint(self.node.path()?.to_string())),
        };

        info!("Unmounting driver '{}' from '{}'", driver.name(), self.node.path()?);
        driver.registry().unregister(&self.node)?;

        for child in inner.content.values() {
            child.mark_broken_tree();
        }
        inner.content.clear();
        self.node.set_validity(Validity::Invalid);
        Ok(())
    }

    /// A snapshot of this directory's children, validated first.
    /// The order of the returned handles is unspecified.
    pub fn content(&self) -> VfsResult<Vec<Handle>> {
        self.node.validate()?;

        let inner = self.state().inner.lock();
        Ok(inner
            .content
            .values()
            .cloned()
            .map(Handle::from_node)
            .collect())
    }

    /// Every object reachable below this directory, in pre-order per
    /// directory. Validates each directory it descends into.
    pub fn collect(&self) -> VfsResult<Vec<Handle>> {
        let mut all = Vec::new();
        for handle in self.content()? {
            all.push(handle.clone());
            if let Handle::Directory(dir) = &handle {
                all.extend(dir.collect()?);
            }
        }
        Ok(all)
    }

    /// Resolves a relative navigation path to a single object. A component
    /// containing `*` switches to wildcard expansion and yields the first
    /// match; an exact path walks the child index case-insensitively.
    pub fn get(&self, path: impl Into<VfsPath>) -> VfsResult<Handle> {
        let path = path.into();

        if path.iter().any(|component| component.contains('*')) {
            let mut matches = self.expand(&path)?;
            if matches.is_empty() {
                return Err(VfsError::not_found(&path, self.node.path()?));
            }
            return Ok(matches.swap_remove(0));
        }

        Node::navigate(&self.node, &path).map(Handle::from_node)
    }

    /// Like `get`, but requires the result to be a directory.
    pub fn get_directory(&self, path: impl Into<VfsPath>) -> VfsResult<Directory> {
        let path = path.into();
        match self.get(&path)? {
            Handle::Directory(dir) => Ok(dir),
            Handle::File(_) => Err(VfsError::kind_invalid(&path, "expected a directory")),
        }
    }

    /// Like `get`, but requires the result to be a file.
    pub fn get_file(&self, path: impl Into<VfsPath>) -> VfsResult<File> {
        let path = path.into();
        match self.get(&path)? {
            Handle::File(file) => Ok(file),
            Handle::Directory(_) => Err(VfsError::kind_invalid(&path, "expected a file")),
        }
    }

    /// Expands a navigation pattern to every matching object, deduplicated.
    /// `?` matches one basename character, `*` a run of them, and a `**`
    /// component descends to every directory below the current one.
    pub fn get_all(&self, path: impl Into<VfsPath>) -> VfsResult<Vec<Handle>> {
        self.expand(&path.into())
    }

    fn expand(&self, path: &VfsPath) -> VfsResult<Vec<Handle>> {
        debug!("Expanding '{}' under '{}'", path, self.node.path()?);

        // Matches are keyed by their absolute path so a pattern that reaches
        // the same object along several routes reports it once.
        let mut matches: IndexMap<String, Handle> = IndexMap::new();
        let mut pending: VecDeque<(VfsPath, Directory)> = VecDeque::new();
        pending.push_back((path.clone(), self.clone()));

        while let Some((pattern, dir)) = pending.pop_front() {
            if pattern.is_empty() {
                let handle = dir.handle();
                matches.entry(handle.path()?.to_string()).or_insert(handle);
                continue;
            }

            let head = &pattern[0];
            let tail = pattern.subpath(1);

            if head == "**" {
                for descendant in dir.collect()? {
                    if let Handle::Directory(sub) = &descendant {
                        pending.push_back((tail.clone(), sub.clone()));
                    } else if tail.is_empty() {
                        matches
                            .entry(descendant.path()?.to_string())
                            .or_insert(descendant);
                    }
                }
                continue;
            }

            for child in dir.content()? {
                if !wildcard_match(head, &child.node().name) {
                    continue;
                }
                if tail.is_empty() {
                    matches
                        .entry(child.path()?.to_string())
                        .or_insert_with(|| child.clone());
                }
                if let Handle::Directory(sub) = &child {
                    pending.push_back((tail.clone(), sub.clone()));
                }
            }
        }

        Ok(matches.into_values().collect())
    }

    /// Creates a file through the driver and returns a handle to it.
    pub fn create_file(&self, name: &str) -> VfsResult<File> {
        self.node.validate()?;
        check_basename(name)?;

        let (dir_path, driver) = effective_driver(&self.node)?;
        debug!("Creating file '{}' under '{}'", name, dir_path);
        driver.create_file(&dir_path.with(name))?;

        self.node.mark_invalid_tree();
        self.get_file(name)
    }

    /// Creates a directory through the driver and returns a handle to it.
    pub fn create_directory(&self, name: &str) -> VfsResult<Directory> {
        self.node.validate()?;
        check_basename(name)?;

        let (dir_path, driver) = effective_driver(&self.node)?;
        debug!("Creating directory '{}' under '{}'", name, dir_path);
        driver.create_directory(&dir_path.with(name))?;

        self.node.mark_invalid_tree();
        self.get_directory(name)
    }

    /// Removes this directory through the driver. A driver that refuses a
    /// non-empty directory triggers recursive removal of the children first.
    /// The handle ends up Broken and the parent is left to re-validate.
    pub fn remove(&self) -> VfsResult<()> {
        self.node.validate()?;

        let (dir_path, driver) = effective_driver(&self.node)?;
        debug!("Removing directory '{}'", dir_path);

        if let Err(error) = driver.remove_directory(&dir_path) {
            match error {
                VfsError::DirectoryNotEmpty(_) => {
                    for child in self.content()? {
                        child.remove()?;
                    }
                    driver.remove_directory(&dir_path)?;
                }
                other => return Err(other),
            }
        }

        if let Some(parent) = self.node.parent.upgrade() {
            parent.mark_invalid_tree();
        }
        self.node.mark_broken_tree();
        Ok(())
    }
}

fn check_basename(name: &str) -> VfsResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(VfsError::InvalidPath(name.to_owned()));
    }
    Ok(())
}

/// Walks upward from `node` to the nearest mount point. Returns the mounted
/// driver together with the driver-relative absolute path of `node`; the
/// mount point itself resolves to `/`.
pub(crate) fn effective_driver(node: &Arc<Node>) -> VfsResult<(VfsPath, Arc<dyn Driver>)> {
    let mut relative = VfsPath::root();
    let mut current = node.clone();

    loop {
        if let Some(state) = current.dir_state() {
            let driver = state.inner.lock().driver.clone();
            if let Some(driver) = driver {
                return Ok((relative, driver));
            }
        }

        let parent = match current.parent.upgrade() {
            Some(parent) => parent,
            None => return Err(VfsError::NoMountPoint(node.path()?.to_string())),
        };

        relative.prepend(&current.name);
        current = parent;
    }
}

/// Reconciles a directory's child index with its driver's current listing.
///
/// Children the driver still reports keep their handles when the kind
/// matches; a kind flip breaks the old handle and installs a fresh one.
/// Children missing from the listing are broken and dropped. Freshly
/// installed handles start Invalid and carry only their identity.
pub(crate) fn validate_directory(node: &Arc<Node>) -> VfsResult<()> {
    match node.validity() {
        Validity::Valid => return Ok(()),
        Validity::Broken => return Err(VfsError::ElementBroken),
        Validity::Invalid => {}
    }

    let (dir_path, driver) = effective_driver(node)?;
    debug!(
        "Validating '{}' against driver '{}' at '{}'",
        node.name,
        driver.name(),
        dir_path
    );

    let state = node
        .dir_state()
        .expect("Directory validation on a non-directory node!");
    let mut inner = state.inner.lock();

    let entries = driver.list(&dir_path)?;

    for entry in &entries {
        let key = basename_key(&entry.name);
        let existing = inner.content.get(&key).cloned();

        if let Some(existing) = existing {
            if entry_matches(entry, &existing) {
                continue;
            }
            existing.mark_broken_tree();
            inner.content.shift_remove(&key);
        }

        inner
            .content
            .insert(key, Node::new_child(node, &entry.name, entry.directory));
    }

    let stale: Vec<String> = inner
        .content
        .iter()
        .filter(|(_, child)| !entries.iter().any(|entry| entry.name == child.name))
        .map(|(key, _)| key.clone())
        .collect();

    for key in stale {
        if let Some(child) = inner.content.shift_remove(&key) {
            child.mark_broken_tree();
        }
    }

    // Valid is set while the child index is still locked, so a concurrent
    // invalidation cannot be overwritten by this validation.
    node.set_validity(Validity::Valid);
    Ok(())
}

fn entry_matches(entry: &FileEntry, node: &Arc<Node>) -> bool {
    entry.name == node.name
        && entry.directory == node.is_directory()
        && node.validity() != Validity::Broken
}
