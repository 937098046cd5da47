//! The shared object layer of the tree: one node type specialised into files
//! and directories, plus the validity protocol every handle obeys.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::directory::Directory;
use crate::driver::Driver;
use crate::error::{VfsError, VfsResult};
use crate::file::File;
use crate::path::VfsPath;

/// How much a handle can currently be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// The handle reflects the driver's view and may be used directly.
    Valid,

    /// Only name, parent and root are reliable; the handle must be
    /// validated before its data is used.
    Invalid,

    /// The element no longer exists and cannot be re-established.
    /// This state is terminal.
    Broken,
}

/// A node of the virtual tree. Ownership flows strictly downward: a
/// directory owns its children through `content`, while `root` and `parent`
/// are weak back-references that never extend a lifetime.
pub(crate) struct Node {
    pub(crate) root: Weak<Node>,
    pub(crate) parent: Weak<Node>,
    pub(crate) name: String,
    validity: Mutex<Validity>,
    pub(crate) kind: NodeKind,
}

pub(crate) enum NodeKind {
    File,
    Directory(DirState),
}

pub(crate) struct DirState {
    pub(crate) inner: Mutex<DirInner>,
}

/// The mutable half of a directory, guarded by one lock: the optional
/// mounted driver and the child index. The index is keyed by the ASCII
/// lowercased basename; the stored node keeps the original spelling.
#[derive(Default)]
pub(crate) struct DirInner {
    pub(crate) driver: Option<Arc<dyn Driver>>,
    pub(crate) content: IndexMap<String, Arc<Node>>,
}

/// The case-insensitive key under which a basename is indexed.
pub(crate) fn basename_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Node {
    /// Builds the root node of a new tree: a directory named `/` whose root
    /// reference points at itself and whose parent stays unset.
    pub(crate) fn new_root() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            root: this.clone(),
            parent: Weak::new(),
            name: "/".to_owned(),
            validity: Mutex::new(Validity::Invalid),
            kind: NodeKind::Directory(DirState {
                inner: Mutex::new(DirInner::default()),
            }),
        })
    }

    /// Builds a fresh child node in the Invalid state. The child carries
    /// only its identity until the first touch validates it.
    pub(crate) fn new_child(parent: &Arc<Node>, name: &str, directory: bool) -> Arc<Self> {
        let kind = if directory {
            NodeKind::Directory(DirState {
                inner: Mutex::new(DirInner::default()),
            })
        } else {
            NodeKind::File
        };

        Arc::new(Self {
            root: parent.root.clone(),
            parent: Arc::downgrade(parent),
            name: name.to_owned(),
            validity: Mutex::new(Validity::Invalid),
            kind,
        })
    }

    pub(crate) fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub(crate) fn is_root(&self) -> bool {
        self.name == "/"
    }

    pub(crate) fn dir_state(&self) -> Option<&DirState> {
        match &self.kind {
            NodeKind::Directory(state) => Some(state),
            NodeKind::File => None,
        }
    }

    pub(crate) fn validity(&self) -> Validity {
        *self.validity.lock()
    }

    pub(crate) fn set_validity(&self, validity: Validity) {
        *self.validity.lock() = validity;
    }

    pub(crate) fn check_not_broken(&self) -> VfsResult<()> {
        if self.validity() == Validity::Broken {
            warn!("Element '{}' is broken", self.name);
            return Err(VfsError::ElementBroken);
        }
        Ok(())
    }

    /// Marks this node Invalid and cascades the transition to every current
    /// child. Broken nodes stay Broken; the child index is left untouched.
    pub(crate) fn mark_invalid_tree(&self) {
        {
            let mut validity = self.validity.lock();
            if *validity == Validity::Broken {
                return;
            }
            *validity = Validity::Invalid;
        }

        if let Some(state) = self.dir_state() {
            let inner = state.inner.lock();
            for child in inner.content.values() {
                child.mark_invalid_tree();
            }
        }
    }

    /// Marks this node and every descendant Broken. Terminal; the child
    /// index is left untouched so held handles keep failing consistently.
    pub(crate) fn mark_broken_tree(&self) {
        self.set_validity(Validity::Broken);

        if let Some(state) = self.dir_state() {
            let inner = state.inner.lock();
            for child in inner.content.values() {
                child.mark_broken_tree();
            }
        }
    }

    /// Reconciles this node with its driver if it is not already Valid.
    /// Broken nodes fail immediately and never recover.
    pub(crate) fn validate(self: &Arc<Self>) -> VfsResult<()> {
        match self.validity() {
            Validity::Valid => Ok(()),
            Validity::Broken => Err(VfsError::ElementBroken),
            Validity::Invalid => match &self.kind {
                NodeKind::Directory(_) => crate::directory::validate_directory(self),
                NodeKind::File => crate::file::validate_file(self),
            },
        }
    }

    /// The node's basename. Validates first, so touching a name can go to
    /// the driver; on a Broken handle this fails with *ElementBroken*.
    pub(crate) fn checked_name(self: &Arc<Self>) -> VfsResult<String> {
        self.validate()?;
        Ok(self.name.clone())
    }

    /// The node's absolute path within the tree. Fails on Broken handles at
    /// any level of the walk upward.
    pub(crate) fn path(&self) -> VfsResult<VfsPath> {
        self.check_not_broken()?;

        match self.parent.upgrade() {
            Some(parent) => Ok(parent.path()?.with(&self.name)),
            None if self.is_root() => Ok(VfsPath::root()),
            // The owning tree is gone; the handle cannot re-establish
            // its identity.
            None => Err(VfsError::ElementBroken),
        }
    }

    /// The enclosing directory, or *None* on the root.
    pub(crate) fn checked_parent(&self) -> VfsResult<Option<Directory>> {
        self.check_not_broken()?;

        match self.parent.upgrade() {
            Some(parent) => Ok(Some(Directory::from_node(parent))),
            None if self.is_root() => Ok(None),
            None => Err(VfsError::ElementBroken),
        }
    }

    /// Resolves an exact (wildcard-free) navigation path downward from
    /// `node`, validating each directory along the way.
    pub(crate) fn navigate(node: &Arc<Node>, path: &VfsPath) -> VfsResult<Arc<Node>> {
        if path.is_empty() {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        node.validate()?;

        let state = node
            .dir_state()
            .ok_or_else(|| VfsError::kind_invalid(node.name.clone(), "expected a directory"))?;

        let head = &path[0];
        let child = {
            let inner = state.inner.lock();
            inner.content.get(&basename_key(head)).cloned()
        };

        let child = match child {
            Some(child) => child,
            None => {
                let parent = node.path().unwrap_or_default();
                return Err(VfsError::not_found(path, parent));
            }
        };

        if path.len() == 1 {
            return Ok(child);
        }

        if !child.is_directory() {
            return Err(VfsError::kind_invalid(path, "expected a directory"));
        }
        Self::navigate(&child, &path.subpath(1))
    }
}

/// A client-visible reference to any object of the tree. Handles are cheap
/// to clone and outlive individual validations.
#[derive(Clone)]
pub enum Handle {
    File(File),
    Directory(Directory),
}

impl Handle {
    pub(crate) fn from_node(node: Arc<Node>) -> Self {
        if node.is_directory() {
            Handle::Directory(Directory::from_node(node))
        } else {
            Handle::File(File::from_node(node))
        }
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        match self {
            Handle::File(file) => file.node(),
            Handle::Directory(dir) => dir.node(),
        }
    }

    /// The object's basename. Validates the handle first.
    pub fn name(&self) -> VfsResult<String> {
        self.node().checked_name()
    }

    /// The object's absolute path within the tree.
    pub fn path(&self) -> VfsResult<VfsPath> {
        self.node().path()
    }

    /// The enclosing directory, or *None* on the root.
    pub fn parent(&self) -> VfsResult<Option<Directory>> {
        self.node().checked_parent()
    }

    /// The handle's current validity. Never fails and never validates.
    pub fn validity(&self) -> Validity {
        self.node().validity()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Handle::Directory(_))
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match self {
            Handle::Directory(dir) => Some(dir),
            Handle::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Handle::File(file) => Some(file),
            Handle::Directory(_) => None,
        }
    }

    /// Removes the object through its driver, breaking this handle.
    pub fn remove(&self) -> VfsResult<()> {
        match self {
            Handle::File(file) => file.remove(),
            Handle::Directory(dir) => dir.remove(),
        }
    }

    /// Whether two handles refer to the same underlying object.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(self.node(), other.node())
    }
}
