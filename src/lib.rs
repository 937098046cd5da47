// This is the root of GraftFS, a mount-aware virtual filesystem.
// Backend drivers are grafted onto directories of a shared tree; every
// handle into the tree stays consistent with its driver through a
// three-state validity protocol.

#[macro_use]
extern crate log;

mod directory;
mod driver;
mod error;
mod file;
mod memory;
mod native;
mod object;
mod path;
mod sys;

pub use directory::{Directory, Root};
pub use driver::{Driver, FileEntry, MapLock, MapLockGuard, MountRegistry, MappedFile, OpenFile};
pub use error::{VfsError, VfsResult};
pub use file::{File, Mapping, Stream};
pub use memory::MemoryDriver;
pub use native::NativeFsDriver;
pub use object::{Handle, Validity};
pub use path::VfsPath;
