//! sealfs: an encrypted, transactional filesystem core.
//!
//! Files, directories, symbolic links, and character devices exist only as
//! records in an embedded ordered key/value store whose values are sealed
//! with AES-GCM. Five layers:
//!   + Envelope: every stored value is `IV || TAG || CIPHERTEXT`.
//!   + Store: read-committed transactions over an ordered KV engine,
//!     one atomic batch per commit.
//!   + Inodes: typed records, link counts, descriptor references, and a
//!     persistent set of inodes awaiting deferred destruction.
//!   + Blocks: fixed-size plaintext blocks, each sealed independently,
//!     with random read/write at arbitrary byte positions.
//!   + Descriptors: seekable handles with POSIX append semantics.
//!
//! The path-based call surface (open, readdir, rename, ...) sits above this
//! crate; so does the production KV engine, which plugs in through
//! [`store::KvEngine`].

pub mod blocks;
pub mod crypto;
pub mod error;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod param;
pub mod stat;
pub mod store;
pub mod workers;

pub use crate::error::{Error, Result};
pub use crate::file::FileDescriptor;
pub use crate::fs::{InodeManager, Options};
pub use crate::store::{KvEngine, MemEngine};
