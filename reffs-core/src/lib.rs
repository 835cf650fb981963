//! RefFS: an in-memory, POSIX-flavored filesystem used as an oracle for
//! model-based cross-checking of other filesystem implementations. This
//! crate is the store — inode table, façade, readdir cursors, checkpoint
//! engine and pickle codec. The FUSE wire protocol and CLI argument
//! handling live in `mount-reffs`; the ioctl-issuing utilities live in
//! `reffsctl`.

pub mod config;
pub mod error;
pub mod inode;
pub mod pickle;
pub mod readdir;
pub mod snapshot;
pub mod store;
pub mod table;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use store::{CacheInvalidator, NullInvalidator, StatFs, Store};
pub use table::ROOT_INO;
