//! `loopstore`: the per-hash loop-image lifecycle engine behind a
//! content-addressable blob store. See `SPEC_FULL.md` for the design.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod image;
pub mod mount;
pub mod process;
pub mod reader;
pub mod refcount;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use reader::LoopReader;
pub use store::{BlobStore, DiskUsage, FileInfo, LoopBlobStore, ReaderHandle, Verifier};
