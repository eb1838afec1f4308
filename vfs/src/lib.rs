//! # Ember VFS
//!
//! Asynchronous, streaming file reads on top of the Ember task system.
//!
//! A read request carries a callback that receives the file contents in
//! chunks ([`FileChunk::Reading`]) followed by exactly one terminal status
//! ([`FileChunk::Success`] or [`FileChunk::Fail`]). The request runs as a
//! task, so other tasks can depend on it through
//! [`AsyncFileSystem::as_task`] — the shader database chains compilation
//! after the source read this way.
//!
//! Requests start as soon as they are issued. [`AsyncFileSystem::execute`]
//! is an idempotent re-schedule so a caller can also drive a single
//! request synchronously: `execute`, `wait`, `close_handle` — the pattern
//! the shader include resolver uses to present a blocking read to the
//! compiler from inside a worker task.

mod error;
mod filesystem;
mod path;

pub use error::VfsError;
pub use filesystem::{
    AsyncFileHandle, AsyncFileSystem, FileChunk, FileReadRequest, READ_CHUNK_SIZE,
};
