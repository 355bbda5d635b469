//! Low-level primitives for building the storage engine.
//!
//! Includes byte codecs, block devices, and the transaction lock.

/// Little-endian codecs, bit helpers, and bit vectors.
pub mod bytes;

/// Transaction lock shared by metadata operations and the sync pass.
pub mod concurrency;

/// Block device abstraction with file, memory, and fault-injecting backends.
pub mod io;
