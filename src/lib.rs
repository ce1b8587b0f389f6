//! netcache: a disk-backed, content-addressed response cache storage engine.
//!
//! The engine persists (response header, response body) pairs keyed by a
//! request fingerprint, serves concurrent lookups, and bounds total disk
//! usage through probabilistic eviction. It tolerates process restarts and
//! partial writes: a torn record simply fails its checksums and is treated
//! as absent.
//!
//! # Architecture
//!
//! ```text
//!            +----------------------------------------+
//!            |                Storage                 |
//!            |  handle: retrieve / store / update ... |
//!            +-------------------+--------------------+
//!                                | commands
//!                                v
//!            +----------------------------------------+
//!            |            sequencer thread            |
//!            | existence filter, pending + active ops |
//!            | size accounting, shrink scheduling     |
//!            +-------+------------------------+-------+
//!         reads |                             | writes, sweeps
//!               v                             v
//!       +---------------+            +----------------+
//!       | foreground    |            | background     |
//!       | pool (<= 5)   |            | pool (<= 3 wr) |
//!       +---------------+            +----------------+
//!               \                             /
//!                +---- completion closures --+
//! ```
//!
//! One sequencer thread owns all mutable scheduler state; worker pools do
//! the blocking file I/O and post completions back to it, so no state is
//! shared and no locks are taken.
//!
//! # On-disk layout
//!
//! ```text
//! <base>/
//!   Version N/
//!     <partition>/
//!       <lowercase-hex-hash>     one record per cached response
//! ```
//!
//! Each record carries a checksummed preamble, the response header, and the
//! response body aligned to a page boundary so retrieves can hand back a
//! memory-mapped view of the body instead of a copy.
//!
//! # Example
//!
//! ```no_run
//! use netcache::{Entry, Key, Storage, StorageConfig};
//!
//! # fn run() -> netcache::StorageResult<()> {
//! let storage = Storage::open(
//!     "/var/cache/netcache",
//!     StorageConfig::new().maximum_size(256 * 1024 * 1024),
//! )?;
//!
//! let key = Key::from_fingerprint("default", b"GET https://example.com/");
//! let entry = Entry::new(key.clone(), b"headers".as_slice(), b"body".as_slice());
//! storage.store(entry, |ok, _body| {
//!     assert!(ok);
//! });
//! storage.retrieve(key, 2, |entry| {
//!     // Returning false would evict the entry.
//!     entry.is_some()
//! });
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types
mod config;
mod data;
mod entry;
mod error;
mod key;

// Engine internals
mod filter;
mod fs;
mod io;
mod metrics;
mod pool;
mod storage;

pub use config::StorageConfig;
pub use data::Data;
pub use entry::Entry;
pub use error::{StorageError, StorageResult};
pub use filter::CountingFilter;
pub use io::{IoChannel, Mode};
pub use key::{HASH_SIZE, Key, KeyHash};
pub use metrics::{MetricsSnapshot, StorageMetrics};
pub use storage::{MAX_RETRIEVE_PRIORITY, Storage, VERSION};
