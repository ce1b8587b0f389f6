//! The storage engine: sequencer, operation scheduler and eviction.
//!
//! [`Storage`] is a handle that posts commands into a single-consumer
//! mailbox. A dedicated sequencer thread drains the mailbox and owns every
//! piece of mutable scheduler state: the existence filter, the pending and
//! active operation sets, the size limit and the shrink flag. Blocking file
//! work runs on two worker pools; every pool job finishes by posting a
//! completion closure back to the mailbox, so no state is ever touched from
//! two threads and no locks are needed.
//!
//! ```text
//!  Storage handle ----commands----> +-----------+
//!                                   | sequencer |----reads----> foreground pool
//!  pool jobs ------completions----> | (mailbox) |----writes---> background pool
//!                                   +-----------+   sweeps, deletions
//! ```

use crate::config::StorageConfig;
use crate::data::Data;
use crate::entry::{self, Entry};
use crate::error::{StorageError, StorageResult};
use crate::filter::CountingFilter;
use crate::fs::{self, EntryKind};
use crate::io::{IoChannel, Mode};
use crate::key::Key;
use crate::metrics::{MetricsSnapshot, StorageMetrics};
use crate::pool::{PoolPriority, WorkPool};
use crossbeam_channel::{Receiver, Sender};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info};

pub use crate::entry::VERSION;

/// Highest priority accepted by [`Storage::retrieve`]; larger values are
/// clamped.
pub const MAX_RETRIEVE_PRIORITY: usize = 4;

const MAX_ACTIVE_READS: usize = 5;
const MAX_ACTIVE_WRITES: usize = 3;
const DELETION_PROBABILITY: f64 = 0.25;
const TRAVERSE_HEADER_READ_SIZE: usize = 16 * 1024;
const VERSION_DIRECTORY_PREFIX: &str = "Version ";

const FOREGROUND_THREADS: usize = MAX_ACTIVE_READS;
const BACKGROUND_THREADS: usize = MAX_ACTIVE_WRITES + 1;

type RetrieveHandler = Box<dyn FnOnce(Option<Entry>) -> bool + Send>;
type StoreHandler = Box<dyn FnOnce(bool, Data) + Send>;
type TraverseHandler = Box<dyn FnMut(Option<Entry>) + Send>;

enum Command {
    Retrieve {
        key: Key,
        priority: usize,
        handler: RetrieveHandler,
    },
    Store {
        entry: Entry,
        handler: StoreHandler,
    },
    Update {
        entry: Entry,
        existing: Entry,
        handler: StoreHandler,
    },
    Remove {
        key: Key,
    },
    Traverse {
        handler: TraverseHandler,
    },
    SetMaximumSize(u64),
    Clear,
    Run(Box<dyn FnOnce(&mut Sequencer) + Send>),
    Shutdown,
}

/// Handle to a disk-backed response cache.
///
/// Operations are asynchronous: each takes a completion handler that runs on
/// the engine's sequencer thread once the operation settles. Dropping the
/// handle drains in-flight operations before the engine shuts down.
pub struct Storage {
    tx: Sender<Command>,
    metrics: Arc<StorageMetrics>,
    directory: PathBuf,
    sequencer: Option<JoinHandle<()>>,
}

impl Storage {
    /// Open (or create) a cache rooted at `path`.
    ///
    /// Stale version directories are deleted and the existence filter is
    /// repopulated from disk in the background; retrieves issued before the
    /// startup traversal reaches an entry may miss.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> StorageResult<Self> {
        let base_directory = path.as_ref().to_path_buf();
        fs::make_all_directories(&base_directory).map_err(|source| {
            StorageError::DirectoryCreation {
                path: base_directory.clone(),
                source,
            }
        })?;
        let directory = base_directory.join(format!("{VERSION_DIRECTORY_PREFIX}{VERSION}"));

        let metrics = Arc::new(StorageMetrics::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let sequencer = Sequencer::new(
            base_directory,
            directory.clone(),
            &config,
            tx.clone(),
            metrics.clone(),
        );
        let handle = std::thread::Builder::new()
            .name("cache-sequencer".into())
            .spawn(move || sequencer.run(rx))
            .map_err(StorageError::ThreadSpawn)?;

        Ok(Self {
            tx,
            metrics,
            directory,
            sequencer: Some(handle),
        })
    }

    /// Look up `key`. The handler receives the entry, or `None` when the
    /// cache has nothing valid for the key; returning `false` from the
    /// handler rejects the entry and removes it from the cache.
    pub fn retrieve(
        &self,
        key: Key,
        priority: usize,
        handler: impl FnOnce(Option<Entry>) -> bool + Send + 'static,
    ) {
        let _ = self.tx.send(Command::Retrieve {
            key,
            priority,
            handler: Box::new(handler),
        });
    }

    /// Persist `entry`. The handler receives the outcome and, for bodies
    /// spanning at least one page, a memory-mapped view of the body region.
    pub fn store(&self, entry: Entry, handler: impl FnOnce(bool, Data) + Send + 'static) {
        let _ = self.tx.send(Command::Store {
            entry,
            handler: Box::new(handler),
        });
    }

    /// Replace the stored header of `existing` with `entry`'s.
    ///
    /// When the page-rounded header size is unchanged this rewrites only the
    /// header region in place and leaves the body untouched; otherwise it
    /// falls back to a full write.
    pub fn update(
        &self,
        entry: Entry,
        existing: Entry,
        handler: impl FnOnce(bool, Data) + Send + 'static,
    ) {
        debug_assert_eq!(entry.key, existing.key);
        let _ = self.tx.send(Command::Update {
            entry,
            existing,
            handler: Box::new(handler),
        });
    }

    /// Drop `key` from the filter and delete its file in the background.
    pub fn remove(&self, key: Key) {
        let _ = self.tx.send(Command::Remove { key });
    }

    /// Visit every on-disk entry, header only, ending with `None`.
    pub fn traverse(&self, handler: impl FnMut(Option<Entry>) + Send + 'static) {
        let _ = self.tx.send(Command::Traverse {
            handler: Box::new(handler),
        });
    }

    /// Set the target disk usage. 0 disables caching entirely.
    pub fn set_maximum_size(&self, size: u64) {
        let _ = self.tx.send(Command::SetMaximumSize(size));
    }

    /// Delete every cached entry and reset the filter and size accounting.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }

    /// Operation counters for this instance.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The versioned directory entries live under.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.sequencer.take() {
            let _ = handle.join();
        }
    }
}

struct ReadOperation {
    key: Key,
    handler: RetrieveHandler,
}

struct WriteOperation {
    id: u64,
    entry: Entry,
    existing: Option<Entry>,
    handler: StoreHandler,
}

struct Sequencer {
    base_directory: PathBuf,
    directory: PathBuf,
    maximum_size: u64,
    approximate_size: Arc<AtomicU64>,
    shrink_in_progress: bool,
    filter: CountingFilter,
    pending_reads: [VecDeque<ReadOperation>; MAX_RETRIEVE_PRIORITY + 1],
    active_reads: HashMap<u64, ReadOperation>,
    pending_writes: VecDeque<WriteOperation>,
    active_writes: HashMap<u64, WriteOperation>,
    next_operation_id: u64,
    tx: Sender<Command>,
    foreground: WorkPool,
    background: WorkPool,
    metrics: Arc<StorageMetrics>,
    draining: bool,
}

fn directory_path_for_key(key: &Key, directory: &Path) -> PathBuf {
    debug_assert!(!key.partition().is_empty());
    directory.join(key.partition())
}

fn file_path_for_key(key: &Key, directory: &Path) -> PathBuf {
    directory_path_for_key(key, directory).join(key.hash_as_string())
}

fn open_file_for_key(key: &Key, mode: Mode, directory: &Path) -> io::Result<IoChannel> {
    let directory_path = directory_path_for_key(key, directory);
    if mode == Mode::Create {
        fs::make_all_directories(&directory_path)?;
    }
    IoChannel::open(&directory_path.join(key.hash_as_string()), mode)
}

impl Sequencer {
    fn new(
        base_directory: PathBuf,
        directory: PathBuf,
        config: &StorageConfig,
        tx: Sender<Command>,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            base_directory,
            directory,
            maximum_size: config.maximum_size,
            approximate_size: Arc::new(AtomicU64::new(0)),
            shrink_in_progress: false,
            filter: CountingFilter::new(config.filter_capacity),
            pending_reads: std::array::from_fn(|_| VecDeque::new()),
            active_reads: HashMap::new(),
            pending_writes: VecDeque::new(),
            active_writes: HashMap::new(),
            next_operation_id: 0,
            tx,
            foreground: WorkPool::new("cache-read", FOREGROUND_THREADS, PoolPriority::Foreground),
            background: WorkPool::new("cache-write", BACKGROUND_THREADS, PoolPriority::Background),
            metrics,
            draining: false,
        }
    }

    fn run(mut self, rx: Receiver<Command>) {
        self.delete_old_versions();
        self.initialize();

        while let Ok(command) = rx.recv() {
            self.handle(command);
            if self.draining && self.is_idle() {
                break;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.active_reads.is_empty()
            && self.active_writes.is_empty()
            && self.pending_writes.is_empty()
            && self.pending_reads.iter().all(VecDeque::is_empty)
            && !self.shrink_in_progress
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Retrieve {
                key,
                priority,
                handler,
            } => self.retrieve(key, priority, handler),
            Command::Store { entry, handler } => self.store(entry, None, handler),
            Command::Update {
                entry,
                existing,
                handler,
            } => self.store(entry, Some(existing), handler),
            Command::Remove { key } => self.remove_entry(&key),
            Command::Traverse { handler } => self.traverse(handler),
            Command::SetMaximumSize(size) => {
                self.maximum_size = size;
                self.shrink_if_needed();
            }
            Command::Clear => self.clear(),
            Command::Run(f) => f(self),
            Command::Shutdown => self.draining = true,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_operation_id += 1;
        self.next_operation_id
    }

    // --- retrieve ---

    fn retrieve(&mut self, key: Key, priority: usize, handler: RetrieveHandler) {
        debug_assert!(priority <= MAX_RETRIEVE_PRIORITY);
        self.metrics.incr_retrieves();

        if self.maximum_size == 0 {
            self.metrics.incr_retrieve_misses();
            let _ = handler(None);
            return;
        }
        if !self.filter.may_contain(key.short_hash()) {
            self.metrics.incr_retrieve_misses();
            let _ = handler(None);
            return;
        }
        // An in-flight write for this key is the freshest state; answer from
        // memory instead of racing the file.
        if let Some(pending) = self.find_pending_write(&key) {
            debug!(?key, "retrieve satisfied by write operation in progress");
            self.metrics.incr_memory_hits();
            self.metrics.incr_retrieve_hits();
            let _ = self.tx.send(Command::Run(Box::new(move |_| {
                let _ = handler(Some(pending));
            })));
            return;
        }

        let priority = priority.min(MAX_RETRIEVE_PRIORITY);
        self.pending_reads[priority].push_back(ReadOperation { key, handler });
        self.dispatch_pending_reads();
    }

    fn find_pending_write(&self, key: &Key) -> Option<Entry> {
        self.pending_writes
            .iter()
            .chain(self.active_writes.values())
            .find(|op| op.entry.key == *key)
            .map(|op| op.entry.clone())
    }

    fn dispatch_pending_reads(&mut self) {
        loop {
            if self.active_reads.len() >= MAX_ACTIVE_READS {
                debug!("limiting parallel retrieves");
                return;
            }
            let Some(operation) = self
                .pending_reads
                .iter_mut()
                .rev()
                .find_map(VecDeque::pop_front)
            else {
                return;
            };
            let id = self.next_id();
            self.dispatch_read(id, &operation.key);
            self.active_reads.insert(id, operation);
        }
    }

    fn dispatch_read(&self, id: u64, key: &Key) {
        let key = key.clone();
        let path = file_path_for_key(&key, &self.directory);
        let tx = self.tx.clone();
        self.foreground.execute(move || {
            let outcome = IoChannel::open(&path, Mode::Read)
                .and_then(|channel| {
                    let data = channel.read_to_end()?;
                    Ok(entry::decode_entry(&data, channel.file(), &key))
                });
            let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                sequencer.complete_read(id, outcome);
            })));
        });
    }

    fn complete_read(&mut self, id: u64, outcome: io::Result<Option<Entry>>) {
        let Some(operation) = self.active_reads.remove(&id) else {
            return;
        };
        match outcome {
            Err(err) => {
                debug!(key = ?operation.key, error = %err, "read failed");
                self.metrics.incr_retrieve_misses();
                self.remove_entry(&operation.key);
                let _ = (operation.handler)(None);
            }
            Ok(None) => {
                debug!(key = ?operation.key, "entry failed validation");
                self.metrics.incr_corrupt_entries();
                self.metrics.incr_retrieve_misses();
                self.remove_entry(&operation.key);
                let _ = (operation.handler)(None);
            }
            Ok(Some(found)) => {
                self.metrics.incr_retrieve_hits();
                let keep = (operation.handler)(Some(found));
                if !keep {
                    self.remove_entry(&operation.key);
                }
            }
        }
        self.dispatch_pending_reads();
    }

    // --- store / update ---

    fn store(&mut self, entry: Entry, existing: Option<Entry>, handler: StoreHandler) {
        self.metrics.incr_stores();
        if self.maximum_size == 0 {
            self.metrics.incr_store_failures();
            handler(false, Data::empty());
            return;
        }

        let is_new = existing.is_none();
        let short_hash = entry.key.short_hash();
        let id = self.next_id();
        self.pending_writes.push_back(WriteOperation {
            id,
            entry,
            existing,
            handler,
        });
        // Pending writes already satisfy retrieves, so the filter learns the
        // key as soon as the write is queued. Updates leave it alone.
        if is_new {
            self.filter.add(short_hash);
        }
        self.dispatch_pending_writes();
    }

    fn dispatch_pending_writes(&mut self) {
        while !self.pending_writes.is_empty() {
            if self.active_writes.len() >= MAX_ACTIVE_WRITES {
                debug!("limiting parallel writes");
                return;
            }
            let Some(operation) = self.pending_writes.pop_front() else {
                return;
            };
            let id = operation.id;
            let header_update = operation.existing.is_some()
                && self.filter.may_contain(operation.entry.key.short_hash());
            self.active_writes.insert(id, operation);
            if header_update {
                self.dispatch_header_write(id);
            } else {
                self.dispatch_full_write(id);
            }
        }
    }

    fn dispatch_full_write(&mut self, id: u64) {
        let Some(operation) = self.active_writes.get(&id) else {
            return;
        };
        let entry = operation.entry.clone();

        let short_hash = entry.key.short_hash();
        if !self.filter.may_contain(short_hash) {
            self.filter.add(short_hash);
        }

        let directory = self.directory.clone();
        let tx = self.tx.clone();
        let approximate_size = self.approximate_size.clone();
        self.background.execute(move || {
            let blob = entry::encode_entry(&entry);
            let body_size = entry.body.len() as u64;
            let body_offset = blob.len() as u64 - body_size;

            let result = open_file_for_key(&entry.key, Mode::Create, &directory)
                .and_then(|channel| {
                    channel.write(0, &blob)?;
                    Ok(channel)
                });

            approximate_size.fetch_add(blob.len() as u64, Ordering::Relaxed);

            let (success, body_map) = match result {
                Ok(channel) => {
                    let map = if body_size >= fs::page_size() {
                        channel.map(body_offset, body_size).unwrap_or_else(Data::empty)
                    } else {
                        Data::empty()
                    };
                    (true, map)
                }
                Err(err) => {
                    debug!(key = ?entry.key, error = %err, "write failed");
                    (false, Data::empty())
                }
            };

            let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                if !success {
                    sequencer.metrics.incr_store_failures();
                    if sequencer.filter.may_contain(short_hash) {
                        sequencer.filter.remove(short_hash);
                    }
                }
                sequencer.complete_write(id, success, body_map);
            })));
        });

        self.shrink_if_needed();
    }

    fn dispatch_header_write(&mut self, id: u64) {
        let Some(operation) = self.active_writes.get(&id) else {
            return;
        };
        let entry = operation.entry.clone();
        let existing = operation.existing.clone();
        let Some(existing) = existing else {
            self.dispatch_full_write(id);
            return;
        };

        let directory = self.directory.clone();
        let tx = self.tx.clone();
        self.background.execute(move || {
            let new_header = entry::encode_entry_header(&entry);
            let existing_header = entry::encode_entry_header(&existing);

            if new_header.len() != existing_header.len() {
                debug!(key = ?entry.key, "page-rounded header size changed, storing full entry");
                let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                    sequencer.dispatch_full_write(id);
                })));
                return;
            }

            let result = open_file_for_key(&entry.key, Mode::Write, &directory)
                .and_then(|channel| channel.write(0, &new_header));
            let success = result.is_ok();
            if let Err(err) = result {
                debug!(key = ?entry.key, error = %err, "header update failed");
            }

            let key = entry.key;
            let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                if success {
                    sequencer.metrics.incr_header_updates();
                } else {
                    // A torn header leaves the record unreadable; drop it.
                    sequencer.metrics.incr_store_failures();
                    sequencer.remove_entry(&key);
                }
                sequencer.complete_write(id, success, Data::empty());
            })));
        });
    }

    fn complete_write(&mut self, id: u64, success: bool, body_map: Data) {
        let Some(operation) = self.active_writes.remove(&id) else {
            return;
        };
        debug!(key = ?operation.entry.key, success, "write complete");
        (operation.handler)(success, body_map);
        self.dispatch_pending_writes();
        self.shrink_if_needed();
    }

    // --- removal, traversal, clearing ---

    fn remove_entry(&mut self, key: &Key) {
        // The size counter is left alone; the next shrink recomputes it from
        // the files that survive.
        let short_hash = key.short_hash();
        if self.filter.may_contain(short_hash) {
            self.filter.remove(short_hash);
        }
        self.metrics.incr_removals();

        let path = file_path_for_key(key, &self.directory);
        self.background.execute(move || {
            fs::delete_file(&path);
        });
    }

    fn traverse(&mut self, mut handler: TraverseHandler) {
        let directory = self.directory.clone();
        let tx = self.tx.clone();
        self.foreground.execute(move || {
            fs::traverse_cache_files(&directory, |file_name, partition_path| {
                let path = partition_path.join(file_name);
                let Ok(channel) = IoChannel::open(&path, Mode::Read) else {
                    return;
                };
                let Ok(data) = channel.read(0, TRAVERSE_HEADER_READ_SIZE) else {
                    return;
                };
                if let Some((metadata, header)) = entry::decode_entry_header(&data) {
                    handler(Some(Entry {
                        key: metadata.key,
                        timestamp: metadata.timestamp,
                        header,
                        body: Data::empty(),
                    }));
                }
            });
            let _ = tx.send(Command::Run(Box::new(move |_| handler(None))));
        });
    }

    fn clear(&mut self) {
        info!("clearing cache");
        self.filter.clear();
        self.approximate_size.store(0, Ordering::Relaxed);

        let directory = self.directory.clone();
        self.foreground.execute(move || {
            fs::traverse_directory(&directory, EntryKind::Directory, |partition| {
                let partition_path = directory.join(partition);
                fs::traverse_directory(&partition_path, EntryKind::File, |file_name| {
                    fs::delete_file(&partition_path.join(file_name));
                });
                fs::delete_empty_directory(&partition_path);
            });
        });
    }

    // --- size accounting and shrink ---

    fn shrink_if_needed(&mut self) {
        let approximate_size = self.approximate_size.load(Ordering::Relaxed);
        if approximate_size <= self.maximum_size {
            return;
        }
        if self.shrink_in_progress {
            return;
        }
        self.shrink_in_progress = true;
        self.metrics.incr_shrinks();
        info!(
            approximate_size,
            maximum_size = self.maximum_size,
            "shrinking cache"
        );

        // The sweep rebuilds the size from the surviving files.
        self.approximate_size.store(0, Ordering::Relaxed);

        let directory = self.directory.clone();
        let tx = self.tx.clone();
        let size_counter = self.approximate_size.clone();
        let metrics = self.metrics.clone();
        self.background.execute(move || {
            let mut rng = rand::rng();
            fs::traverse_cache_files(&directory, |file_name, partition_path| {
                let path = partition_path.join(file_name);
                metrics.incr_files_swept();

                let should_delete = rng.random::<f64>() < DELETION_PROBABILITY;
                if !should_delete {
                    size_counter.fetch_add(fs::file_size(&path), Ordering::Relaxed);
                    return;
                }

                fs::delete_file(&path);
                metrics.incr_files_deleted();
                let Some(hash) = Key::string_to_hash(file_name) else {
                    return;
                };
                let short_hash = Key::short_hash_of(&hash);
                let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                    if sequencer.filter.may_contain(short_hash) {
                        sequencer.filter.remove(short_hash);
                    }
                })));
            });

            fs::traverse_directory(&directory, EntryKind::Directory, |partition| {
                fs::delete_empty_directory(&directory.join(partition));
            });

            let _ = tx.send(Command::Run(Box::new(|sequencer| {
                sequencer.shrink_in_progress = false;
                info!(
                    approximate_size = sequencer.approximate_size.load(Ordering::Relaxed),
                    "cache shrink completed"
                );
            })));
        });
    }

    // --- startup ---

    fn initialize(&self) {
        let directory = self.directory.clone();
        let tx = self.tx.clone();
        let size_counter = self.approximate_size.clone();
        self.background.execute(move || {
            fs::traverse_cache_files(&directory, |file_name, partition_path| {
                let Some(hash) = Key::string_to_hash(file_name) else {
                    return;
                };
                let short_hash = Key::short_hash_of(&hash);
                let _ = tx.send(Command::Run(Box::new(move |sequencer| {
                    sequencer.filter.add(short_hash);
                })));
                let size = fs::file_size(&partition_path.join(file_name));
                size_counter.fetch_add(size, Ordering::Relaxed);
            });
        });
    }

    fn delete_old_versions(&self) {
        let base = self.base_directory.clone();
        self.background.execute(move || {
            fs::traverse_directory(&base, EntryKind::Directory, |name| {
                if name.starts_with(VERSION_DIRECTORY_PREFIX) {
                    return;
                }
                let stale = base.join(name);
                debug!(path = %stale.display(), "deleting old cache version");
                fs::traverse_directory(&stale, EntryKind::File, |file_name| {
                    fs::delete_file(&stale.join(file_name));
                });
                fs::delete_empty_directory(&stale);
            });
        });
    }
}
