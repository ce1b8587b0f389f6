//! Worker pools that run blocking file I/O off the sequencer.
//!
//! A [`WorkPool`] is a fixed set of named threads draining a job channel.
//! Dropping the pool closes the channel; workers finish the jobs already
//! queued and exit, and the drop joins them.

use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use tracing::trace;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Relative scheduling priority of a pool's threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolPriority {
    /// Normal OS scheduling; used for reads.
    Foreground,
    /// Niced below normal; used for writes, sweeps and deletions.
    Background,
}

pub(crate) struct WorkPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkPool {
    /// Spawn `threads` workers named `{name_prefix}-{index}`.
    pub fn new(name_prefix: &str, threads: usize, priority: PoolPriority) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..threads)
            .map(|index| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name_prefix}-{index}"))
                    .spawn(move || {
                        if priority == PoolPriority::Background {
                            lower_thread_priority();
                        }
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        trace!("worker exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Queue a job for execution on any worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Best-effort nice of the calling thread; on Linux a zero `who` with
/// `PRIO_PROCESS` adjusts only the current thread.
fn lower_thread_priority() {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, 10);
    }
}
