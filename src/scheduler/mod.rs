//! The strand based scheduler.
//!
//! A [`Scheduler`] owns the worker threads that drive every coroutine in the
//! engine plus two auxiliary facilities: a deadline timer for polling waits
//! and a small pool for blocking file reads. Subsystems obtain their serial
//! lanes through [`Scheduler::make_strands`] and never touch threads
//! directly.

mod strand;
mod timer;

use std::path::PathBuf;
use std::time::Duration;

use futures::channel::oneshot;
use futures::executor::ThreadPool;

use crate::error::Error;

pub use strand::{Strand, StrandGroup, StrandLanes};
pub use timer::Sleep;

/// Interval used by coroutines polling a slow condition, for example a
/// fence that has not signalled yet or a cache entry that is still loading.
pub const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Worker thread pool plus the shared timing and I/O facilities.
///
/// Dropping the scheduler shuts the worker threads down. The caller must
/// ensure all subsystems built on top of it have completed their outstanding
/// work first; every strand group and lease must be dropped before the
/// scheduler is.
pub struct Scheduler {
    workers: ThreadPool,
    io_workers: ThreadPool,
    timer: timer::Timer,
}

impl Scheduler {
    /// Number of threads of the blocking file I/O pool.
    const IO_WORKER_COUNT: usize = 2;

    /// Creates a scheduler with an explicit worker thread count.
    pub fn new(worker_count: usize) -> Result<Self, Error> {
        let workers = ThreadPool::builder()
            .pool_size(worker_count.max(1))
            .name_prefix("worker-")
            .create()
            .map_err(|err| {
                log::error!("failed to create worker pool: {:?}", err);
                Error::InternalError
            })?;

        let io_workers = ThreadPool::builder()
            .pool_size(Self::IO_WORKER_COUNT)
            .name_prefix("io-worker-")
            .create()
            .map_err(|err| {
                log::error!("failed to create io worker pool: {:?}", err);
                Error::InternalError
            })?;

        log::debug!("scheduler started with {} workers", worker_count.max(1));

        Ok(Self {
            workers,
            io_workers,
            timer: timer::Timer::new(),
        })
    }

    /// Mints the strand group of subsystem `S` over the shared worker pool.
    pub fn make_strands<S: StrandLanes>(&self) -> StrandGroup<S> {
        StrandGroup::new(&self.workers)
    }

    /// Returns a future completing after `duration`.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.timer.sleep(duration)
    }

    /// Reads a whole file on the blocking I/O pool.
    ///
    /// The returned future suspends the calling coroutine without occupying
    /// a worker thread while the read is in flight.
    pub async fn read_file(&self, path: impl Into<PathBuf>) -> Result<Vec<u8>, std::io::Error> {
        let path = path.into();
        let (sender, receiver) = oneshot::channel();

        self.io_workers.spawn_ok(async move {
            let _ = sender.send(std::fs::read(&path));
        });

        receiver.await.unwrap_or_else(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "io worker pool shut down"))
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(num_cpus::get()).unwrap_or_else(|err| {
            log::error!("failed to start scheduler: {:?}", err);
            panic!()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::executor::block_on;

    use super::*;

    #[test]
    fn read_file_round_trip() {
        let scheduler = Scheduler::new(2).unwrap();

        let mut path = std::env::temp_dir();
        path.push(format!("ember-core-sched-test-{}", std::process::id()));

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"scheduler io test").unwrap();
        drop(file);

        let data = block_on(scheduler.read_file(&path)).unwrap();
        assert_eq!(data, b"scheduler io test");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_file_missing() {
        let scheduler = Scheduler::new(2).unwrap();

        let err = block_on(scheduler.read_file("/nonexistent/ember-core-missing")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn sleep_through_scheduler() {
        let scheduler = Scheduler::new(1).unwrap();

        let start = std::time::Instant::now();
        block_on(scheduler.sleep(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
