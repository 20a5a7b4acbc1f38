//! Serial execution lanes over the shared worker pool.

use std::future::Future;
use std::marker::PhantomData;

use futures::channel::{mpsc, oneshot};
use futures::executor::ThreadPool;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::task::SpawnExt;

use crate::error::Error;

/// A serial execution lane.
///
/// Coroutines spawned onto the same strand begin execution in submission
/// order and interleave only at their await points. Two segments of the same
/// strand never run concurrently, but every segment may run on any worker
/// thread. This is the only concurrency primitive the subsystems built on
/// top of the scheduler use.
#[derive(Clone)]
pub struct Strand {
    sender: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Strand {
    pub(super) fn new(pool: &ThreadPool, name: String) -> Self {
        let (sender, receiver) = mpsc::unbounded();

        pool.spawn(Self::drive(receiver, name)).unwrap_or_else(|err| {
            log::error!("failed to spawn strand driver: {:?}", err);
            panic!()
        });

        Self {
            sender,
        }
    }

    /// The driver owns every coroutine bound to this strand. New arrivals
    /// are folded into a single [`FuturesUnordered`] which is polled from
    /// exactly one task, so segments of this strand are mutually exclusive
    /// by construction.
    async fn drive(mut incoming: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>, name: String) {
        log::trace!("strand {} driver entered", name);

        let mut active: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        loop {
            futures::select! {
                task = incoming.next() => match task {
                    Some(task) => active.push(task),
                    None => break,
                },
                _ = active.select_next_some() => {}
            }
        }

        // All strand handles are gone, run the queue dry before exiting.
        while active.next().await.is_some() {
        }

        log::trace!("strand {} driver exited", name);
    }

    /// Posts fire and forget work onto this strand.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.unbounded_send(task.boxed()).is_err() {
            log::warn!("task spawned onto dead strand was dropped");
        }
    }

    /// Posts work onto this strand and returns a future resolving to its
    /// result.
    ///
    /// If the strand shuts down before the task completes the returned
    /// future resolves to [`Error::AbortedError`].
    pub fn dispatch<F, T>(&self, task: F) -> impl Future<Output = Result<T, Error>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.spawn(async move {
            let _ = sender.send(task.await);
        });

        async move {
            receiver.await.map_err(|_| Error::AbortedError)
        }
    }
}

/// Declares the serial lanes of one subsystem.
pub trait StrandLanes: Copy {
    /// Number of lanes in the group.
    const COUNT: usize;

    /// Subsystem name used for thread and log labels.
    const NAME: &'static str;

    /// Index of this lane, in `0..Self::COUNT`.
    fn index(self) -> usize;
}

/// A fixed size tuple of strands, one per lane of a subsystem.
///
/// Minted by [`Scheduler::make_strands`](super::Scheduler::make_strands).
/// All strands of a group share the scheduler's worker pool.
pub struct StrandGroup<S: StrandLanes> {
    strands: Box<[Strand]>,
    _marker: PhantomData<S>,
}

impl<S: StrandLanes> StrandGroup<S> {
    pub(super) fn new(pool: &ThreadPool) -> Self {
        let strands = (0..S::COUNT)
            .map(|i| Strand::new(pool, format!("{}-{}", S::NAME, i)))
            .collect();

        Self {
            strands,
            _marker: PhantomData,
        }
    }

    pub fn get(&self, lane: S) -> &Strand {
        &self.strands[lane.index()]
    }
}

impl<S: StrandLanes> Clone for StrandGroup<S> {
    fn clone(&self) -> Self {
        Self {
            strands: self.strands.clone(),
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::executor::block_on;

    use super::*;
    use crate::scheduler::Scheduler;

    #[derive(Copy, Clone)]
    enum TestLanes {
        First,
        Second,
    }

    impl StrandLanes for TestLanes {
        const COUNT: usize = 2;
        const NAME: &'static str = "test";

        fn index(self) -> usize {
            self as usize
        }
    }

    #[test]
    fn same_lane_preserves_submission_order() {
        let scheduler = Scheduler::new(4).unwrap();
        let strands = scheduler.make_strands::<TestLanes>();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut results = Vec::new();
        for i in 0..32usize {
            let order = order.clone();
            results.push(strands.get(TestLanes::First).dispatch(async move {
                order.lock().push(i);
            }));
        }

        for result in results {
            block_on(result).unwrap();
        }

        let order = order.lock();
        assert_eq!(*order, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn lanes_are_concurrent() {
        let scheduler = Scheduler::new(4).unwrap();
        let strands = scheduler.make_strands::<TestLanes>();

        // A task on the first lane waits for the second lane to make
        // progress. If the lanes shared a serial queue this would deadlock.
        let (sender, receiver) = oneshot::channel::<()>();

        let blocked = strands.get(TestLanes::First).dispatch(async move {
            receiver.await.unwrap();
        });
        let unblocker = strands.get(TestLanes::Second).dispatch(async move {
            sender.send(()).unwrap();
        });

        block_on(unblocker).unwrap();
        block_on(blocked).unwrap();
    }

    #[test]
    fn same_lane_interleaves_at_await_points() {
        let scheduler = Scheduler::new(2).unwrap();
        let strands = scheduler.make_strands::<TestLanes>();
        let strand = strands.get(TestLanes::First);

        // The first task suspends until the second task, bound to the same
        // lane, has run. This only completes if suspended coroutines release
        // the lane.
        let (sender, receiver) = oneshot::channel::<()>();

        let waiter = strand.dispatch(async move {
            receiver.await.unwrap();
        });
        let signaller = strand.dispatch(async move {
            sender.send(()).unwrap();
        });

        block_on(signaller).unwrap();
        block_on(waiter).unwrap();
    }

    #[test]
    fn segments_are_mutually_exclusive() {
        let scheduler = Scheduler::new(4).unwrap();
        let strands = scheduler.make_strands::<TestLanes>();

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut results = Vec::new();
        for _ in 0..64 {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            results.push(strands.get(TestLanes::First).dispatch(async move {
                let active = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(active, Ordering::SeqCst);
                // Busy segment long enough for overlap to be observable.
                std::thread::yield_now();
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for result in results {
            block_on(result).unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
