//! Deadline timer backing the polling waits of the engine.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    waker: oneshot::Sender<()>,
}

// Ordered inverted so the BinaryHeap pops the earliest deadline first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.sequence).cmp(&(self.deadline, self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_sequence: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
}

/// A single thread servicing deadline wakeups.
///
/// Strand coroutines poll slow conditions (fences, in flight loads) on a
/// short fixed interval instead of blocking a worker thread. All of those
/// sleeps funnel through this one thread.
pub(super) struct Timer {
    thread: Option<JoinHandle<()>>,
    shared: Arc<TimerShared>,
}

impl Timer {
    pub(super) fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            signal: Condvar::new(),
        });

        let cloned_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || Self::run(cloned_shared))
            .unwrap_or_else(|err| {
                log::error!("failed to spawn timer thread: {:?}", err);
                panic!()
            });

        Self {
            thread: Some(thread),
            shared,
        }
    }

    /// Returns a future that completes once `duration` has elapsed.
    pub(super) fn sleep(&self, duration: Duration) -> Sleep {
        let (sender, receiver) = oneshot::channel();

        let mut state = self.shared.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + duration,
            sequence,
            waker: sender,
        });
        drop(state);

        self.shared.signal.notify_one();

        Sleep {
            receiver,
        }
    }

    fn run(shared: Arc<TimerShared>) {
        log::trace!("timer thread entered");

        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                // Complete every outstanding sleep so shutdown never hangs
                // on a polling coroutine.
                for entry in state.heap.drain() {
                    let _ = entry.waker.send(());
                }
                break;
            }

            let now = Instant::now();
            match state.heap.peek() {
                None => {
                    shared.signal.wait(&mut state);
                }
                Some(entry) if entry.deadline <= now => {
                    let entry = state.heap.pop().unwrap();
                    // The receiver may already be gone, that is fine.
                    let _ = entry.waker.send(());
                }
                Some(entry) => {
                    let deadline = entry.deadline;
                    shared.signal.wait_until(&mut state, deadline);
                }
            }
        }

        log::trace!("timer thread exited");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.signal.notify_one();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap_or_else(|_| {
                log::error!("timer thread panicked");
            });
        }
    }
}

/// Future returned by [`Scheduler::sleep`](super::Scheduler::sleep).
pub struct Sleep {
    receiver: oneshot::Receiver<()>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A cancelled sender means the timer shut down. Completing early is
        // the right behaviour for a polling sleep.
        Pin::new(&mut self.receiver).poll(cx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn sleep_elapses() {
        let timer = Timer::new();

        let start = Instant::now();
        block_on(timer.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleeps_complete_out_of_submission_order() {
        let timer = Timer::new();

        let long = timer.sleep(Duration::from_millis(50));
        let short = timer.sleep(Duration::from_millis(5));

        let start = Instant::now();
        block_on(short);
        assert!(start.elapsed() < Duration::from_millis(50));
        block_on(long);
    }

    #[test]
    fn shutdown_completes_pending_sleeps() {
        let timer = Timer::new();
        let sleep = timer.sleep(Duration::from_secs(3600));
        drop(timer);

        // Must complete immediately instead of waiting for the deadline.
        block_on(sleep);
    }
}
