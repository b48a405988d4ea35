//! Timer sources for delayed sends.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::warn;

/// Work run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules delayed work.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Runs `task` once `delay` has elapsed, unless the handle is canceled first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancellation handle of a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Cancels the timer. A task that has not started yet never runs.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Wall-clock timers backed by `tokio::time`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "no tokio runtime; delayed send dropped");
                cancelled.store(true, Ordering::Release);
                return TimerHandle::new(cancelled, None);
            }
        };

        let flag = Arc::clone(&cancelled);
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

struct Pending {
    task: TimerTask,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct SimState {
    now: Duration,
    seq: u64,
    pending: BTreeMap<(Duration, u64), Pending>,
}

/// A clock that only moves when told to.
///
/// Due timers run on the thread calling [`SimulatedClock::advance`], in
/// deadline order (ties in scheduling order).
#[derive(Default)]
pub struct SimulatedClock {
    state: Mutex<SimState>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `by`, running every timer that becomes due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            let next = {
                let mut state = self.state.lock();
                let key = match state.pending.keys().next() {
                    Some(key) if key.0 <= target => *key,
                    _ => break,
                };
                state.now = key.0;
                state.pending.remove(&key)
            };
            // Run outside the lock; tasks may schedule further timers.
            if let Some(pending) = next {
                if !pending.cancelled.load(Ordering::Acquire) {
                    (pending.task)();
                }
            }
        }
        self.state.lock().now = target;
    }

    /// Number of timers scheduled and not canceled.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|p| !p.cancelled.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for SimulatedClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedClock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let key = (state.now + delay, state.seq);
        state.seq += 1;
        state.pending.insert(
            key,
            Pending {
                task,
                cancelled: Arc::clone(&cancelled),
            },
        );
        TimerHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> TimerTask) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> TimerTask {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(label))
        };
        (log, make)
    }

    #[test]
    fn test_simulated_runs_in_deadline_order() {
        let clock = SimulatedClock::new();
        let (log, task) = recorder();
        clock.schedule(Duration::from_millis(30), task("c"));
        clock.schedule(Duration::from_millis(10), task("a"));
        clock.schedule(Duration::from_millis(10), task("b"));

        clock.advance(Duration::from_millis(9));
        assert!(log.lock().is_empty());
        assert_eq!(clock.pending(), 3);

        clock.advance(Duration::from_millis(25));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(clock.now(), Duration::from_millis(34));
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_simulated_cancel() {
        let clock = SimulatedClock::new();
        let (log, task) = recorder();
        let handle = clock.schedule(Duration::from_millis(5), task("never"));
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(clock.pending(), 0);

        clock.advance(Duration::from_secs(1));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_simulated_nested_schedule() {
        let clock = Arc::new(SimulatedClock::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_clock = Arc::clone(&clock);
        let inner_count = Arc::clone(&count);
        clock.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let c = Arc::clone(&inner_count);
                inner_clock.schedule(
                    Duration::from_millis(10),
                    Box::new(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        // The follow-up timer falls inside the same advance window.
        clock.advance(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tokio_clock_fires_and_cancels() {
        let clock = TokioClock::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let fired = tx.clone();
        clock.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = fired.send("fired");
            }),
        );
        let canceled = tx.clone();
        let handle = clock.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = canceled.send("canceled");
            }),
        );
        handle.cancel();
        drop(tx);

        assert_eq!(rx.recv().await, Some("fired"));
        assert_eq!(rx.recv().await, None);
    }
}
