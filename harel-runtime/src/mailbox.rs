//! External event queue.
//!
//! Any thread may push. Exactly one caller at a time drains: the first one
//! to claim the draining flag processes envelopes until the queue is empty,
//! everyone else just enqueues and returns. After releasing the flag the
//! drainer checks the queue once more, so an envelope pushed between the
//! last pop and the release is never stranded.

use harel_core::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where an event came from.
///
/// Service and timer origins carry the generation they were created with;
/// the interpreter discards them at dequeue if that generation is no longer
/// live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Boot marker queued by `start`; always processed first.
    Start,
    /// Sent by a caller of the public API, or by the machine to itself.
    External,
    /// Sent by an invoked service.
    Service { id: String, generation: u64 },
    /// A delayed send that fired.
    Timer { send_id: String, generation: u64 },
}

/// An event plus its origin tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: Event,
    pub origin: Origin,
}

impl Envelope {
    pub fn external(event: Event) -> Self {
        Self {
            event,
            origin: Origin::External,
        }
    }
}

#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    draining: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }

    /// Queues ahead of everything already waiting.
    pub fn push_front(&self, envelope: Envelope) {
        self.queue.lock().push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drops every queued envelope.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Hands queued envelopes to `handle` one at a time, unless another
    /// caller is already draining.
    ///
    /// `handle` may push further envelopes; they are processed in the same
    /// drain. Returns the number of envelopes handled by this call.
    pub fn drain(&self, mut handle: impl FnMut(Envelope)) -> usize {
        let mut handled = 0;
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return handled;
            }

            loop {
                // The lock is released before `handle` runs.
                let next = self.queue.lock().pop_front();
                match next {
                    Some(envelope) => {
                        handle(envelope);
                        handled += 1;
                    }
                    None => break,
                }
            }

            self.draining.store(false, Ordering::Release);
            if self.is_empty() {
                return handled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn env(name: &str) -> Envelope {
        Envelope::external(Event::new(name))
    }

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        mailbox.push(env("A"));
        mailbox.push(env("B"));
        mailbox.push(env("C"));

        let mut seen = Vec::new();
        let handled = mailbox.drain(|e| seen.push(e.event.name));
        assert_eq!(handled, 3);
        assert_eq!(seen, vec!["A", "B", "C"]);
        assert!(mailbox.is_empty());
        assert!(!mailbox.is_draining());
    }

    #[test]
    fn test_reentrant_push_is_processed_in_same_drain() {
        let mailbox = Mailbox::new();
        mailbox.push(env("first"));

        let mut seen = Vec::new();
        mailbox.drain(|e| {
            if e.event.name == "first" {
                mailbox.push(env("second"));
                // Nested drain attempts only enqueue.
                assert_eq!(mailbox.drain(|_| unreachable!()), 0);
            }
            seen.push(e.event.name);
        });
        assert_eq!(seen, vec!["first", "second"]);
    }

    #[test]
    fn test_push_front_jumps_queue() {
        let mailbox = Mailbox::new();
        mailbox.push(env("deferred"));
        mailbox.push_front(Envelope {
            event: Event::init(),
            origin: Origin::Start,
        });

        let mut seen = Vec::new();
        mailbox.drain(|e| seen.push(e.origin));
        assert_eq!(seen, vec![Origin::Start, Origin::External]);
    }

    #[test]
    fn test_clear() {
        let mailbox = Mailbox::new();
        mailbox.push(env("A"));
        mailbox.push(env("B"));
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.clear(), 2);
        assert_eq!(mailbox.drain(|_| {}), 0);
    }

    #[test]
    fn test_concurrent_senders_never_overlap() {
        let mailbox = Arc::new(Mailbox::new());
        let busy = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let mailbox = Arc::clone(&mailbox);
                let busy = Arc::clone(&busy);
                let handled = Arc::clone(&handled);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        mailbox.push(env(&format!("t{}-{}", t, i)));
                        mailbox.drain(|_| {
                            assert!(!busy.swap(true, Ordering::SeqCst), "overlapping drains");
                            handled.fetch_add(1, Ordering::SeqCst);
                            busy.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(handled.load(Ordering::SeqCst), 8 * 200);
        assert!(mailbox.is_empty());
    }
}
