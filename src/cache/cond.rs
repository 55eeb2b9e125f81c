//! Sequence-numbered change notification.
//!
//! A [`Cond`] hands out one-shot waiters. Each waiter reports the sequence it
//! has already seen; it fires as soon as the bus moves past that sequence and,
//! if it carries hints, only for notifications naming one of them.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

struct Waiter {
    tx: oneshot::Sender<u64>,
    hints: HashSet<String>,
}

impl Waiter {
    fn interested(&self, hints: &[String]) -> bool {
        self.hints.is_empty() || hints.is_empty() || hints.iter().any(|h| self.hints.contains(h))
    }
}

#[derive(Default)]
struct Inner {
    waiters: Vec<Waiter>,
    last: u64,
}

/// Notification bus shared by a cache and the streams watching it.
#[derive(Default)]
pub struct Cond {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Cond")
            .field("sequence", &inner.last)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence number. Starts at 0 and rises by one per notification.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    /// Register interest in changes after sequence `last`.
    ///
    /// If the bus is already past `last` the returned receiver resolves
    /// immediately with the current sequence. Otherwise it resolves on the
    /// first matching [`notify`](Self::notify). An empty `hints` matches
    /// every notification.
    pub fn register(&self, last: u64, hints: &[String]) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.waiters.retain(|w| !w.tx.is_closed());

        if last < inner.last {
            // The receiver is still held here, so this cannot fail.
            let _ = tx.send(inner.last);
            return rx;
        }

        inner.waiters.push(Waiter { tx, hints: hints.iter().cloned().collect() });
        rx
    }

    /// Advance the sequence and wake every waiter interested in `hints`.
    /// An empty `hints` wakes everyone.
    pub fn notify(&self, hints: &[String]) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.last += 1;
        let seq = inner.last;

        let waiters = std::mem::take(&mut inner.waiters);
        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            if waiter.interested(hints) {
                let _ = waiter.tx.send(seq);
            } else {
                inner.waiters.push(waiter);
            }
        }
    }

    /// Number of registered waiters that have not fired yet.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }
}
