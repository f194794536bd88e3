use crate::loom::{Condvar, Mutex};

#[cfg(not(loom))]
use crate::clock::nanotime;
#[cfg(not(loom))]
use core::time::Duration;

/// A one-shot blocking event.
///
/// `notify` is sticky: once signalled, every `wait` returns immediately.
/// This is what lets a parker that lost the timeout race block a second
/// time and still be guaranteed to complete.
pub(crate) struct Event {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until notified or until `deadline` (in [`nanotime`] units)
    /// passes; returns `false` only on timeout.
    ///
    /// `before_sleep` runs exactly once, before this call can block. The
    /// parking lot drops the bucket lock there, so an unparker that
    /// dequeued this waiter can always reach `notify`.
    pub(crate) fn wait(&self, deadline: Option<u64>, before_sleep: impl FnOnce()) -> bool {
        before_sleep();

        /* # Note
         *
         * The only points that may panic are `Mutex::lock()`,
         * `Condvar::wait()` and `Condvar::notify_one()`, and they are
         * never called reentrantly, so a panic here is a system error.
         * `std::sync::{Condvar, Mutex}` currently only check for those
         * in debug.
         */
        let mut notified = self.notified.lock().unwrap();
        loop {
            if *notified {
                return true;
            }
            #[cfg(loom)]
            {
                // loom does not model time; model tests never pass a
                // deadline, so an infinite wait is equivalent
                let _ = deadline;
                notified = self.condvar.wait(notified).unwrap();
            }
            #[cfg(not(loom))]
            match deadline {
                None => notified = self.condvar.wait(notified).unwrap(),
                Some(deadline) => {
                    let now = nanotime();
                    if now >= deadline {
                        return false;
                    }
                    let timeout = Duration::from_nanos(deadline - now);
                    notified = self.condvar.wait_timeout(notified, timeout).unwrap().0;
                }
            }
        }
    }

    pub(crate) fn notify(&self) {
        // See note in `wait`.
        let mut notified = self.notified.lock().unwrap();
        if !*notified {
            *notified = true;
            self.condvar.notify_one();
        }
        /* The waiter may be destroyed as soon as the guard drops:
         * `wait` cannot return before this thread releases the mutex.
         */
    }
}

#[cfg(all(test, loom))]
mod tests {
    use super::Event;
    use loom::cell::Cell;
    use std::sync::Arc;

    #[test]
    fn keeps_notify() {
        loom::model(|| {
            let event = Event::new();
            event.notify();
            assert!(event.wait(None, || {}));
        });
    }

    #[test]
    fn synchronises_one() {
        loom::model(|| {
            loom::lazy_static! {
                static ref WROTE: Cell<bool> = Cell::new(false);
            }
            let event = Arc::new(Event::new());
            {
                let event = event.clone();
                loom::thread::spawn(move || {
                    WROTE.set(true);
                    event.notify();
                });
            }
            assert!(event.wait(None, || {}));
            assert!(WROTE.get());
        });
    }

    #[test]
    fn runs_prologue_before_blocking() {
        loom::model(|| {
            let event = Arc::new(Event::new());
            let prologue_ran = Cell::new(false);
            {
                let event = event.clone();
                loom::thread::spawn(move || event.notify());
            }
            assert!(event.wait(None, || prologue_ran.set(true)));
            assert!(prologue_ran.get());
        });
    }
}
