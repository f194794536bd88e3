use crate::event::Event;
use crate::loom::Cell;

use core::ptr::{self, NonNull};

/// One parked thread.
///
/// Lives on the parker's stack for the duration of the park call; the
/// parker does not return until it was woken or removed itself, so queued
/// waiters are always safe to dereference under the bucket lock.
///
/// `tail`, `prng` and `times_out` are only meaningful on the head of a
/// sub-queue and travel to the new head when the old one is dequeued.
/// `tail` doubles as the queued flag: it is null exactly while the waiter
/// is not in any queue.
pub(super) struct Waiter {
    pub(super) address: Cell<usize>,
    pub(super) token: Cell<usize>,
    pub(super) root_prev: Cell<*const Waiter>,
    pub(super) root_next: Cell<*const Waiter>,
    pub(super) prev: Cell<*const Waiter>,
    pub(super) next: Cell<*const Waiter>,
    pub(super) tail: Cell<*const Waiter>,
    pub(super) prng: Cell<u16>,
    pub(super) times_out: Cell<u64>,
    wake: unsafe fn(NonNull<Waiter>),
    pub(super) event: Event,
}

impl Waiter {
    pub(super) fn new(token: usize) -> Self {
        Self {
            address: Cell::new(0),
            token: Cell::new(token),
            root_prev: Cell::new(ptr::null()),
            root_next: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
            next: Cell::new(ptr::null()),
            tail: Cell::new(ptr::null()),
            prng: Cell::new(0),
            times_out: Cell::new(0),
            wake: Self::wake_event,
            event: Event::new(),
        }
    }

    pub(super) fn is_queued(&self) -> bool {
        !self.tail.get().is_null()
    }

    /// Releases the waiter's blocking event. Called exactly once per park,
    /// never under the bucket lock.
    ///
    /// # Safety
    ///
    /// `this` must point to a waiter that was dequeued by the caller and
    /// whose parker has not returned yet.
    pub(super) unsafe fn wake(this: NonNull<Waiter>) {
        ((*this.as_ptr()).wake)(this)
    }

    unsafe fn wake_event(this: NonNull<Waiter>) {
        (*this.as_ptr()).event.notify()
    }
}

/// Eventual fairness: once per random interval of at most this many
/// nanoseconds the next dequeue on an address is marked fair.
const FAIR_INTERVAL_NS: u32 = 1_000_000;

const PRNG_TAG: usize = 0b1;

/// The per-bucket queue root.
///
/// A single word holding one of:
/// - 0: no waiters, no remembered state;
/// - a 16-bit prng seed shifted up one with the low bit set, left behind
///   when the last waiter departed;
/// - a pointer to the first sub-queue head (alignment keeps the bit free).
///
/// Sub-queue heads link to each other through `root_prev`/`root_next`;
/// waiters for one address form a FIFO through `prev`/`next`.
///
/// TODO: the per-address lookup is a linear scan of the root list; under
/// heavy address collision within one bucket a balanced tree keyed by
/// address would behave better.
pub(super) struct WaitQueue {
    root: Cell<usize>,
}

impl WaitQueue {
    #[cfg(not(loom))]
    pub(super) const fn new() -> Self {
        Self { root: Cell::new(0) }
    }

    #[cfg(loom)]
    pub(super) fn new() -> Self {
        Self { root: Cell::new(0) }
    }

    fn first_head(&self) -> *const Waiter {
        let root = self.root.get();
        if root == 0 || root & PRNG_TAG != 0 {
            ptr::null()
        } else {
            root as *const Waiter
        }
    }

    /// Installs `new_head` (or the prng sentinel) as the first root entry,
    /// carrying the fairness state across the transition.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock; `new_head` must be a valid queued
    /// sub-queue head or `None`.
    unsafe fn set_root(&self, new_head: Option<NonNull<Waiter>>) {
        let root = self.root.get();
        let (prng, times_out) = if root == 0 {
            // first use: seed from this queue's own address, forced odd so
            // the xorshift never sticks at zero
            (self as *const Self as usize as u16 | 1, 0)
        } else if root & PRNG_TAG != 0 {
            ((root >> 1) as u16, 0)
        } else {
            let head = root as *const Waiter;
            ((*head).prng.get(), (*head).times_out.get())
        };
        match new_head {
            Some(head) => {
                (*head.as_ptr()).prng.set(prng);
                (*head.as_ptr()).times_out.set(times_out);
                self.root.set(head.as_ptr() as usize);
            }
            None => self.root.set(((prng as usize) << 1) | PRNG_TAG),
        }
    }

    /// Finds the sub-queue head for `addr`, if any waiter is parked there.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock.
    pub(super) unsafe fn find_head(&self, addr: usize) -> Option<NonNull<Waiter>> {
        let mut head = self.first_head();
        while !head.is_null() {
            if (*head).address.get() == addr {
                return Some(NonNull::new_unchecked(head as *mut Waiter));
            }
            head = (*head).root_next.get();
        }
        None
    }

    /// Appends `waiter` to the FIFO for `addr`, starting a new sub-queue
    /// if the address has no parked waiters yet.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock; `waiter` must not be queued and must
    /// stay alive until dequeued.
    pub(super) unsafe fn insert(&self, addr: usize, waiter: &Waiter) {
        waiter.address.set(addr);
        waiter.next.set(ptr::null());
        waiter.prev.set(ptr::null());
        waiter.root_next.set(ptr::null());
        waiter.root_prev.set(ptr::null());
        waiter.tail.set(waiter);

        let mut head = self.first_head();
        let mut last: *const Waiter = ptr::null();
        while !head.is_null() {
            if (*head).address.get() == addr {
                let tail = (*head).tail.get();
                (*tail).next.set(waiter);
                waiter.prev.set(tail);
                (*head).tail.set(waiter);
                return;
            }
            last = head;
            head = (*head).root_next.get();
        }

        // `waiter` starts a new sub-queue
        if last.is_null() {
            self.set_root(Some(NonNull::from(waiter)));
        } else {
            (*last).root_next.set(waiter);
            waiter.root_prev.set(last);
            // fresh heads further down the root list get the same seeding
            // rule as `set_root`
            waiter.prng.set(addr as u16 | 1);
            waiter.times_out.set(0);
        }
    }

    /// Unlinks `waiter` from its FIFO and, if it was a head, from the root
    /// list. Returns whether its sub-queue still has entries.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock; `waiter` must be queued here.
    pub(super) unsafe fn remove(&self, waiter: &Waiter) -> bool {
        #[cfg(not(loom))]
        debug_assert!(waiter.is_queued());
        #[cfg(loom)]
        assert!(waiter.is_queued());

        let next = waiter.next.get();
        let has_more;

        if waiter.prev.get().is_null() {
            // `waiter` heads its sub-queue
            let root_prev = waiter.root_prev.get();
            let root_next = waiter.root_next.get();
            if !next.is_null() {
                // promote the successor, moving the head-only state over
                (*next).prev.set(ptr::null());
                (*next).tail.set(waiter.tail.get());
                (*next).prng.set(waiter.prng.get());
                (*next).times_out.set(waiter.times_out.get());

                (*next).root_prev.set(root_prev);
                (*next).root_next.set(root_next);
                if root_prev.is_null() {
                    self.root.set(next as usize);
                } else {
                    (*root_prev).root_next.set(next);
                }
                if !root_next.is_null() {
                    (*root_next).root_prev.set(next);
                }
                has_more = true;
            } else {
                // the sub-queue dies with its head
                if root_prev.is_null() {
                    // preserves the prng seed in the root word
                    self.set_root(NonNull::new(root_next as *mut Waiter));
                    if !root_next.is_null() {
                        (*root_next).root_prev.set(ptr::null());
                    }
                } else {
                    (*root_prev).root_next.set(root_next);
                    if !root_next.is_null() {
                        (*root_next).root_prev.set(root_prev);
                    }
                }
                has_more = false;
            }
        } else {
            // middle or tail of the FIFO
            let prev = waiter.prev.get();
            (*prev).next.set(next);
            if next.is_null() {
                let head = self.find_head(waiter.address.get());
                #[cfg(not(loom))]
                debug_assert!(head.is_some());
                if let Some(head) = head {
                    (*head.as_ptr()).tail.set(prev);
                }
            } else {
                (*next).prev.set(prev);
            }
            has_more = true;
        }

        waiter.tail.set(ptr::null());
        waiter.next.set(ptr::null());
        waiter.prev.set(ptr::null());
        waiter.root_next.set(ptr::null());
        waiter.root_prev.set(ptr::null());
        has_more
    }

    /// Detaches the whole sub-queue for `addr`, marking every waiter
    /// dequeued but keeping the `next` links so the caller can walk the
    /// chain after releasing the bucket lock.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock.
    pub(super) unsafe fn drain(&self, addr: usize) -> Option<NonNull<Waiter>> {
        let head = self.find_head(addr)?;
        let head_ptr = head.as_ptr() as *const Waiter;

        let root_prev = (*head_ptr).root_prev.get();
        let root_next = (*head_ptr).root_next.get();
        if root_prev.is_null() {
            self.set_root(NonNull::new(root_next as *mut Waiter));
            if !root_next.is_null() {
                (*root_next).root_prev.set(ptr::null());
            }
        } else {
            (*root_prev).root_next.set(root_next);
            if !root_next.is_null() {
                (*root_next).root_prev.set(root_prev);
            }
        }
        (*head_ptr).root_prev.set(ptr::null());
        (*head_ptr).root_next.set(ptr::null());

        let mut current = head_ptr;
        while !current.is_null() {
            (*current).tail.set(ptr::null());
            current = (*current).next.get();
        }
        Some(head)
    }

    /// Decides whether the next dequeue on `head`'s sub-queue should be
    /// handed off fairly, rearming the random deadline when it fires.
    ///
    /// # Safety
    ///
    /// Must run under the bucket lock; `head` must be a queued sub-queue
    /// head.
    pub(super) unsafe fn should_be_fair(&self, head: NonNull<Waiter>, now: u64) -> bool {
        let head = head.as_ptr() as *const Waiter;
        if now < (*head).times_out.get() {
            return false;
        }
        let mut prng = (*head).prng.get();
        let hi = xorshift16(&mut prng);
        let lo = xorshift16(&mut prng);
        (*head).prng.set(prng);

        let rand = (hi as u32) << 16 | lo as u32;
        (*head).times_out.set(now + (rand % FAIR_INTERVAL_NS) as u64);
        true
    }
}

fn xorshift16(state: &mut u16) -> u16 {
    let mut x = *state;
    x ^= x << 7;
    x ^= x >> 9;
    x ^= x << 8;
    *state = x;
    x
}
