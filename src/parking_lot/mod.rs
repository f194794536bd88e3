mod wait_queue;

use crate::clock::nanotime;
use crate::loom::{Mutex, MutexGuard};
use wait_queue::{WaitQueue, Waiter};

use core::ptr::NonNull;

#[cfg(not(loom))]
// 256 buckets keeps per-bucket address collision low enough that the
// linear root-list scan stays cheap.
const BUCKET_BITS: usize = 8;
#[cfg(loom)]
// Reduce load for loom
const BUCKET_BITS: usize = 2;

const BUCKET_COUNT: usize = 1 << BUCKET_BITS;

/// The token a parked thread receives when the unparker has nothing
/// better to say.
pub const DEFAULT_TOKEN: usize = 0;

/// What ended a [`park`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParkResult {
    /// An unparker dequeued this thread; carries the unparker's token.
    Unparked(usize),
    /// The validation callback declined to park.
    Invalidated,
    /// The deadline passed without an unpark.
    TimedOut,
}

/// What [`unpark_one`] found, handed to its callback under the bucket lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnparkResult {
    /// The dequeued waiter's park token, or `None` if the address had no
    /// waiters.
    pub token: Option<usize>,
    /// Whether the dequeue fired the eventually-fair hand-off, in which
    /// case the caller should give the waiter the slot instead of letting
    /// new arrivals barge.
    pub be_fair: bool,
    /// Whether more waiters remain parked on the address.
    pub has_more: bool,
}

/* Cache line sizes from crossbeam (https://crates.io/crates/crossbeam):
 * x86_64 prefetches line pairs, and the big cores of big.LITTLE arm64
 * use 128-byte lines; s390x uses 256. Everything else gets 64.
 */
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "s390x",
    )),
    repr(align(64))
)]
struct Bucket {
    queue: WaitQueue,
}

impl Bucket {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }
}

fn lock_bucket(addr: usize) -> MutexGuard<'static, Bucket> {
    struct Hashtable {
        buckets: [Mutex<Bucket>; BUCKET_COUNT],
    }

    impl Hashtable {
        #[cfg(not(loom))]
        const fn new() -> Self {
            const INIT: Mutex<Bucket> = Mutex::new(Bucket::new());
            Self {
                buckets: [INIT; BUCKET_COUNT],
            }
        }

        #[cfg(loom)]
        fn new() -> Self {
            Self {
                buckets: core::array::from_fn(|_| Mutex::new(Bucket::new())),
            }
        }

        #[inline]
        fn lock_bucket(&self, addr: usize) -> MutexGuard<'_, Bucket> {
            let idx = Self::hash(addr);
            //SAFETY: guaranteed by the hash function
            unsafe {
                #[cfg(not(loom))]
                debug_assert!(idx < BUCKET_COUNT);
                #[cfg(loom)]
                assert!(idx < BUCKET_COUNT);
                self.buckets.get_unchecked(idx)
            }
            .lock()
            .unwrap()
        }

        /* loom tests with checkpoints, can't rely on
         * addresses, and this allows tests to write
         * small integers to select buckets.
         */
        #[cfg(loom)]
        fn hash(n: usize) -> usize {
            n & (BUCKET_COUNT - 1)
        }

        #[cfg(not(loom))]
        fn hash(n: usize) -> usize {
            #[cfg(target_pointer_width = "64")]
            return n.wrapping_mul(0x9E3779B97F4A7C15) >> (64 - BUCKET_BITS);
            #[cfg(target_pointer_width = "32")]
            return n.wrapping_mul(0x9E3779B9) >> (32 - BUCKET_BITS);
        }
    }

    #[cfg(not(loom))]
    static HASHTABLE: Hashtable = Hashtable::new();
    #[cfg(loom)]
    loom::lazy_static! {
        static ref HASHTABLE: Hashtable = Hashtable::new();
    }
    HASHTABLE.lock_bucket(addr)
}

/// Parks the current thread on `addr` until unparked, or until `deadline`
/// (in [`nanotime`](crate::nanotime) units) passes.
///
/// `validate` runs under the bucket lock: returning `None` aborts with
/// [`ParkResult::Invalidated`] before anything is queued, and a `Some`
/// park token is published atomically with the insertion, so an unpark on
/// `addr` after `validate` decided to park cannot be lost.
///
/// `before_sleep` runs after the insertion, right before the bucket lock
/// is released; `timed_out` runs under the re-acquired lock if the
/// deadline passed and the waiter was still queued, with the park token
/// and whether the address still has waiters.
///
/// A timeout that races with an unpark is unobservable: if the unparker
/// already dequeued this thread the call reports
/// [`ParkResult::Unparked`] with the unparker's token.
///
/// # Safety
///
/// None of the three callbacks may call into the parking lot, and `addr`
/// must not be parked on recursively from `before_sleep`.
pub unsafe fn park(
    addr: usize,
    validate: impl FnOnce() -> Option<usize>,
    before_sleep: impl FnOnce(),
    timed_out: impl FnOnce(usize, bool),
    deadline: Option<u64>,
) -> ParkResult {
    let bucket = lock_bucket(addr);
    let token = match validate() {
        Some(token) => token,
        None => return ParkResult::Invalidated,
    };

    let waiter = Waiter::new(token);
    bucket.queue.insert(addr, &waiter);

    // `before_sleep` and the lock release both happen in the event's
    // prologue; from the release on an unparker may dequeue the waiter
    let notified = waiter.event.wait(deadline, move || {
        before_sleep();
        drop(bucket);
    });
    if notified {
        return ParkResult::Unparked(waiter.token.get());
    }

    let bucket = lock_bucket(addr);
    if waiter.is_queued() {
        let has_more = bucket.queue.remove(&waiter);
        timed_out(waiter.token.get(), has_more);
        drop(bucket);
        return ParkResult::TimedOut;
    }
    drop(bucket);

    /* An unparker won the race and already took this waiter off the
     * queue, so its wake is on the way: this wait always completes.
     */
    waiter.event.wait(None, || {});
    ParkResult::Unparked(waiter.token.get())
}

/// Wakes the oldest thread [`parked`](park) on `addr`.
///
/// `callback` runs under the bucket lock with the dequeue already done,
/// which lets the caller transfer ownership of whatever `addr` guards
/// atomically with the wake; its return value is the token the woken
/// thread receives. The thread itself is woken after the lock is
/// released.
///
/// If no thread is waiting on `addr` the callback still runs (with
/// `token: None`), but it still requires locking, so it's not
/// recommended to call it without reason.
pub fn unpark_one(addr: usize, callback: impl FnOnce(UnparkResult) -> usize) -> UnparkResult {
    let bucket = lock_bucket(addr);
    let mut result = UnparkResult {
        token: None,
        be_fair: false,
        has_more: false,
    };

    /*SAFETY:
     * - the bucket lock is held for every queue access;
     * - queued waiters outlive their dequeue (the parker can't return
     *   before `wake`).
     */
    let waiter = unsafe {
        let waiter = bucket.queue.find_head(addr);
        if let Some(head) = waiter {
            // fairness is decided before `remove` rotates the head state
            result.be_fair = bucket.queue.should_be_fair(head, nanotime());
            result.has_more = bucket.queue.remove(head.as_ref());
            result.token = Some(head.as_ref().token.get());
        }
        waiter
    };

    let unpark_token = callback(result);

    match waiter {
        Some(head) => unsafe {
            (*head.as_ptr()).token.set(unpark_token);
            // the thread to wake has been unlinked, release the lock
            drop(bucket);
            Waiter::wake(head);
        },
        None => drop(bucket),
    }
    result
}

/// Wakes every thread [`parked`](park) on `addr`, returning how many
/// were woken.
///
/// Each thread keeps its park token. The queue is detached in one
/// critical section and the wakes happen outside the lock.
pub fn unpark_all(addr: usize) -> usize {
    let bucket = lock_bucket(addr);
    //SAFETY: the bucket lock is held.
    let head = unsafe { bucket.queue.drain(addr) };
    drop(bucket);

    let Some(head) = head else { return 0 };

    let mut woken = 0;
    let mut current = head.as_ptr() as *const Waiter;
    while !current.is_null() {
        /*SAFETY:
         * - the drained waiters are dequeued but their parkers can't
         *   return before `wake`;
         * - `next` is read first: after `wake` the waiter may be
         *   destroyed, but it's no longer accessed.
         */
        unsafe {
            let next = (*current).next.get();
            Waiter::wake(NonNull::new_unchecked(current as *mut Waiter));
            current = next;
        }
        woken += 1;
    }
    woken
}
