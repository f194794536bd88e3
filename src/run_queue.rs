use crate::loom::{AtomicPtr, AtomicUsize};
use crate::task::{Batch, Task};

use core::hint::spin_loop;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

#[cfg(not(loom))]
pub(crate) const CAPACITY: usize = 256;
// Shrink the buffer for loom so models explore wrap and overflow.
#[cfg(loom)]
pub(crate) const CAPACITY: usize = 4;

// slot index = position % CAPACITY
const _: () = assert!(CAPACITY.is_power_of_two());

/// The per-worker bounded FIFO.
///
/// Single producer (the owning worker), many consumers (the owner pops,
/// other workers steal). `head` and `tail` are free-running positions;
/// occupancy is their wrapping difference, so the indices surviving a
/// `usize` wrap is part of the contract.
pub(crate) struct Bounded {
    head: AtomicUsize,
    tail: AtomicUsize,
    buffer: [AtomicPtr<Task>; CAPACITY],
}

impl Bounded {
    pub(crate) fn new() -> Self {
        Self::with_positions(0)
    }

    fn with_positions(start: usize) -> Self {
        Self {
            head: AtomicUsize::new(start),
            tail: AtomicUsize::new(start),
            buffer: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Owner-side push. Returns the overflow (half of the buffer plus
    /// whatever of `batch` didn't fit) when the ring is full; the caller
    /// forwards it to its unbounded queue.
    ///
    /// # Safety
    ///
    /// Only the owning worker may call this, and the batch's tasks must be
    /// valid.
    pub(crate) unsafe fn push(&self, mut batch: Batch) -> Option<Batch> {
        let mut head = self.head.load(Relaxed);
        // this is the only thread that writes `tail`
        let mut tail = self.tail.load(Relaxed);
        loop {
            if batch.is_empty() {
                return None;
            }

            let size = tail.wrapping_sub(head);
            if size < CAPACITY {
                let mut free = CAPACITY - size;
                while free > 0 {
                    let Some(task) = batch.pop() else { break };
                    self.buffer[tail % CAPACITY].store(task.as_ptr(), Relaxed);
                    tail = tail.wrapping_add(1);
                    free -= 1;
                }
                // publishes the slot stores to stealers
                self.tail.store(tail, Release);
                if batch.is_empty() {
                    return None;
                }
                head = self.head.load(Relaxed);
                continue;
            }

            // full: migrate half of the buffer out in one claim; acquire
            // so the slot reads below see stealers' progress
            const MIGRATE: usize = CAPACITY / 2;
            match self.head.compare_exchange(
                head,
                head.wrapping_add(MIGRATE),
                Acquire,
                Relaxed,
            ) {
                Err(updated) => head = updated,
                Ok(_) => {
                    let mut overflow = Batch::new();
                    for offset in 0..MIGRATE {
                        let task = self.buffer[head.wrapping_add(offset) % CAPACITY].load(Relaxed);
                        overflow.push(NonNull::new_unchecked(task));
                    }
                    overflow.push(batch);
                    return Some(overflow);
                }
            }
        }
    }

    /// Owner-side pop from the front.
    pub(crate) fn pop(&self) -> Option<NonNull<Task>> {
        let mut head = self.head.load(Relaxed);
        loop {
            // the owner is the only `tail` writer
            let tail = self.tail.load(Relaxed);
            if head == tail {
                return None;
            }
            match self
                .head
                .compare_exchange(head, head.wrapping_add(1), Acquire, Relaxed)
            {
                Ok(_) => {
                    let task = self.buffer[head % CAPACITY].load(Relaxed);
                    //SAFETY: the claimed slot was written before `tail`
                    // covered it and only this thread can overwrite it.
                    return Some(unsafe { NonNull::new_unchecked(task) });
                }
                Err(updated) => head = updated,
            }
        }
    }

    /// Copies half of `src`'s tasks into this (owned, mostly empty)
    /// buffer, committing with a CAS on `src.head`. The first stolen task
    /// skips the buffer and is returned directly.
    pub(crate) fn steal_bounded(&self, src: &Bounded) -> Option<NonNull<Task>> {
        loop {
            let src_head = src.head.load(Acquire);
            let src_tail = src.tail.load(Acquire);

            let size = src_tail.wrapping_sub(src_head);
            let mut take = size.wrapping_sub(size / 2);
            if take == 0 || take > CAPACITY {
                // empty, or the head moved between the loads; the stale
                // size can't commit anyway
                return None;
            }
            take = take.min(CAPACITY / 2);

            // owner side of our own indices
            let dst_tail = self.tail.load(Relaxed);
            let dst_head = self.head.load(Relaxed);
            let free = CAPACITY - dst_tail.wrapping_sub(dst_head);
            take = take.min(free + 1);

            let first = src.buffer[src_head % CAPACITY].load(Relaxed);
            for offset in 1..take {
                let task = src.buffer[src_head.wrapping_add(offset) % CAPACITY].load(Relaxed);
                self.buffer[dst_tail.wrapping_add(offset - 1) % CAPACITY].store(task, Relaxed);
            }

            /* The slot reads above may observe values a racing stealer or
             * the producer already replaced; the CAS below only succeeds
             * when the whole range was still ours, and a failure discards
             * the copies.
             */
            match src.head.compare_exchange(
                src_head,
                src_head.wrapping_add(take),
                AcqRel,
                Relaxed,
            ) {
                Ok(_) => {
                    if take > 1 {
                        self.tail.store(dst_tail.wrapping_add(take - 1), Release);
                    }
                    //SAFETY: the committed range was fully published by
                    // the producer before `tail` covered it.
                    return Some(unsafe { NonNull::new_unchecked(first) });
                }
                Err(_) => spin_loop(),
            }
        }
    }

    /// Drains `src` into this (owned) buffer under its single-consumer
    /// token, returning the first task popped.
    pub(crate) fn steal_unbounded(&self, src: &Unbounded) -> Option<NonNull<Task>> {
        let mut consumer = src.try_acquire_consumer()?;
        let first = consumer.pop();
        if first.is_some() {
            let dst_head = self.head.load(Relaxed);
            let mut dst_tail = self.tail.load(Relaxed);
            let mut free = CAPACITY - dst_tail.wrapping_sub(dst_head);
            while free > 0 {
                let Some(task) = consumer.pop() else { break };
                self.buffer[dst_tail % CAPACITY].store(task.as_ptr(), Relaxed);
                dst_tail = dst_tail.wrapping_add(1);
                free -= 1;
            }
            self.tail.store(dst_tail, Release);
        }
        first
    }
}

const CONSUMER_BIT: usize = 0b1;

/// An MPSC intrusive list with an embedded stub node and at most one
/// consumer at a time, enforced by a bit inside `head`.
///
/// `tail` is the producer side; `head` packs the consumer's resume point
/// with the consumer bit (0 stands in for the stub so construction needs
/// no self-reference).
pub(crate) struct Unbounded {
    head: AtomicUsize,
    tail: AtomicPtr<Task>,
    stub: Task,
}

impl Unbounded {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicPtr::new(ptr::null_mut()),
            stub: Task::stub(),
        }
    }

    fn stub_ptr(&self) -> *mut Task {
        &self.stub as *const Task as *mut Task
    }

    /// Splices a batch onto the producer side. Callable from any thread.
    ///
    /// # Safety
    ///
    /// The batch's tasks must stay valid until popped.
    pub(crate) unsafe fn push(&self, batch: Batch) {
        let Some((batch_head, batch_tail)) = batch.into_raw() else {
            return;
        };
        (*batch_tail.as_ptr()).next.store(ptr::null_mut(), Relaxed);
        let prev = self.tail.swap(batch_tail.as_ptr(), AcqRel);
        let prev = if prev.is_null() { self.stub_ptr() } else { prev };
        // links the batch in; the consumer's `next` loads acquire this
        (*prev).next.store(batch_head.as_ptr(), Release);
    }

    /// Claims the consumer side. Fails if another consumer holds it or
    /// the queue is observably empty.
    pub(crate) fn try_acquire_consumer(&self) -> Option<Consumer<'_>> {
        let mut head = self.head.load(Relaxed);
        loop {
            if head & CONSUMER_BIT != 0 {
                return None;
            }
            if head == 0 || head == self.stub_ptr() as usize {
                let tail = self.tail.load(Acquire);
                if tail.is_null() || tail == self.stub_ptr() {
                    return None;
                }
            }
            match self
                .head
                .compare_exchange(head, head | CONSUMER_BIT, Acquire, Relaxed)
            {
                Ok(_) => {
                    let resume = if head == 0 {
                        self.stub_ptr()
                    } else {
                        head as *mut Task
                    };
                    return Some(Consumer {
                        queue: self,
                        head: resume,
                    });
                }
                Err(updated) => head = updated,
            }
        }
    }
}

/// The exclusive consumer handle; releases the token on drop.
pub(crate) struct Consumer<'a> {
    queue: &'a Unbounded,
    head: *mut Task,
}

impl Consumer<'_> {
    /// Pops the next task; `None` means drained (or a producer is mid-push
    /// and its link will land shortly).
    pub(crate) fn pop(&mut self) -> Option<NonNull<Task>> {
        /*SAFETY: the consumer bit makes this the only thread walking
         * `next` links, and queued tasks are valid until popped. A task is
         * only handed out once fully detached: either its successor is
         * linked, or the stub was swapped in behind it.
         */
        unsafe {
            let stub = self.queue.stub_ptr();
            let mut head = self.head;
            if head == stub {
                let next = (*head).next.load(Acquire);
                if next.is_null() {
                    return None;
                }
                self.head = next;
                head = next;
            }

            let next = (*head).next.load(Acquire);
            if !next.is_null() {
                self.head = next;
                return Some(NonNull::new_unchecked(head));
            }

            let tail = self.queue.tail.load(Acquire);
            if head != tail {
                // a producer swapped `tail` but hasn't linked yet
                return None;
            }

            // re-push the stub so the final task can be detached
            (*stub).next.store(ptr::null_mut(), Relaxed);
            let prev = self.queue.tail.swap(stub, AcqRel);
            (*prev).next.store(stub, Release);

            let next = (*head).next.load(Acquire);
            if next.is_null() {
                // lost a race with a producer; its link lands after ours
                return None;
            }
            self.head = next;
            Some(NonNull::new_unchecked(head))
        }
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        // publishes the resume point and clears the consumer bit
        self.queue.head.store(self.head as usize, Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::{Bounded, Unbounded, CAPACITY};
    use crate::task::{Batch, Task};
    use core::ptr::NonNull;

    fn noop(_: NonNull<Task>, _: &crate::pool::Worker) {}

    fn make_tasks(n: usize) -> Vec<Task> {
        (0..n).map(|_| Task::from_callback(noop)).collect()
    }

    fn batch_of(tasks: &[Task]) -> Batch {
        let mut batch = Batch::new();
        for task in tasks {
            unsafe { batch.push(NonNull::from(task)) };
        }
        batch
    }

    #[test]
    fn push_pop_in_order() {
        let queue = Bounded::new();
        let tasks = make_tasks(8);
        assert!(unsafe { queue.push(batch_of(&tasks)) }.is_none());
        for expected in &tasks {
            let got = queue.pop().unwrap();
            assert!(core::ptr::eq(got.as_ptr(), expected));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn full_push_migrates_half() {
        let queue = Bounded::new();
        let tasks = make_tasks(2 * CAPACITY);
        let overflow = unsafe { queue.push(batch_of(&tasks)) };

        // half of the buffer plus everything that never fit
        let mut overflow = overflow.unwrap();
        let mut spilled = 0;
        while overflow.pop().is_some() {
            spilled += 1;
        }
        assert_eq!(spilled, CAPACITY / 2 + CAPACITY);

        let mut kept = 0;
        while queue.pop().is_some() {
            kept += 1;
        }
        assert_eq!(kept, CAPACITY / 2);
    }

    #[test]
    fn indices_wrap_around() {
        let queue = Bounded::with_positions(usize::MAX - 2);
        let tasks = make_tasks(6);
        assert!(unsafe { queue.push(batch_of(&tasks)) }.is_none());
        for expected in &tasks {
            let got = queue.pop().unwrap();
            assert!(core::ptr::eq(got.as_ptr(), expected));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn steal_takes_at_most_half() {
        let victim = Bounded::new();
        let thief = Bounded::new();
        let tasks = make_tasks(8);
        assert!(unsafe { victim.push(batch_of(&tasks)) }.is_none());

        let first = thief.steal_bounded(&victim).unwrap();
        assert!(core::ptr::eq(first.as_ptr(), &tasks[0]));

        // ceil(8 / 2) = 4 transferred: one direct, three buffered
        let mut buffered = 0;
        while thief.pop().is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, 3);

        let mut left = 0;
        while victim.pop().is_some() {
            left += 1;
        }
        assert_eq!(left, 4);
    }

    #[test]
    fn steal_single_task() {
        let victim = Bounded::new();
        let thief = Bounded::new();
        let tasks = make_tasks(1);
        assert!(unsafe { victim.push(batch_of(&tasks)) }.is_none());

        let first = thief.steal_bounded(&victim).unwrap();
        assert!(core::ptr::eq(first.as_ptr(), &tasks[0]));
        assert!(thief.pop().is_none());
        assert!(victim.pop().is_none());
        assert!(thief.steal_bounded(&victim).is_none());
    }

    #[test]
    fn unbounded_fifo_and_consumer_token() {
        let queue = Unbounded::new();
        let tasks = make_tasks(5);
        unsafe {
            queue.push(batch_of(&tasks[..2]));
            queue.push(batch_of(&tasks[2..]));
        }

        let mut consumer = queue.try_acquire_consumer().unwrap();
        // the token is exclusive while held
        assert!(queue.try_acquire_consumer().is_none());

        for expected in &tasks {
            let got = consumer.pop().unwrap();
            assert!(core::ptr::eq(got.as_ptr(), expected));
        }
        assert!(consumer.pop().is_none());
        drop(consumer);

        // drained: nothing left to consume
        assert!(queue.try_acquire_consumer().is_none());
    }

    #[test]
    fn unbounded_empty_is_not_acquirable() {
        let queue = Unbounded::new();
        assert!(queue.try_acquire_consumer().is_none());
    }

    #[test]
    fn steal_unbounded_fills_buffer() {
        let queue = Unbounded::new();
        let local = Bounded::new();
        let tasks = make_tasks(6);
        unsafe { queue.push(batch_of(&tasks)) };

        let first = local.steal_unbounded(&queue).unwrap();
        assert!(core::ptr::eq(first.as_ptr(), &tasks[0]));
        for expected in &tasks[1..] {
            let got = local.pop().unwrap();
            assert!(core::ptr::eq(got.as_ptr(), expected));
        }
        assert!(local.pop().is_none());
    }
}
