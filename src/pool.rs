use crate::clock::nanotime;
use crate::loom::{AtomicPtr, AtomicU32, Cell};
use crate::parking_lot::{self, ParkResult, DEFAULT_TOKEN};
use crate::run_queue::{Bounded, Unbounded};
use crate::task::{Batch, Task};

use core::hint::spin_loop;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

/// How often a worker samples the global queue ahead of its local ones,
/// in poll iterations. Keeps remote submissions from starving behind a
/// busy local FIFO.
const GLOBAL_POLL_INTERVAL: usize = 61;

/// How many times a failed OS thread spawn is retried before the wake is
/// abandoned; the work stays queued either way.
const SPAWN_ATTEMPTS: u32 = 5;

const COUNT_MASK: u32 = (1 << 14) - 1;
const SPAWNED_SHIFT: u32 = 14;
const NOTIFIED_BIT: u32 = 1 << 28;
const STATE_SHIFT: u32 = 29;

/// The most workers a pool can manage; counters are 14 bits wide.
const MAX_WORKERS: u32 = COUNT_MASK;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    /// No wake pending, normal operation.
    Pending = 0,
    /// A wake was posted with no waking worker to carry it.
    Notified = 1,
    /// Exactly one worker holds the waking role.
    Waking = 2,
    /// A wake was posted while a waker was already active.
    WakerNotified = 3,
    Shutdown = 4,
}

/// The pool's whole lifecycle coordination word: the state machine, a
/// posted-wake flag, and the idle and live worker counts, packed so every
/// transition is one CAS.
#[derive(Copy, Clone)]
struct Sync {
    idle: u32,
    spawned: u32,
    notified: bool,
    state: State,
}

impl Sync {
    fn from_bits(bits: u32) -> Sync {
        Sync {
            idle: bits & COUNT_MASK,
            spawned: (bits >> SPAWNED_SHIFT) & COUNT_MASK,
            notified: bits & NOTIFIED_BIT != 0,
            state: match bits >> STATE_SHIFT {
                0 => State::Pending,
                1 => State::Notified,
                2 => State::Waking,
                3 => State::WakerNotified,
                _ => State::Shutdown,
            },
        }
    }

    fn to_bits(self) -> u32 {
        self.idle
            | (self.spawned << SPAWNED_SHIFT)
            | if self.notified { NOTIFIED_BIT } else { 0 }
            | ((self.state as u32) << STATE_SHIFT)
    }
}

/// Pool construction parameters; both fields are clamped to sane ranges
/// when the pool starts.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Upper bound on worker threads, including the caller of
    /// [`Pool::run`]. Defaults to the available parallelism.
    pub max_threads: u16,
    /// Stack size for spawned workers, at least 16 KiB. Defaults to 1 MiB.
    pub stack_size: u32,
}

impl Default for Config {
    fn default() -> Config {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Config {
            max_threads: cpus.min(MAX_WORKERS as usize) as u16,
            stack_size: 1 << 20,
        }
    }
}

/// A work-stealing pool of worker threads.
///
/// The pool lives on the stack of [`Pool::run`] and is torn down when
/// every worker observed shutdown; tasks reach it through the [`Worker`]
/// passed to their callbacks, or through [`Pool::schedule`].
pub struct Pool {
    sync: AtomicU32,
    max_workers: u32,
    #[cfg_attr(loom, allow(dead_code))]
    stack_size: u32,
    run_queue: Unbounded,
    active_queue: AtomicPtr<Worker>,
}

impl Pool {
    fn new(config: Config) -> Pool {
        Pool {
            sync: AtomicU32::new(0),
            max_workers: (config.max_threads as u32).clamp(1, MAX_WORKERS),
            stack_size: config.stack_size.max(16 * 1024),
            run_queue: Unbounded::new(),
            active_queue: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Runs `batch` to completion on a fresh pool.
    ///
    /// The calling thread becomes the first worker, so this returns only
    /// after [`shutdown`](Pool::shutdown) was called (by a task) and every
    /// worker wound down. An empty batch returns immediately.
    ///
    /// # Safety
    ///
    /// Every task in `batch` must stay valid until it ran.
    pub unsafe fn run(config: Config, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let pool = Pool::new(config);
        pool.run_queue.push(batch);

        // the caller thread is consumed as the first worker; it starts in
        // the waking role like any other fresh worker
        let sync = Sync {
            idle: 0,
            spawned: 1,
            notified: false,
            state: State::Waking,
        };
        pool.sync.store(sync.to_bits(), Relaxed);
        Worker::run(&pool);
    }

    /// Submits a batch through the global queue and makes sure a worker
    /// is awake to pick it up.
    ///
    /// # Safety
    ///
    /// Every task in `batch` must stay valid until it ran.
    pub unsafe fn schedule(&self, batch: impl Into<Batch>) {
        let batch = batch.into();
        if batch.is_empty() {
            return;
        }
        self.run_queue.push(batch);
        self.try_resume(false);
    }

    /// Stops the pool: parked workers are released, running tasks finish,
    /// and no queued task starts afterwards.
    pub fn shutdown(&self) {
        let mut sync = Sync::from_bits(self.sync.load(Relaxed));
        while sync.state != State::Shutdown {
            let mut new = sync;
            new.state = State::Shutdown;
            new.notified = false;
            match self
                .sync
                .compare_exchange(sync.to_bits(), new.to_bits(), Release, Relaxed)
            {
                Ok(_) => {
                    parking_lot::unpark_all(self.sync_addr());
                    return;
                }
                Err(bits) => sync = Sync::from_bits(bits),
            }
        }
    }

    fn sync_addr(&self) -> usize {
        &self.sync as *const AtomicU32 as usize
    }

    fn is_shutdown(&self) -> bool {
        Sync::from_bits(self.sync.load(Relaxed)).state == State::Shutdown
    }

    /// Makes sure at least one worker will look at the queues: wakes an
    /// idle worker, spawns a new one, or leaves a mark for the next
    /// worker about to suspend. Returns `false` only on a shut-down pool.
    fn try_resume(&self, is_waking: bool) -> bool {
        let mut is_waking = is_waking;
        let mut attempts = SPAWN_ATTEMPTS;
        let mut sync = Sync::from_bits(self.sync.load(Relaxed));
        loop {
            if sync.state == State::Shutdown {
                return false;
            }

            let can_wake = sync.idle > 0 || sync.spawned < self.max_workers;
            if can_wake && ((is_waking && attempts > 0) || (!is_waking && sync.state == State::Pending))
            {
                let mut new = sync;
                new.state = State::Waking;
                let wake_idle = sync.idle > 0;
                if wake_idle {
                    // the woken worker inherits the waking role and this
                    // idle slot; the flag keeps it from re-parking first
                    new.idle -= 1;
                    new.notified = true;
                } else {
                    new.spawned += 1;
                }
                match self
                    .sync
                    .compare_exchange(sync.to_bits(), new.to_bits(), Acquire, Relaxed)
                {
                    Err(bits) => {
                        sync = Sync::from_bits(bits);
                        continue;
                    }
                    Ok(_) => {
                        if wake_idle {
                            parking_lot::unpark_one(self.sync_addr(), |_| DEFAULT_TOKEN);
                            return true;
                        }
                        match self.spawn_worker() {
                            Ok(()) => return true,
                            Err(_) => {
                                // hand the claimed slot back and retry in
                                // the waking role
                                self.unspawn();
                                attempts -= 1;
                                is_waking = true;
                                spin_loop();
                                sync = Sync::from_bits(self.sync.load(Relaxed));
                                continue;
                            }
                        }
                    }
                }
            }

            if is_waking {
                // nothing left to wake or spawn: release the waking role,
                // keeping any posted notification alive
                let mut new = sync;
                new.state = match sync.state {
                    State::Waking => State::Pending,
                    State::WakerNotified => State::Notified,
                    _ => return true,
                };
                match self
                    .sync
                    .compare_exchange(sync.to_bits(), new.to_bits(), Release, Relaxed)
                {
                    Ok(_) => return true,
                    Err(bits) => {
                        sync = Sync::from_bits(bits);
                        continue;
                    }
                }
            }

            // mark the wake as pending for the next worker that tries to
            // suspend
            let mut new = sync;
            new.state = match sync.state {
                State::Pending => State::Notified,
                State::Waking => State::WakerNotified,
                State::Notified | State::WakerNotified => return true,
                State::Shutdown => unreachable!(),
            };
            match self
                .sync
                .compare_exchange(sync.to_bits(), new.to_bits(), Release, Relaxed)
            {
                Ok(_) => return true,
                Err(bits) => sync = Sync::from_bits(bits),
            }
        }
    }

    /// Called by a worker that found nothing to run. `Some(is_waking)`
    /// tells the worker to poll again (and whether it holds the waking
    /// role); `None` means the pool shut down and the worker must exit.
    fn try_suspend(&self, worker: &Worker) -> Option<bool> {
        let mut is_waking = worker.is_waking();
        let mut sync = Sync::from_bits(self.sync.load(Relaxed));
        loop {
            if sync.state == State::Shutdown {
                self.quiesce(worker);
                return None;
            }

            if sync.notified {
                // a wake was posted at a parking worker; whoever consumes
                // it takes the waking role the resumer already set up
                let mut new = sync;
                new.notified = false;
                match self
                    .sync
                    .compare_exchange(sync.to_bits(), new.to_bits(), Acquire, Relaxed)
                {
                    Ok(_) => return Some(true),
                    Err(bits) => sync = Sync::from_bits(bits),
                }
                continue;
            }

            if sync.state == State::Notified || (sync.state == State::WakerNotified && is_waking) {
                let mut new = sync;
                new.state = if is_waking { State::Waking } else { State::Pending };
                match self
                    .sync
                    .compare_exchange(sync.to_bits(), new.to_bits(), Acquire, Relaxed)
                {
                    Ok(_) => return Some(is_waking),
                    Err(bits) => sync = Sync::from_bits(bits),
                }
                continue;
            }

            // register idle and park on the pool's state word; a resumer
            // decrements `idle` on our behalf when it wakes us
            let can_wake = sync.idle > 0 || sync.spawned < self.max_workers;
            let mut new = sync;
            new.idle += 1;
            if is_waking {
                new.state = if can_wake { State::Pending } else { State::Notified };
            }
            match self
                .sync
                .compare_exchange(sync.to_bits(), new.to_bits(), AcqRel, Relaxed)
            {
                Ok(_) => {
                    is_waking = false;
                    self.idle_wait();
                    sync = Sync::from_bits(self.sync.load(Relaxed));
                }
                Err(bits) => sync = Sync::from_bits(bits),
            }
        }
    }

    fn idle_wait(&self) {
        //SAFETY: the callbacks don't re-enter the parking lot.
        let _ = unsafe {
            parking_lot::park(
                self.sync_addr(),
                || {
                    let sync = Sync::from_bits(self.sync.load(Relaxed));
                    (sync.state != State::Shutdown && !sync.notified).then_some(DEFAULT_TOKEN)
                },
                || {},
                |_, _| {},
                None,
            )
        };
    }

    /// The shutdown barrier. The first-registered (root) worker owns the
    /// pool's stack frame, so it leaves last: it waits for every other
    /// worker to publish its exit, then releases them all; they wake
    /// touching nothing but their own stacks and the global bucket table.
    fn quiesce(&self, worker: &Worker) {
        let addr = self.sync_addr();
        if worker.is_root() {
            self.unspawn();
            loop {
                let sync = Sync::from_bits(self.sync.load(Acquire));
                if sync.spawned == 0 {
                    break;
                }
                // the exit decrements are published under a bucket lock,
                // so re-check on a short deadline instead of a wake
                let _ = unsafe {
                    parking_lot::park(
                        addr,
                        || {
                            (Sync::from_bits(self.sync.load(Relaxed)).spawned != 0)
                                .then_some(DEFAULT_TOKEN)
                        },
                        || {},
                        |_, _| {},
                        Some(nanotime() + 100_000),
                    )
                };
            }
            let mut sync = Sync::from_bits(self.sync.load(Relaxed));
            loop {
                let mut new = sync;
                new.notified = true;
                match self
                    .sync
                    .compare_exchange(sync.to_bits(), new.to_bits(), Release, Relaxed)
                {
                    Ok(_) => break,
                    Err(bits) => sync = Sync::from_bits(bits),
                }
            }
            parking_lot::unpark_all(addr);
        } else {
            let result = unsafe {
                parking_lot::park(
                    addr,
                    || (!Sync::from_bits(self.sync.load(Relaxed)).notified).then_some(DEFAULT_TOKEN),
                    // the decrement happens after insertion, still under
                    // the bucket lock: once the root reads zero, this
                    // worker is already queued for its final wake
                    || self.unspawn(),
                    |_, _| {},
                    None,
                )
            };
            if result == ParkResult::Invalidated {
                self.unspawn();
            }
        }
    }

    fn unspawn(&self) {
        let mut sync = Sync::from_bits(self.sync.load(Relaxed));
        loop {
            #[cfg(not(loom))]
            debug_assert!(sync.spawned >= 1);
            #[cfg(loom)]
            assert!(sync.spawned >= 1);
            let mut new = sync;
            new.spawned -= 1;
            match self
                .sync
                .compare_exchange(sync.to_bits(), new.to_bits(), AcqRel, Relaxed)
            {
                Ok(_) => return,
                Err(bits) => sync = Sync::from_bits(bits),
            }
        }
    }

    fn register(&self, worker: &Worker) {
        let mut head = self.active_queue.load(Relaxed);
        loop {
            worker.active_next.store(head, Relaxed);
            match self.active_queue.compare_exchange(
                head,
                worker as *const Worker as *mut Worker,
                Release,
                Relaxed,
            ) {
                Ok(_) => return,
                Err(updated) => head = updated,
            }
        }
    }

    #[cfg(not(loom))]
    fn spawn_worker(&self) -> std::io::Result<()> {
        let pool = SendPtr(self);
        crate::loom::thread::Builder::new()
            .stack_size(self.stack_size as usize)
            .spawn(move || {
                //SAFETY: the shutdown barrier keeps the pool frame alive
                // until this worker unwound.
                Worker::run(unsafe { &*pool.get() });
            })
            .map(drop)
    }

    #[cfg(loom)]
    fn spawn_worker(&self) -> std::io::Result<()> {
        let pool = SendPtr(self);
        loom::thread::spawn(move || {
            //SAFETY: the shutdown barrier keeps the pool frame alive
            // until this worker unwound.
            Worker::run(unsafe { &*pool.get() });
        });
        Ok(())
    }
}

struct SendPtr(*const Pool);

// The pointee is synchronised through `Pool::sync` and the queues.
unsafe impl Send for SendPtr {}

impl SendPtr {
    fn get(&self) -> *const Pool {
        self.0
    }
}

/// Where [`Worker::schedule`] should put new work.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleHint {
    /// The worker's private next-task slot: runs before everything local.
    Next,
    /// The stealable LIFO slot: keeps cache-hot continuations close.
    Lifo,
    /// The back of the local FIFO, overflowing to the unbounded queue.
    Fifo,
    /// Behind one queued task: lets other work run before a re-schedule.
    Yield,
}

/// One pool worker, living on its thread's stack.
///
/// Task callbacks receive the executing worker and schedule follow-up
/// work through it; everything else on it is pool plumbing.
pub struct Worker {
    pool: *const Pool,
    /// `(tick << 1) | is_waking`; only the owning thread touches it.
    state: Cell<usize>,
    run_queue_next: Cell<*const Task>,
    run_queue_lifo: AtomicPtr<Task>,
    run_queue: Bounded,
    run_queue_overflow: Unbounded,
    active_next: AtomicPtr<Worker>,
    target_worker: Cell<*const Worker>,
}

/*SAFETY: stealers only touch the atomic fields (`run_queue`,
 * `run_queue_overflow`, `run_queue_lifo`, `active_next`); the `Cell`s
 * belong to the owning thread alone.
 */
unsafe impl ::core::marker::Sync for Worker {}

impl Worker {
    fn new(pool: &Pool) -> Worker {
        Worker {
            pool,
            // fresh workers hold the waking role
            state: Cell::new(0b1),
            run_queue_next: Cell::new(ptr::null()),
            run_queue_lifo: AtomicPtr::new(ptr::null_mut()),
            run_queue: Bounded::new(),
            run_queue_overflow: Unbounded::new(),
            active_next: AtomicPtr::new(ptr::null_mut()),
            target_worker: Cell::new(ptr::null()),
        }
    }

    pub(crate) fn run(pool: &Pool) {
        let worker = Worker::new(pool);
        pool.register(&worker);

        loop {
            let task = if pool.is_shutdown() {
                None
            } else {
                worker.poll()
            };
            match task {
                Some(task) => {
                    if worker.is_waking() {
                        // promote a successor before settling into work
                        pool.try_resume(true);
                        worker.set_waking(false);
                    }
                    //SAFETY: the queues hand out each scheduled task once.
                    unsafe { Task::execute(task, &worker) };
                }
                None => match pool.try_suspend(&worker) {
                    Some(is_waking) => worker.set_waking(is_waking),
                    None => break,
                },
            }
        }
    }

    /// The pool this worker belongs to.
    pub fn pool(&self) -> &Pool {
        //SAFETY: a worker never outlives its pool.
        unsafe { &*self.pool }
    }

    /// Schedules work from this worker's thread.
    ///
    /// # Safety
    ///
    /// Every task in `batch` must stay valid until it ran, and this may
    /// only be called from the thread running this worker.
    pub unsafe fn schedule(&self, hint: ScheduleHint, batch: impl Into<Batch>) {
        let mut batch = batch.into();
        if batch.is_empty() {
            return;
        }
        match hint {
            ScheduleHint::Next => {
                let task = match batch.pop() {
                    Some(task) => task,
                    None => return,
                };
                let old = self.run_queue_next.replace(task.as_ptr());
                if !old.is_null() {
                    batch.push(NonNull::new_unchecked(old as *mut Task));
                }
                self.push_fifo(batch);
            }
            ScheduleHint::Lifo => {
                let task = match batch.pop() {
                    Some(task) => task,
                    None => return,
                };
                let old = self.run_queue_lifo.swap(task.as_ptr(), AcqRel);
                if !old.is_null() {
                    // the displaced task is re-queued, never dropped
                    batch.push(NonNull::new_unchecked(old));
                }
                self.push_fifo(batch);
            }
            ScheduleHint::Fifo => self.push_fifo(batch),
            ScheduleHint::Yield => {
                // let an already-queued task go first: it takes the next
                // slot while the yielded work goes to the back
                let popped = self.run_queue.pop();
                self.push_fifo(batch);
                if let Some(task) = popped {
                    let old = self.run_queue_next.replace(task.as_ptr());
                    if !old.is_null() {
                        self.push_fifo(Batch::from(NonNull::new_unchecked(old as *mut Task)));
                    }
                }
            }
        }
        self.pool().try_resume(false);
    }

    unsafe fn push_fifo(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        if let Some(overflow) = self.run_queue.push(batch) {
            self.run_queue_overflow.push(overflow);
        }
    }

    fn poll(&self) -> Option<NonNull<Task>> {
        let tick = self.bump_tick();
        let pool = self.pool();

        if tick % GLOBAL_POLL_INTERVAL == 0 {
            // global first so remote work can't starve, then our overflow
            if let Some(task) = self.run_queue.steal_unbounded(&pool.run_queue) {
                return Some(task);
            }
            if let Some(task) = self.run_queue.steal_unbounded(&self.run_queue_overflow) {
                return Some(task);
            }
        }

        let next = self.run_queue_next.replace(ptr::null());
        if let Some(task) = NonNull::new(next as *mut Task) {
            return Some(task);
        }

        // cheap read before paying for the swap
        if !self.run_queue_lifo.load(Relaxed).is_null() {
            let task = self.run_queue_lifo.swap(ptr::null_mut(), Acquire);
            if let Some(task) = NonNull::new(task) {
                return Some(task);
            }
        }

        if let Some(task) = self.run_queue.pop() {
            return Some(task);
        }
        if let Some(task) = self.run_queue.steal_unbounded(&self.run_queue_overflow) {
            return Some(task);
        }
        if let Some(task) = self.run_queue.steal_unbounded(&pool.run_queue) {
            return Some(task);
        }
        if let Some(task) = self.steal() {
            return Some(task);
        }
        self.run_queue.steal_unbounded(&pool.run_queue)
    }

    /// One rotation over the other active workers, resuming from the last
    /// successful victim.
    fn steal(&self) -> Option<NonNull<Task>> {
        let head = self.pool().active_queue.load(Acquire) as *const Worker;
        if head.is_null() {
            return None;
        }
        let cursor = self.target_worker.get();
        let start = if cursor.is_null() { head } else { cursor };

        let mut current = start;
        let mut wrapped = false;
        loop {
            if current.is_null() {
                if wrapped {
                    break;
                }
                wrapped = true;
                current = head;
                continue;
            }
            if wrapped && ptr::eq(current, start) {
                break;
            }
            //SAFETY: registered workers stay alive until the shutdown
            // barrier, which no stealer survives.
            let victim = unsafe { &*current };
            if !ptr::eq(victim, self) {
                if let Some(task) = self.steal_from(victim) {
                    self.target_worker.set(current);
                    return Some(task);
                }
            }
            current = victim.active_next.load(Acquire) as *const Worker;
        }
        self.target_worker.set(ptr::null());
        None
    }

    fn steal_from(&self, victim: &Worker) -> Option<NonNull<Task>> {
        if let Some(task) = self.run_queue.steal_bounded(&victim.run_queue) {
            return Some(task);
        }
        if let Some(task) = self.run_queue.steal_unbounded(&victim.run_queue_overflow) {
            return Some(task);
        }
        NonNull::new(victim.run_queue_lifo.swap(ptr::null_mut(), Acquire))
    }

    fn is_root(&self) -> bool {
        // registration is a prepend, so only the first worker has no link
        self.active_next.load(Relaxed).is_null()
    }

    fn bump_tick(&self) -> usize {
        let state = self.state.get();
        // the tick lives above the waking bit
        self.state.set(state.wrapping_add(2));
        state >> 1
    }

    fn is_waking(&self) -> bool {
        self.state.get() & 0b1 != 0
    }

    fn set_waking(&self, is_waking: bool) {
        self.state.set(self.state.get() & !0b1 | is_waking as usize);
    }
}
