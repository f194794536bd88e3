use crate::loom::AtomicPtr;
use crate::pool::Worker;

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::Relaxed;

const RESUME_TAG: usize = 0b1;

// the tag bit must be free in resumer pointers
const _: () = assert!(mem::align_of::<Resumer>() >= 2);

/// A schedulable unit of work.
///
/// Tasks are intrusive and unmanaged: the pool only ever touches the two
/// words below and never allocates or frees them. Embed a `Task` as the
/// first field of a `#[repr(C)]` struct and cast the pointer back in the
/// callback to reach the payload.
///
/// The `runnable` word is either a plain callback or a pointer to a
/// [`Resumer`] header, told apart by the low bit; both kinds are invoked
/// inline on a worker thread and are expected to either complete or
/// re-schedule themselves.
pub struct Task {
    pub(crate) next: AtomicPtr<Task>,
    runnable: usize,
}

impl Task {
    /// Creates a task that runs `callback` with its own address and the
    /// executing worker.
    pub fn from_callback(callback: fn(NonNull<Task>, &Worker)) -> Task {
        let runnable = callback as usize;
        debug_assert_eq!(runnable & RESUME_TAG, 0);
        Task {
            next: AtomicPtr::new(ptr::null_mut()),
            runnable,
        }
    }

    /// Creates a task that resumes `resumer` when it runs.
    ///
    /// # Safety
    ///
    /// `resumer` must stay valid until the task ran.
    pub unsafe fn from_resumer(resumer: NonNull<Resumer>) -> Task {
        Task {
            next: AtomicPtr::new(ptr::null_mut()),
            runnable: resumer.as_ptr() as usize | RESUME_TAG,
        }
    }

    /// A task that must never run; terminates the unbounded queues.
    pub(crate) fn stub() -> Task {
        Task {
            next: AtomicPtr::new(ptr::null_mut()),
            runnable: 0,
        }
    }

    /// # Safety
    ///
    /// `task` must have been scheduled exactly once and not run since.
    pub(crate) unsafe fn execute(task: NonNull<Task>, worker: &Worker) {
        let runnable = (*task.as_ptr()).runnable;
        #[cfg(not(loom))]
        debug_assert_ne!(runnable, 0);
        #[cfg(loom)]
        assert_ne!(runnable, 0);

        if runnable & RESUME_TAG == 0 {
            let callback: fn(NonNull<Task>, &Worker) = mem::transmute(runnable);
            callback(task, worker);
        } else {
            let resumer = NonNull::new_unchecked((runnable & !RESUME_TAG) as *mut Resumer);
            ((*resumer.as_ptr()).resume)(resumer, worker);
        }
    }
}

/// The header of a resumable object.
///
/// Place it at a stable address inside the object and recover the
/// container from the header pointer in `resume`. This is the vtable-free
/// shape of dynamic dispatch: one function pointer, no fat pointers in
/// the queues.
#[repr(C)]
pub struct Resumer {
    /// Called inline on a worker thread when the owning task runs.
    pub resume: unsafe fn(NonNull<Resumer>, &Worker),
}

/// An O(1)-splice list of tasks, used to hand whole runs of work to the
/// scheduler in one call.
pub struct Batch {
    head: *const Task,
    tail: *const Task,
}

// Batches are just links between tasks the owner promised to keep alive.
unsafe impl Send for Batch {}

impl Batch {
    /// An empty batch.
    pub const fn new() -> Batch {
        Batch {
            head: ptr::null(),
            tail: ptr::null(),
        }
    }

    /// Whether the batch holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Splices `other` onto the back of this batch.
    ///
    /// # Safety
    ///
    /// Every task already in `self` must still be valid (the splice
    /// writes through the current tail).
    pub unsafe fn push(&mut self, other: impl Into<Batch>) {
        let other = other.into();
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
        } else {
            (*self.tail).next.store(other.head as *mut Task, Relaxed);
            self.tail = other.tail;
        }
    }

    /// Decomposes the batch into its (head, tail) pair.
    pub(crate) fn into_raw(self) -> Option<(NonNull<Task>, NonNull<Task>)> {
        let head = NonNull::new(self.head as *mut Task)?;
        //SAFETY: `tail` is non-null whenever `head` is.
        let tail = unsafe { NonNull::new_unchecked(self.tail as *mut Task) };
        Some((head, tail))
    }

    /// Pops the front task.
    ///
    /// The final task is handed out without reading its links, so a
    /// single-task batch never dereferences anything.
    pub(crate) fn pop(&mut self) -> Option<NonNull<Task>> {
        let task = NonNull::new(self.head as *mut Task)?;
        if self.head == self.tail {
            self.head = ptr::null();
            self.tail = ptr::null();
        } else {
            //SAFETY: a multi-task batch was built by `push`, which keeps
            // the links of every non-tail task valid.
            self.head = unsafe { (*task.as_ptr()).next.load(Relaxed) };
        }
        Some(task)
    }
}

impl Default for Batch {
    fn default() -> Batch {
        Batch::new()
    }
}

impl From<NonNull<Task>> for Batch {
    fn from(task: NonNull<Task>) -> Batch {
        Batch {
            head: task.as_ptr(),
            tail: task.as_ptr(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::{Batch, Task};
    use core::ptr::NonNull;

    fn noop(_: NonNull<Task>, _: &crate::pool::Worker) {}

    #[test]
    fn batch_splices_in_order() {
        let tasks: Vec<Task> = (0..4).map(|_| Task::from_callback(noop)).collect();
        let mut batch = Batch::new();
        assert!(batch.pop().is_none());

        let mut front = Batch::new();
        unsafe {
            front.push(NonNull::from(&tasks[0]));
            front.push(NonNull::from(&tasks[1]));
            batch.push(front);
            batch.push(NonNull::from(&tasks[2]));
            batch.push(NonNull::from(&tasks[3]));
        }

        for expected in &tasks {
            let got = batch.pop().unwrap();
            assert!(core::ptr::eq(got.as_ptr(), expected));
        }
        assert!(batch.is_empty());
    }

    #[test]
    fn empty_batch_push_is_noop() {
        let task = Task::from_callback(noop);
        let mut batch = Batch::from(NonNull::from(&task));
        unsafe { batch.push(Batch::new()) };
        assert!(batch.pop().is_some());
        assert!(batch.pop().is_none());
    }
}
