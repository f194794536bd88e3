use cfg_if::cfg_if;

cfg_if! {

if #[cfg(loom)] {
    pub(crate) use loom::cell::Cell;
    pub(crate) use loom::sync::{Condvar, Mutex, MutexGuard};
    pub(crate) use loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};
}
else {
    pub(crate) use std::cell::Cell;
    pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};
    pub(crate) use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};
    pub(crate) use std::thread;
}

}
