#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
mod clock;
mod event;
mod loom;
mod parking_lot;
mod pool;
mod run_queue;
mod task;

pub use clock::nanotime;
pub use parking_lot::{park, unpark_all, unpark_one, ParkResult, UnparkResult, DEFAULT_TOKEN};
pub use pool::{Config, Pool, ScheduleHint, Worker};
pub use task::{Batch, Resumer, Task};
