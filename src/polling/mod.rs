//! The polling engine: polled objects with their history, the workers
//! filling them and the pool assigning devices to workers.

pub mod mailbox;
pub mod poll_obj;
pub mod pool;
pub mod ring;
pub mod worker;

pub use poll_obj::{PollObjKind, PolledData, PolledObject};
pub use pool::{Assignment, PollingThreadPool};
pub use ring::{RingBuffer, RingEntry};
pub use worker::{PollCmd, PollingWorker, WorkerState};
