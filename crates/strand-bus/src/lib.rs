//! # strand-bus
//!
//! Bounded FIFO channels multiplexed over a single-threaded cooperative
//! coroutine scheduler.
//!
//! The crate has two halves:
//! - [`sched`]: the scheduler. Coroutines are plain futures polled FIFO;
//!   they park with `suspend().await` and are resumed with `wake`.
//! - [`bus`]: the channel table. Blocking send/recv (plus batched and
//!   broadcast variants) park the calling coroutine on per-channel FIFO
//!   waiter queues and re-check their precondition on every resume.

pub mod bus;
pub mod sched;

pub use bus::{Bus, ChannelId};
pub use sched::{CoroId, SchedHandle, Scheduler};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The channel slot is vacant or out of range, or was closed while the
    /// caller was parked on it.
    #[error("no such channel")]
    NoChannel,

    /// A non-blocking operation found the channel full (sends) or empty
    /// (receives).
    #[error("operation would block")]
    WouldBlock,
}

pub type Result<T> = std::result::Result<T, BusError>;
