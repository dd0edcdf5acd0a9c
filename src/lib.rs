//! Async Test Loop
//!
//! A deterministic, timer-driven event loop for asserting properties of
//! asynchronous operations in tests:
//! - Completion markers ("dones") that must resolve before a deadline,
//!   optionally in a declared order
//! - Scheduled calls at (optionally jittered) future timestamps, including
//!   chained scheduling that is independent of execution latency
//! - Worker threads may resolve, fail, schedule or abort through a
//!   `LoopHandle` while the loop is idle
//! - Test failures come back as an `Outcome`; API misuse as a `UsageError`

pub mod clock;
pub mod done;
pub mod engine;
pub mod error;
pub mod pq;
pub mod rng;
pub mod runner;
pub mod scheduler;
pub mod trace;


pub use done::{Done, DoneState, DEFAULT_TAG};
pub use engine::{EventLoop, LoopConfig, LoopCtx, LoopHandle, LoopState};
pub use error::{CallError, CallResult, Completion, Failure, Outcome, UsageError};
pub use runner::{GroupReport, TestGroup, Totals};
pub use scheduler::SchedHandle;
pub use trace::init_tracing;
