//! Redistribution coordinator
//!
//! Moves a live cluster from one committed topology to the next through the
//! coordination store:
//! - `prepare` computes the candidate topology and records which shards move
//! - `start` / `wait_for_finish_state` drive the per-zone phase flags that
//!   storage nodes follow while copying shards
//! - `commit` publishes the candidate as the next version
//! - `abort` / `resume` stop or re-throttle a redistribution
//!
//! The phase flags in the store act as the lock: a new redistribution cannot
//! be prepared while any zone still belongs to one.

pub mod redistributor;

pub use redistributor::{
    CommitReport, MarkdownOp, RedistStatus, Redistributor, WaitOptions, WaitOutcome,
};
