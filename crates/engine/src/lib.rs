//! Execution engine for phasekv
//!
//! This crate runs transactions on workers and drives the epoch protocol:
//! - [`Request`], [`Args`], [`TxnRegistry`]: what workers execute
//! - [`Worker`]: sequential executor with a stash queue and an epoch
//!   state machine (split, merge, join)
//! - [`Coordinator`]: owns the epoch, runs the four-point barrier and
//!   promotes/demotes hot keys
//! - [`PromotionPlan`]: the promotion/demotion decision for one epoch

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod promotion;
pub mod request;
pub mod worker;

pub use coordinator::{Coordinator, MAX_WORKERS};
pub use promotion::PromotionPlan;
pub use request::{Args, Reply, Request, TxnBody, TxnCode, TxnRegistry};
pub use worker::{EpochClock, Worker};
