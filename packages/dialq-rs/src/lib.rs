//! # Dialq
//!
//! A Redis-backed dispatch queue for outbound call jobs.
//!
//! Dialq owns storage and delivery; the application owns policy. The queue
//! knows nothing about campaigns beyond the campaign id each job is tagged
//! with - concurrency caps, waitlists, and retry decisions all live with the
//! caller.
//!
//! ## Layout
//!
//! One queue is a family of keys sharing a `dialq:{<name>}:` hash-tagged
//! prefix:
//!
//! - `wait` - LIST of serialized job envelopes, pushed at the head, claimed
//!   from the tail (FIFO); front-of-queue inserts go to the tail.
//! - `delayed` - ZSET scored by run-at milliseconds, moved onto `wait` by the
//!   worker's promotion tick.
//! - `active` / `active:hb` - HASHes of claimed envelopes and their last
//!   heartbeat, used to recover jobs whose worker died mid-flight.
//! - `ids` - SET of every job id currently anywhere in the pipeline.
//! - `campaign:<id>` - SET index of job ids per campaign, for bulk cancel.
//!
//! ## Guarantees
//!
//! - **At-most-once claim**: a job is claimed by exactly one worker (RPOP).
//! - **No silent loss**: a claimed job whose worker vanishes is surfaced by
//!   [`Queue::take_stalled`] after the stall threshold.
//! - **Bounded retry**: the worker re-schedules failed jobs with backoff up
//!   to a configured attempt cap, then drops them with an error log.

mod error;
mod job;
mod queue;
mod worker;

pub use error::QueueError;
pub use job::{DialJob, JobEnvelope, Origin};
pub use queue::{Queue, RedisQueue};
pub use worker::{JobHandler, Worker, WorkerConfig};

pub use async_trait::async_trait;
