//! Drive cooperating tasks and bounded channels in simulated time.
//!
//! This crate provides a single-threaded, cooperative runtime that advances a
//! simulated clock in discrete jumps instead of waiting on wall-clock time. Tasks
//! are ordinary `async` blocks that suspend by sleeping on the runtime's [Clock] or
//! by reading from (or writing to) a [channel] that is empty (or full). The
//! [deterministic] module provides the runtime itself.
//!
//! # Terminology
//!
//! The runtime is composed of an `Executor`, which implements the [Runner] trait and
//! drives execution until a time budget is exhausted, and a `Context`, which implements
//! [Spawner], [Clock] and [Metrics] to provide core functionality to tasks.
//!
//! # Example
//!
//! ```rust
//! use lockstep_runtime::{channel, deterministic::Executor, Clock, Metrics, Runner, Spawner, State};
//! use std::time::Duration;
//!
//! let (executor, context, _) = Executor::default();
//! let (mut sender, mut receiver) = channel::bounded(10).unwrap();
//! context.with_label("producer").spawn(|context| async move {
//!     for i in 0..5 {
//!         context.sleep(Duration::from_secs(1)).await;
//!         sender.write(i).await;
//!     }
//! });
//! context.with_label("consumer").spawn(|context| async move {
//!     loop {
//!         let value = receiver.read().await;
//!         println!("received {} at {:?}", value, context.current());
//!     }
//! });
//! let summary = executor.run(Duration::from_secs(10)).unwrap();
//! assert_eq!(summary.state("consumer"), Some(State::WaitingOnChannel));
//! ```

use prometheus_client::registry::Metric;
use std::{future::Future, time::Duration};
use thiserror::Error;

pub mod channel;
pub mod deterministic;
mod utils;
pub use utils::Handle;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("channel capacity must be positive")]
    InvalidCapacity,
    #[error("closed")]
    Closed,
    #[error("stalled after {polls} polls at {at:?}")]
    Stalled { polls: u64, at: Duration },
}

/// Lifecycle of a task managed by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting in the ready queue to be polled.
    Runnable,
    /// Currently being polled.
    Running,
    /// Suspended until the clock reaches a registered alarm.
    WaitingOnTime,
    /// Suspended without an alarm, until another task wakes it.
    ///
    /// This is the state of a task blocked on a channel read or write, and of a task
    /// awaiting the [Handle] of another task.
    WaitingOnChannel,
    /// The task's future has completed.
    Terminated,
}

/// Interface that any task scheduler must implement to drive
/// registered tasks.
pub trait Runner {
    /// Description of the run returned once it ends.
    type Summary;

    /// Run all registered tasks until no pending alarm falls within `budget`.
    ///
    /// When this function returns, all tasks that have not completed are abandoned
    /// (their futures are dropped without being polled again). Running out of budget
    /// while tasks are still suspended is not an error.
    ///
    /// The run only returns once the clock can advance. Tasks that keep waking each
    /// other at a single instant (or keep sleeping for zero time) prevent this unless
    /// the runtime bounds the number of polls per instant (see
    /// [deterministic::Config::instant_poll_limit]).
    fn run(self, budget: Duration) -> Result<Self::Summary, Error>;
}

/// Interface that any task scheduler must implement to spawn tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Enqueue a new task with the current context.
    ///
    /// Tasks are polled in the order they are spawned. Unlike directly awaiting a
    /// future, the task runs even if the caller never awaits the returned [Handle].
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Interface to register and encode metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// This is commonly used to create a nested context for `register` (and to
    /// name tasks before spawning them).
    ///
    /// It is not permitted for any implementation to use `METRICS_PREFIX` as the start of a
    /// label (reserved for metrics for the runtime).
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// Interface that any task scheduler must implement to provide
/// time-based operations.
///
/// Time is measured from the start of the run (which is always zero).
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current simulated time.
    fn current(&self) -> Duration;

    /// Sleep for the given duration.
    ///
    /// Sleeping always yields to the runtime, even when `duration` is zero.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;

    /// Sleep until the given deadline.
    fn sleep_until(&self, deadline: Duration) -> impl Future<Output = ()> + Send + 'static;
}
