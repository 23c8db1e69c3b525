//! A deterministic runtime that advances a simulated clock.
//!
//! Tasks are polled one at a time, in the order they were spawned (or woken). When no task
//! is runnable, the clock jumps to the earliest pending alarm and every task sleeping until
//! that exact time is resumed (in the order its alarm was registered). The run ends once no
//! alarm falls within the time budget.
//!
//! # Hand-off
//!
//! When the running task wakes another task (i.e. by writing to a channel the other task is
//! reading from), the woken task is placed at the front of the ready queue as soon as the
//! running task yields. Hand-offs therefore happen at the current simulated time and before
//! any timed wake-up already queued for the same instant.
//!
//! # Panics
//!
//! If any task panics, the runtime will panic.
//!
//! # Example
//!
//! ```rust
//! use lockstep_runtime::{Clock, Metrics, Runner, Spawner, deterministic::Executor};
//! use std::time::Duration;
//!
//! let (executor, context, auditor) = Executor::default();
//! context.with_label("ticker").spawn(|context| async move {
//!     loop {
//!         context.sleep(Duration::from_secs(1)).await;
//!         println!("tick at {:?}", context.current());
//!     }
//! });
//! let summary = executor.run(Duration::from_secs(3)).unwrap();
//! assert_eq!(summary.now, Duration::from_secs(3));
//! println!("Auditor state: {}", auditor.state());
//! ```

use crate::{utils::hex, Clock, Error, Handle, State, METRICS_PREFIX};
use futures::task::{waker_ref, ArcWake};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use sha2::{Digest, Sha256};
use std::{
    collections::{BinaryHeap, VecDeque},
    future::Future,
    mem::take,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll, Waker},
    time::Duration,
};
use tracing::{debug, trace};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,

    clock_advances: Counter,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            task_polls: Family::default(),
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            clock_advances: Counter::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        registry.register(
            "clock_advances",
            "Total number of times the simulated clock jumped to an alarm",
            metrics.clock_advances.clone(),
        );
        metrics
    }
}

/// Track the state of the runtime for determinism auditing.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn update(&self, event: &[u8], fields: &[&[u8]]) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(event);
        for field in fields {
            hasher.update(field);
        }
        *hash = hasher.finalize().to_vec();
    }

    fn process_task(&self, task: u128, label: &str) {
        self.update(b"process_task", &[&task.to_be_bytes(), label.as_bytes()]);
    }

    fn alarm(&self, time: Duration) {
        self.update(b"alarm", &[&time.as_nanos().to_be_bytes()]);
    }

    fn advance(&self, time: Duration) {
        self.update(b"advance", &[&time.as_nanos().to_be_bytes()]);
    }

    fn finish(&self, time: Duration) {
        self.update(b"finish", &[&time.as_nanos().to_be_bytes()]);
    }

    /// Generate a representation of the current state of the runtime.
    ///
    /// This can be used to ensure that logic running on top
    /// of the runtime is interacting deterministically.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}

struct Task {
    id: u128,
    label: String,

    tasks: Arc<Tasks>,

    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>>,

    state: Mutex<State>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.tasks.wake(arc_self);
    }
}

struct Tasks {
    counter: Mutex<u128>,
    all: Mutex<Vec<Arc<Task>>>,
    ready: Mutex<VecDeque<Arc<Task>>>,

    // Tasks woken by the running task, placed at the front of `ready` once it yields.
    handoff: Mutex<Vec<Arc<Task>>>,
    running: Mutex<Option<u128>>,
}

impl Tasks {
    fn new() -> Self {
        Self {
            counter: Mutex::new(0),
            all: Mutex::new(Vec::new()),
            ready: Mutex::new(VecDeque::new()),
            handoff: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }
    }

    fn register(
        arc_self: &Arc<Self>,
        label: &str,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) {
        let id = {
            let mut l = arc_self.counter.lock().unwrap();
            let old = *l;
            *l = l.checked_add(1).expect("task counter overflow");
            old
        };
        let task = Arc::new(Task {
            id,
            label: label.to_string(),
            tasks: arc_self.clone(),
            future: Mutex::new(Some(future)),
            state: Mutex::new(State::Runnable),
        });
        trace!(id, label, "registered task");
        arc_self.all.lock().unwrap().push(task.clone());
        arc_self.ready.lock().unwrap().push_back(task);
    }

    fn wake(&self, task: &Arc<Task>) {
        let running = *self.running.lock().unwrap();
        {
            let mut state = task.state.lock().unwrap();
            let current = *state;
            match current {
                State::Runnable | State::Terminated => return,
                State::Running => {
                    // A task that wakes itself yields to everything already runnable
                    *state = State::Runnable;
                    drop(state);
                    self.ready.lock().unwrap().push_back(task.clone());
                    return;
                }
                State::WaitingOnTime | State::WaitingOnChannel => {
                    *state = State::Runnable;
                }
            }
        }
        if running.is_some() {
            self.handoff.lock().unwrap().push(task.clone());
        } else {
            self.ready.lock().unwrap().push_back(task.clone());
        }
    }

    fn next(&self) -> Option<Arc<Task>> {
        let mut ready = self.ready.lock().unwrap();
        while let Some(task) = ready.pop_front() {
            if *task.state.lock().unwrap() == State::Runnable {
                return Some(task);
            }
        }
        None
    }

    fn apply_handoff(&self) {
        let handoff = take(&mut *self.handoff.lock().unwrap());
        let mut ready = self.ready.lock().unwrap();
        for task in handoff.into_iter().rev() {
            ready.push_front(task);
        }
    }
}

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Maximum number of polls allowed without the clock advancing.
    ///
    /// Tasks that keep waking each other (or keep sleeping for zero time) never let the
    /// clock advance. If set, the run returns [Error::Stalled] once this many polls have
    /// occurred at a single instant. If unset (the default), such tasks make
    /// [crate::Runner::run] loop forever.
    pub instant_poll_limit: Option<u64>,
}

/// Deterministic runtime that advances a simulated clock.
pub struct Executor {
    registry: Mutex<Registry>,
    instant_poll_limit: Option<u64>,
    metrics: Arc<Metrics>,
    auditor: Arc<Auditor>,
    time: Mutex<Duration>,
    tasks: Arc<Tasks>,
    sleeping: Mutex<BinaryHeap<Alarm>>,
    sequence: Mutex<u64>,
    armed: Mutex<bool>,
}

impl Executor {
    /// Initialize a new `deterministic` runtime with the given configuration.
    pub fn init(cfg: Config) -> (Runner, Context, Arc<Auditor>) {
        if cfg.instant_poll_limit == Some(0) {
            panic!("instant poll limit must be non-zero");
        }

        // Create a new registry
        let mut registry = Registry::default();
        let runtime_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);

        // Initialize runtime
        let metrics = Arc::new(Metrics::init(runtime_registry));
        let auditor = Arc::new(Auditor::default());
        let executor = Arc::new(Self {
            registry: Mutex::new(registry),
            instant_poll_limit: cfg.instant_poll_limit,
            metrics,
            auditor: auditor.clone(),
            time: Mutex::new(Duration::ZERO),
            tasks: Arc::new(Tasks::new()),
            sleeping: Mutex::new(BinaryHeap::new()),
            sequence: Mutex::new(0),
            armed: Mutex::new(false),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context {
                label: String::new(),
                executor,
            },
            auditor,
        )
    }

    /// Initialize a new `deterministic` runtime with the default configuration.
    // We'd love to implement the trait but we can't because of the return type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Runner, Context, Arc<Auditor>) {
        Self::init(Config::default())
    }

    fn arm(&self, deadline: Duration, waker: Waker) {
        // Alarms in the past fire at the current time
        let time = (*self.time.lock().unwrap()).max(deadline);
        let sequence = {
            let mut sequence = self.sequence.lock().unwrap();
            *sequence = sequence.checked_add(1).expect("alarm sequence overflow");
            *sequence
        };
        self.auditor.alarm(time);
        trace!(?time, sequence, "alarm registered");
        self.sleeping.lock().unwrap().push(Alarm {
            time,
            sequence,
            waker,
        });
        *self.armed.lock().unwrap() = true;
    }

    fn poll(&self, task: &Arc<Task>) {
        // Record task for auditing
        self.auditor.process_task(task.id, &task.label);
        trace!(id = task.id, label = %task.label, "processing task");
        self.metrics
            .task_polls
            .get_or_create(&Work {
                label: task.label.clone(),
            })
            .inc();

        // Prepare task for polling
        *task.state.lock().unwrap() = State::Running;
        *self.tasks.running.lock().unwrap() = Some(task.id);
        *self.armed.lock().unwrap() = false;
        let waker = waker_ref(task);
        let mut cx = task::Context::from_waker(&waker);

        // Poll the task (without holding any runtime lock other than its own future)
        let (result, completed) = {
            let mut future = task.future.lock().unwrap();
            let result = match future.as_mut() {
                Some(fut) => fut.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            };
            let completed = if result.is_ready() {
                future.take()
            } else {
                None
            };
            (result, completed)
        };
        *self.tasks.running.lock().unwrap() = None;

        // Drop completed future outside of the lock (it may wake other tasks)
        drop(completed);

        // Record the resulting state
        {
            let mut state = task.state.lock().unwrap();
            match result {
                Poll::Ready(()) => {
                    *state = State::Terminated;
                    trace!(id = task.id, "task is complete");
                }
                Poll::Pending => {
                    if *state == State::Running {
                        *state = if *self.armed.lock().unwrap() {
                            State::WaitingOnTime
                        } else {
                            State::WaitingOnChannel
                        };
                    }
                    trace!(id = task.id, state = ?*state, "task is still pending");
                }
            }
        }

        // Tasks woken by this task run next
        self.tasks.apply_handoff();
    }
}

/// Description of a task when the run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: u128,
    pub label: String,
    pub state: State,
}

/// Description of a completed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    /// Simulated time when the run ended (always the budget).
    pub now: Duration,
    /// Total number of task polls.
    pub polls: u64,
    /// All tasks spawned during the run, in admission order.
    pub tasks: Vec<TaskSummary>,
}

impl Summary {
    /// Returns the state of the first task with the given label.
    pub fn state(&self, label: &str) -> Option<State> {
        self.tasks
            .iter()
            .find(|task| task.label == label)
            .map(|task| task.state)
    }
}

/// Implementation of [`crate::Runner`] for the `deterministic` runtime.
pub struct Runner {
    executor: Arc<Executor>,
}

impl crate::Runner for Runner {
    type Summary = Summary;

    fn run(self, budget: Duration) -> Result<Summary, Error> {
        let executor = &self.executor;
        let mut polls: u64 = 0;
        let mut instant_polls: u64 = 0;
        let mut iter: u64 = 0;
        let result = loop {
            // Poll tasks until none are runnable at the current instant
            trace!(iter, "starting loop");
            let mut stalled = false;
            while let Some(task) = executor.tasks.next() {
                if executor
                    .instant_poll_limit
                    .is_some_and(|limit| instant_polls >= limit)
                {
                    stalled = true;
                    break;
                }
                polls += 1;
                instant_polls += 1;
                executor.poll(&task);
            }
            if stalled {
                let at = *executor.time.lock().unwrap();
                break Err(Error::Stalled {
                    polls: instant_polls,
                    at,
                });
            }

            // Find the next alarm within the budget
            let next = executor.sleeping.lock().unwrap().peek().map(|alarm| alarm.time);
            let next = match next {
                Some(next) if next <= budget => next,
                Some(next) => {
                    trace!(?next, ?budget, "next alarm exceeds budget");
                    break Ok(());
                }
                None => {
                    trace!("no alarms pending");
                    break Ok(());
                }
            };

            // Advance time
            {
                let mut time = executor.time.lock().unwrap();
                assert!(next >= *time, "clock moved backwards");
                if next > *time {
                    instant_polls = 0;
                }
                *time = next;
            }
            executor.metrics.clock_advances.inc();
            executor.auditor.advance(next);
            trace!(now = ?next, "time advanced");

            // Wake all tasks sleeping until now (in registration order)
            let mut to_wake = Vec::new();
            {
                let mut sleeping = executor.sleeping.lock().unwrap();
                while sleeping.peek().is_some_and(|alarm| alarm.time == next) {
                    if let Some(alarm) = sleeping.pop() {
                        to_wake.push(alarm.waker);
                    }
                }
            }
            for waker in to_wake {
                waker.wake();
            }
            iter += 1;
        };

        // Time runs out at the budget (never beyond it)
        let now = {
            let mut time = executor.time.lock().unwrap();
            if result.is_ok() && *time < budget {
                *time = budget;
            }
            *time
        };
        executor.auditor.finish(now);

        // Describe and abandon all tasks
        let all = take(&mut *executor.tasks.all.lock().unwrap());
        let tasks = all
            .iter()
            .map(|task| TaskSummary {
                id: task.id,
                label: task.label.clone(),
                state: *task.state.lock().unwrap(),
            })
            .collect::<Vec<_>>();
        let abandoned = all
            .iter()
            .filter_map(|task| task.future.lock().unwrap().take())
            .collect::<Vec<_>>();
        debug!(?now, polls, abandoned = abandoned.len(), "run finished");
        drop(abandoned);
        executor.sleeping.lock().unwrap().clear();
        executor.tasks.ready.lock().unwrap().clear();
        executor.tasks.handoff.lock().unwrap().clear();

        result.map(|()| Summary { now, polls, tasks })
    }
}

/// Implementation of [`crate::Spawner`], [`crate::Clock`] and [`crate::Metrics`]
/// for the `deterministic` runtime.
pub struct Context {
    label: String,
    executor: Arc<Executor>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // Get metrics
        let label = self.label.clone();
        let work = Work {
            label: label.clone(),
        };
        self.executor
            .metrics
            .tasks_spawned
            .get_or_create(&work)
            .inc();
        let gauge = self
            .executor
            .metrics
            .tasks_running
            .get_or_create(&work)
            .clone();

        // Set up the task
        let executor = self.executor.clone();
        let future = f(self);
        let (f, handle) = Handle::init(future, gauge);

        // Spawn the task
        Tasks::register(&executor.tasks, &label, Box::pin(f));
        handle
    }
}

impl crate::Metrics for Context {
    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{}_{}", prefix, label)
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            executor: self.executor.clone(),
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed_name = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{}_{}", *prefix, name)
            }
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(prefixed_name, help, metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

struct Sleeper {
    executor: Arc<Executor>,
    time: Duration,
    registered: bool,
}

struct Alarm {
    time: Duration,
    sequence: u64,
    waker: Waker,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time) && self.sequence.eq(&other.sequence)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap (earliest time, then earliest registration)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl Future for Sleeper {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        // Always yield at least once, even if the deadline has already passed
        if !self.registered {
            self.registered = true;
            self.executor.arm(self.time, cx.waker().clone());
            return Poll::Pending;
        }
        {
            let current_time = *self.executor.time.lock().unwrap();
            if current_time >= self.time {
                return Poll::Ready(());
            }
        }
        *self.executor.armed.lock().unwrap() = true;
        Poll::Pending
    }
}

impl Clock for Context {
    fn current(&self) -> Duration {
        *self.executor.time.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self
            .current()
            .checked_add(duration)
            .expect("overflow when setting wake time");
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: Duration) -> impl Future<Output = ()> + Send + 'static {
        Sleeper {
            executor: self.executor.clone(),

            time: deadline,
            registered: false,
        }
    }
}
