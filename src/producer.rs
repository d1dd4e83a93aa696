//! Producer definitions and their running tasks.
//!
//! A [`Producer`] is plain data: the `execute` closure that generates values, plus an optional
//! post-process hook and [`Listener`]s. Starting it (through [`Producer::run`] or a
//! [`ResultHandle`] constructor) turns it into a `ProducerTask` that runs on its own worker
//! thread and feeds a [`BoundedChannel`].
//!
//! A task goes through `Created → Running → {Completed, Failed, Disposed} → Finalized`. Whatever
//! path it takes, it is finalized exactly once: the [`ExecResult`] is built, every listener's
//! `on_finish` is called and the post-process hook runs.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crate::{
    channel::BoundedChannel,
    config::Config,
    error::{BoxError, Cancelled, Error, Result},
    exec::ExecResult,
    handle::ResultHandle,
    listener::Listener,
    sync::Mutex,
};

type ExecuteFn<T> = Box<dyn FnOnce(&Emitter<T>) -> std::result::Result<(), BoxError> + Send>;
type PostProcessFn = Box<dyn FnOnce(&ExecResult) + Send>;

/// Where a task reports its terminal event.
///
/// A lone producer reports straight to its channel. Producers merged into one stream report to a
/// wrapper that only forwards failures, since the merged stream completes once *all* of them
/// have completed.
pub(crate) trait TerminalSink: Send + Sync {
    fn on_complete(&self);
    fn on_error(&self, error: Error);
}

impl<T: Send> TerminalSink for BoundedChannel<T> {
    fn on_complete(&self) {
        self.complete();
    }

    fn on_error(&self, error: Error) {
        self.fail(error);
    }
}

/// Definition of a producer: the work that emits values, and the hooks around it.
///
/// # Examples
///
/// ```
/// use tributary::{Config, Producer};
///
/// let producer = Producer::new(|emitter| {
///     for i in 1..=1000 {
///         emitter.emit(i)?;
///     }
///     Ok(())
/// });
///
/// let mut handle = producer.run_with(&Config::new().buffer_size(100)).unwrap();
/// let values = handle.to_list().unwrap();
/// assert_eq!(values, (1..=1000).collect::<Vec<_>>());
/// ```
pub struct Producer<T> {
    execute: ExecuteFn<T>,
    post_process: Option<PostProcessFn>,
    listeners: Vec<Arc<dyn Listener>>,
    name: Option<String>,
}

impl<T: Send + 'static> Producer<T> {
    /// Creates a producer that runs `execute` once on a worker thread.
    ///
    /// `execute` emits values through the [`Emitter`] it is passed. Returning `Ok(())` completes
    /// the stream; returning any error other than [`Cancelled`] fails it, and the consumer will
    /// see [`Error::Producer`].
    pub fn new<F>(execute: F) -> Self
    where
        F: FnOnce(&Emitter<T>) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        Self {
            execute: Box::new(execute),
            post_process: None,
            listeners: Vec::new(),
            name: None,
        }
    }

    /// Creates a producer that calls `step` repeatedly, waiting `period` between calls.
    ///
    /// The producer stops when `step` returns `Ok(false)`, returns an error, or the producer is
    /// cancelled. Cancellation also interrupts the wait between two calls.
    ///
    /// Returns [`Error::InvalidArgument`] if `period` is zero.
    pub fn interval<F>(period: Duration, mut step: F) -> Result<Self>
    where
        F: FnMut(&Emitter<T>) -> std::result::Result<bool, BoxError> + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::invalid_argument("interval must be greater than 0"));
        }
        Ok(Self::new(move |emitter| {
            while !emitter.is_cancelled() {
                if !step(emitter)? {
                    break;
                }
                emitter.sleep(period)?;
            }
            Ok(())
        }))
    }

    /// Sets a hook that runs once after the producer has finished, however it finished.
    ///
    /// This is the place to release resources held by the producer.
    pub fn post_process<F>(self, hook: F) -> Self
    where
        F: FnOnce(&ExecResult) + Send + 'static,
    {
        Self {
            post_process: Some(Box::new(hook)),
            ..self
        }
    }

    /// Registers a [`Listener`]. Listeners are notified in registration order.
    pub fn listener<L: Listener + 'static>(self, listener: L) -> Self {
        self.shared_listener(Arc::new(listener))
    }

    /// Registers a [`Listener`] that is shared with other producers.
    pub fn shared_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the name used for this producer's worker thread and log messages.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Starts the producer with the default [`Config`].
    pub fn run(self) -> Result<ResultHandle<T>> {
        ResultHandle::spawn(self, &Config::default())
    }

    /// Starts the producer with the given [`Config`].
    pub fn run_with(self, config: &Config) -> Result<ResultHandle<T>> {
        ResultHandle::spawn(self, config)
    }

    pub(crate) fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the finishing hooks of a producer that will never be started.
    pub(crate) fn discard(self) {
        let name = self.name.as_deref().unwrap_or("producer");
        let result = ExecResult::new(0, Duration::ZERO, None);
        for listener in &self.listeners {
            quietly(name, "listener on_finish", || listener.on_finish(&result));
        }
        if let Some(hook) = self.post_process {
            quietly(name, "post-process hook", || hook(&result));
        }
    }
}

/// Lifecycle state of a started producer, as reported by
/// [`ResultHandle::task_states`](crate::ResultHandle::task_states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not started yet.
    Created,
    /// `execute` is running.
    Running,
    /// `execute` returned successfully.
    Completed,
    /// `execute` returned an error or panicked.
    Failed,
    /// The task was cancelled, either before it started or while running.
    Disposed,
    /// Terminal: listeners and the post-process hook have run.
    Finalized,
}

/// A started [`Producer`].
///
/// Tasks are owned by a [`ResultHandle`]; closing the handle disposes them.
pub(crate) struct ProducerTask<T> {
    channel: Arc<BoundedChannel<T>>,
    sink: Arc<dyn TerminalSink>,
    execute: Mutex<Option<ExecuteFn<T>>>,
    post_process: Mutex<Option<PostProcessFn>>,
    listeners: Vec<Arc<dyn Listener>>,
    name: String,
    poll_interval: Duration,

    state: Mutex<TaskState>,
    /// Set once by `dispose`. Emitting threads load it with `Acquire`.
    disposed: AtomicBool,
    finalized: AtomicBool,
    processed: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    runner: Mutex<Option<ThreadId>>,
    /// Protocol violation detected while emitting.
    fault: Mutex<Option<Error>>,
}

impl<T: Send + 'static> ProducerTask<T> {
    pub(crate) fn new(
        producer: Producer<T>,
        channel: Arc<BoundedChannel<T>>,
        sink: Arc<dyn TerminalSink>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let name = producer.name.unwrap_or_else(|| "producer".into());
        Arc::new(Self {
            channel,
            sink,
            execute: Mutex::new(Some(producer.execute)),
            post_process: Mutex::new(producer.post_process),
            listeners: producer.listeners,
            name,
            poll_interval,
            state: Mutex::new(TaskState::Created),
            disposed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            started_at: Mutex::new(None),
            runner: Mutex::new(None),
            fault: Mutex::new(None),
        })
    }

    /// Runs the producer to its end on the calling thread, then finalizes it.
    ///
    /// Only the first call does anything, and only if the task was not disposed before.
    pub(crate) fn run(self: &Arc<Self>) {
        let execute = {
            let mut state = self.state.lock();
            if *state != TaskState::Created {
                return;
            }
            *state = TaskState::Running;
            self.execute.lock().take()
        };
        let Some(execute) = execute else {
            return;
        };

        *self.runner.lock() = Some(thread::current().id());
        if self.is_disposed() {
            drop(execute);
            log::debug!("{}: disposed before it started", self.name);
            self.sink.on_complete();
            self.finish(TaskState::Disposed, None);
            return;
        }

        *self.started_at.lock() = Some(Instant::now());
        for listener in &self.listeners {
            quietly(&self.name, "listener on_start", || listener.on_start());
        }

        let emitter = Emitter { task: self.clone() };
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| execute(&emitter))) {
            Ok(res) => res,
            Err(payload) => {
                let error = Error::ProducerPanicked(panic_message(&*payload));
                self.sink.on_error(error.clone());
                self.finish(TaskState::Failed, Some(error));
                return;
            }
        };
        drop(emitter);

        match outcome {
            Ok(()) => {
                self.sink.on_complete();
                self.finish(TaskState::Completed, None);
            }
            Err(e) if e.is::<Cancelled>() || self.is_disposed() => {
                let fault = self.fault.lock().take();
                if let Some(fault) = fault {
                    self.finish(TaskState::Failed, Some(fault));
                    return;
                }
                log::debug!("{}: stopped by cancellation", self.name);
                // Nobody may be waiting for this stream anymore, but if someone is, they must
                // not be left hanging.
                self.sink.on_complete();
                self.finish(TaskState::Disposed, None);
            }
            Err(e) => {
                let error = Error::producer(e);
                self.sink.on_error(error.clone());
                self.finish(TaskState::Failed, Some(error));
            }
        }
    }

    fn finish(&self, state: TaskState, error: Option<Error>) {
        *self.state.lock() = state;
        self.finalize(error);
    }

    fn finalize(&self, error: Option<Error>) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let elapsed = self
            .started_at
            .lock()
            .map_or(Duration::ZERO, |start| start.elapsed());
        let result = ExecResult::new(self.processed(), elapsed, error);
        log::debug!("{}: finalized ({result})", self.name);

        for listener in &self.listeners {
            quietly(&self.name, "listener on_finish", || listener.on_finish(&result));
        }
        let hook = self.post_process.lock().take();
        if let Some(hook) = hook {
            quietly(&self.name, "post-process hook", || hook(&result));
        }
        *self.state.lock() = TaskState::Finalized;
    }

    /// Cancels the task.
    ///
    /// A task blocked in [`Emitter::emit`] wakes up and unwinds. A task that has not started yet
    /// never runs its `execute` closure and is finalized right away. Calling this more than once
    /// has no further effect.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("{}: disposed", self.name);
        self.channel.wake_producers();

        let never_started = {
            let mut state = self.state.lock();
            if *state == TaskState::Created {
                *state = TaskState::Disposed;
                true
            } else {
                false
            }
        };
        if never_started {
            self.execute.lock().take();
            self.finalize(None);
        }
    }

    /// Returns `true` when called from inside this task's `execute` closure.
    pub(crate) fn runs_on_current_thread(&self) -> bool {
        *self.runner.lock() == Some(thread::current().id())
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Number of values emitted so far.
    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// The handle a producer's `execute` closure uses to emit values.
///
/// Every method returns [`Cancelled`] once the consumer has gone away; propagate it with `?` so
/// the producer stops promptly.
pub struct Emitter<T> {
    task: Arc<ProducerTask<T>>,
}

impl<T: Send + 'static> Emitter<T> {
    /// Hands `value` to the consumer.
    ///
    /// Blocks while the consumer has not granted capacity for another value.
    pub fn emit(&self, value: T) -> std::result::Result<(), Cancelled> {
        let task = &*self.task;
        task.channel
            .acquire_credit(&task.disposed, task.poll_interval)?;
        if task.is_disposed() {
            return Err(Cancelled);
        }
        match task.channel.try_push(value) {
            Ok(()) => {
                task.processed.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(error) => {
                log::error!("{}: {error}", task.name);
                task.sink.on_error(error.clone());
                *task.fault.lock() = Some(error);
                Err(Cancelled)
            }
        }
    }

    /// Emits every value of `values` in order, stopping at the first cancellation.
    pub fn emit_all<I>(&self, values: I) -> std::result::Result<(), Cancelled>
    where
        I: IntoIterator<Item = T>,
    {
        values.into_iter().try_for_each(|value| self.emit(value))
    }

    /// Returns `true` once the producer should stop.
    ///
    /// Long-running computations between two emits can check this to bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_disposed() || self.task.channel.is_cancelled()
    }

    /// Waits for `dur`, returning early with [`Cancelled`] if the producer is cancelled.
    pub fn sleep(&self, dur: Duration) -> std::result::Result<(), Cancelled> {
        let task = &*self.task;
        task.channel.sleep(&task.disposed, dur, task.poll_interval)
    }

    /// Number of values emitted so far.
    pub fn processed(&self) -> u64 {
        self.task.processed()
    }
}

/// Runs a user callback, logging instead of propagating a panic so finalization always finishes.
fn quietly(name: &str, what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        log::error!("{name}: {what} panicked: {}", panic_message(&*payload));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{panic::resume_unwind, thread};

    use crate::{
        channel::Polled,
        test::{range, Events, HookCounter},
    };

    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn start<T: Send + 'static>(
        producer: Producer<T>,
        capacity: usize,
    ) -> (Arc<BoundedChannel<T>>, Arc<ProducerTask<T>>) {
        let channel = Arc::new(BoundedChannel::new(capacity).unwrap());
        let task = ProducerTask::new(producer, channel.clone(), channel.clone(), TICK);
        (channel, task)
    }

    fn drain(channel: &BoundedChannel<u32>) -> std::result::Result<Vec<u32>, Error> {
        let mut out = Vec::new();
        loop {
            match channel.poll(TICK) {
                Polled::Value(v) => out.push(v),
                Polled::Empty => {}
                Polled::Completed | Polled::Closed => return Ok(out),
                Polled::Failed(e) => return Err(e),
            }
        }
    }

    #[test]
    fn completes_and_finalizes_once() {
        let hook = HookCounter::default();
        let (channel, task) = start(range(1..=5).post_process(hook.hook()), 8);
        channel.request_credits(8);
        task.run();
        assert_eq!(drain(&channel).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(task.state(), TaskState::Finalized);
        assert_eq!(hook.calls(), 1);
        assert_eq!(hook.last().unwrap().processed(), 5);
        assert!(hook.last().unwrap().is_success());

        // Running or disposing again changes nothing.
        task.run();
        task.dispose();
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn dispose_before_start_skips_execute() {
        let hook = HookCounter::default();
        let events = Events::default();
        let (_channel, task) = start(
            Producer::<u32>::new(|_| panic!("must not run"))
                .post_process(hook.hook())
                .listener(events.listener("a")),
            1,
        );
        task.dispose();
        assert_eq!(task.state(), TaskState::Finalized);
        task.run();
        assert_eq!(hook.calls(), 1);
        assert_eq!(events.take(), ["a:finish"]);
    }

    #[test]
    fn disposal_after_pickup_skips_on_start() {
        let hook = HookCounter::default();
        let events = Events::default();
        let (channel, task) = start(
            Producer::<u32>::new(|_| panic!("must not run"))
                .post_process(hook.hook())
                .listener(events.listener("a")),
            1,
        );
        // Disposed after the worker took the task, before `execute` began.
        task.disposed.store(true, Ordering::Release);
        task.run();
        assert_eq!(events.take(), ["a:finish"]);
        assert_eq!(hook.calls(), 1);
        assert!(hook.last().unwrap().is_success());
        assert_eq!(task.state(), TaskState::Finalized);
        assert!(matches!(channel.poll(TICK), Polled::Completed));
    }

    #[test]
    fn dispose_unblocks_emit() {
        let hook = HookCounter::default();
        let (channel, task) = start(range(1..=100).post_process(hook.hook()), 4);
        channel.request_credits(4);
        let t = task.clone();
        let worker = thread::spawn(move || t.run());

        while channel.len() < 4 {
            thread::yield_now();
        }
        assert_eq!(task.state(), TaskState::Running);
        task.dispose();
        worker.join().unwrap();

        assert_eq!(task.state(), TaskState::Finalized);
        assert_eq!(hook.calls(), 1);
        let result = hook.last().unwrap();
        assert_eq!(result.processed(), 4);
        assert!(result.is_success());
        // The values emitted before cancellation are still there.
        assert_eq!(channel.len(), 4);
    }

    #[test]
    fn error_fails_channel() {
        #[derive(Debug, thiserror::Error)]
        #[error("bad input")]
        struct BadInput;

        let hook = HookCounter::default();
        let producer = Producer::new(|emitter| {
            emitter.emit(1)?;
            Err(BadInput.into())
        })
        .post_process(hook.hook());
        let (channel, task) = start(producer, 4);
        channel.request_credits(4);
        task.run();

        let err = drain(&channel).unwrap_err();
        assert!(err.producer_error().unwrap().is::<BadInput>());
        let result = hook.last().unwrap();
        assert_eq!(result.processed(), 1);
        assert!(matches!(result.error(), Some(Error::Producer(_))));
    }

    #[test]
    fn panic_is_captured() {
        let hook = HookCounter::default();
        let producer = Producer::<u32>::new(|_| resume_unwind(Box::new("kaboom")))
            .post_process(hook.hook());
        let (channel, task) = start(producer, 1);
        task.run();
        match drain(&channel) {
            Err(Error::ProducerPanicked(msg)) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn panicking_hooks_do_not_escape() {
        let producer = Producer::<u32>::new(|_| Ok(()))
            .listener(crate::listener_fn(
                || resume_unwind(Box::new("start")),
                |_| resume_unwind(Box::new("finish")),
            ))
            .post_process(|_| resume_unwind(Box::new("post")));
        let (channel, task) = start(producer, 1);
        task.run();
        assert_eq!(task.state(), TaskState::Finalized);
        assert!(channel.is_terminated());
    }

    #[test]
    fn listeners_fire_in_order() {
        let events = Events::default();
        let producer = range(1..=2)
            .listener(events.listener("a"))
            .listener(events.listener("b"));
        let (channel, task) = start(producer, 2);
        channel.request_credits(2);
        task.run();
        let log = events.take();
        assert_eq!(&log[..2], ["a:start", "b:start"]);
        assert_eq!(log.len(), 4);
        assert!(log[2..].contains(&"a:finish".to_string()));
        assert!(log[2..].contains(&"b:finish".to_string()));
    }

    #[test]
    fn emit_all_stops_on_cancel() {
        let hook = HookCounter::default();
        let producer = Producer::new(|emitter| Ok(emitter.emit_all(0..1000)?))
            .post_process(hook.hook());
        let (channel, task) = start(producer, 10);
        channel.request_credits(3);
        let t = task.clone();
        let worker = thread::spawn(move || t.run());
        while task.processed() < 3 {
            thread::yield_now();
        }
        task.dispose();
        worker.join().unwrap();
        assert_eq!(hook.last().unwrap().processed(), 3);
    }

    #[test]
    fn overflow_fails_stream() {
        let producer = range(1..=3);
        let (channel, task) = start(producer, 1);
        // More credits than room: a protocol violation.
        channel.request_credits(3);
        task.run();
        assert_eq!(channel.len(), 1);
        assert!(matches!(
            channel.failure(),
            Some(Error::BufferOverflow { capacity: 1 })
        ));
        assert_eq!(task.state(), TaskState::Finalized);
    }

    #[test]
    fn interval_rejects_zero_period() {
        let res = Producer::<u32>::interval(Duration::ZERO, |_| Ok(false));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn interval_runs_until_step_declines() {
        let mut n = 0;
        let producer = Producer::interval(Duration::from_millis(1), move |emitter| {
            n += 1;
            emitter.emit(n)?;
            Ok(n < 3)
        })
        .unwrap();
        let (channel, task) = start(producer, 8);
        channel.request_credits(8);
        task.run();
        assert_eq!(drain(&channel).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn interval_sleep_is_cancellable() {
        let producer = Producer::<u32>::interval(Duration::from_secs(60), |emitter| {
            emitter.emit(1)?;
            Ok(true)
        })
        .unwrap();
        let (channel, task) = start(producer, 8);
        channel.request_credits(8);
        let t = task.clone();
        let worker = thread::spawn(move || t.run());
        while channel.is_empty() {
            thread::yield_now();
        }
        task.dispose();
        worker.join().unwrap();
        assert_eq!(task.state(), TaskState::Finalized);
    }
}
