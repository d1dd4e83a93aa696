use std::{
    fmt,
    iter::FusedIterator,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use crate::{
    channel::BoundedChannel,
    config::{Config, DEFAULT_POLL_INTERVAL},
    drop::defer,
    error::{Error, Result},
    iter::ResultIter,
    merge,
    producer::{Producer, ProducerTask, TaskState},
    sync::{Condvar, Mutex},
    worker::{Worker, WorkerBuilder},
};

/// The consumer side of one or more running producers.
///
/// A [`ResultHandle`] owns everything a stream needs: the producer task(s), the worker threads
/// running them, and the bounded buffer in between. Values are read through
/// [`ResultHandle::iter`], [`ResultHandle::to_list`], or by iterating over the handle.
///
/// Dropping the handle closes it (see [`ResultHandle::close`]), so a consumer that stops early,
/// returns with `?` or panics never leaves a producer thread running.
///
/// # Examples
///
/// Stop reading an infinite stream after a few values:
///
/// ```
/// use tributary::{Config, ResultHandle};
///
/// let mut handle = ResultHandle::from_iter(0u64.., &Config::new().buffer_size(16)).unwrap();
/// let firsts: Vec<u64> = handle.iter().take(5).map(|r| r.unwrap()).collect();
/// assert_eq!(firsts, [0, 1, 2, 3, 4]);
/// handle.close();
/// ```
pub struct ResultHandle<T: Send + 'static> {
    iter: ResultIter<T>,
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    channel: Arc<BoundedChannel<T>>,
    tasks: Vec<Arc<ProducerTask<T>>>,
    workers: Mutex<Vec<Worker>>,
    /// Threads of `workers`, kept after they were taken for joining.
    worker_threads: Vec<ThreadId>,
    closed: AtomicBool,
    teardown: Mutex<TeardownState>,
    torn_down: Condvar,
}

#[derive(Default)]
struct TeardownState {
    /// Thread running the teardown, while it runs.
    closing: Option<ThreadId>,
    done: bool,
}

impl<T: Send + 'static> Shared<T> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.wait_for_teardown();
            return;
        }
        self.teardown.lock().closing = Some(thread::current().id());
        let _done = defer(|| {
            let mut state = self.teardown.lock();
            state.closing = None;
            state.done = true;
            self.torn_down.notify_all();
        });
        log::debug!("closing result handle ({} producers)", self.tasks.len());

        for task in &self.tasks {
            task.dispose();
        }
        self.channel.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        // A producer closing its own handle cannot wait for itself to exit. The threads finish
        // on their own once the current callback returns.
        let reentrant = self.runs_on_owned_thread();
        for worker in workers {
            if reentrant {
                worker.detach();
            } else {
                worker.join();
            }
        }
    }

    /// Blocks until the teardown started by another `close` call has finished.
    ///
    /// Returns right away when called from a thread the teardown itself is waiting on: a
    /// producer or dispatcher thread, or the closing thread (through a hook it runs).
    fn wait_for_teardown(&self) {
        if self.runs_on_owned_thread() {
            return;
        }
        let current = thread::current().id();
        let mut state = self.teardown.lock();
        while !state.done && state.closing != Some(current) {
            state = self.torn_down.wait_timeout(state, DEFAULT_POLL_INTERVAL);
        }
    }

    fn runs_on_owned_thread(&self) -> bool {
        let current = thread::current().id();
        self.worker_threads.contains(&current)
            || self.tasks.iter().any(|task| task.runs_on_current_thread())
    }
}

trait Teardown: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send + 'static> Teardown for Shared<T> {
    fn close(&self) {
        Shared::close(self);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Closes a [`ResultHandle`] from another thread.
///
/// Obtained from [`ResultHandle::closer`]. Closing through a [`Closer`] is equivalent to calling
/// [`ResultHandle::close`], and may happen while the handle is being iterated: the iterating
/// thread then sees the end of the stream.
#[derive(Clone)]
pub struct Closer(Arc<dyn Teardown>);

impl Closer {
    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> ResultHandle<T> {
    /// Starts `producer` on a new worker thread.
    ///
    /// Fails with [`Error::InvalidArgument`] if `config` is invalid (in which case nothing is
    /// started and no hook runs), and with [`Error::Spawn`] if the thread could not be created.
    pub fn spawn(producer: Producer<T>, config: &Config) -> Result<Self> {
        config.validate()?;
        let (channel, iter) = Self::open(config)?;

        let producer = match config.get_name() {
            Some(name) if producer.get_name().is_none() => producer.name(name),
            _ => producer,
        };
        let task = ProducerTask::new(
            producer,
            channel.clone(),
            channel.clone(),
            config.get_poll_interval(),
        );

        let runner = task.clone();
        let worker = match WorkerBuilder::new()
            .name(task.name().to_string())
            .spawn(move || runner.run())
        {
            Ok(worker) => worker,
            Err(e) => {
                task.dispose();
                return Err(e.into());
            }
        };

        Ok(Self::assemble(iter, channel, vec![task], vec![worker]))
    }

    /// Streams the values of `values` through a bounded buffer, produced on a worker thread.
    ///
    /// `values` may be infinite; closing the handle stops it.
    pub fn from_iter<I>(values: I, config: &Config) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let values = values.into_iter();
        Self::spawn(
            Producer::new(move |emitter| Ok(emitter.emit_all(values)?)),
            config,
        )
    }

    /// Merges several producers into one stream.
    ///
    /// Producers are started in order, with at most [`Config::max_concurrent`] of them running at
    /// any time. Values of concurrently running producers interleave arbitrarily. The stream
    /// completes once all producers have completed; the first failing producer fails it, and the
    /// producers still running or waiting are disposed.
    ///
    /// An empty list of producers or an invalid `config` is an [`Error::InvalidArgument`]. In
    /// that case no producer runs, but their hooks still fire.
    pub fn merge<I>(producers: I, config: &Config) -> Result<Self>
    where
        I: IntoIterator<Item = Producer<T>>,
    {
        let producers: Vec<_> = producers.into_iter().collect();
        if producers.is_empty() {
            return Err(Error::invalid_argument("no producers to merge"));
        }
        if let Err(e) = config.validate() {
            for producer in producers {
                producer.discard();
            }
            return Err(e);
        }

        let (channel, iter) = Self::open(config)?;
        let (tasks, dispatcher) = merge::start(producers, channel.clone(), config)?;
        Ok(Self::assemble(iter, channel, tasks, vec![dispatcher]))
    }

    fn open(config: &Config) -> Result<(Arc<BoundedChannel<T>>, ResultIter<T>)> {
        let channel = Arc::new(BoundedChannel::new(config.get_buffer_size())?);
        let iter = ResultIter::new(
            channel.clone(),
            config.get_delay_error(),
            config.get_poll_interval(),
        );
        Ok((channel, iter))
    }

    fn assemble(
        iter: ResultIter<T>,
        channel: Arc<BoundedChannel<T>>,
        tasks: Vec<Arc<ProducerTask<T>>>,
        workers: Vec<Worker>,
    ) -> Self {
        let worker_threads = workers.iter().filter_map(Worker::thread_id).collect();
        Self {
            iter,
            shared: Arc::new(Shared {
                channel,
                tasks,
                workers: Mutex::new(workers),
                worker_threads,
                closed: AtomicBool::new(false),
                teardown: Mutex::new(TeardownState::default()),
                torn_down: Condvar::new(),
            }),
        }
    }

    /// Returns the blocking iterator over the produced values.
    #[inline]
    pub fn iter(&mut self) -> &mut ResultIter<T> {
        &mut self.iter
    }

    /// Blocks until the stream has ended and returns all values not read yet.
    ///
    /// If the producer failed, its error is returned and the values are lost. If the handle is
    /// closed concurrently, the values read so far are returned.
    pub fn to_list(&mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        while self.iter.has_next()? {
            values.push(self.iter.try_next()?);
        }
        Ok(values)
    }

    /// Stops the producers and releases the stream.
    ///
    /// Running producers are cancelled (a producer blocked in
    /// [`Emitter::emit`](crate::Emitter::emit) wakes up within one poll interval), buffered
    /// values are dropped, and the worker threads are joined. Once this returns, every
    /// producer's post-process hook and listeners have run exactly once.
    ///
    /// Calling this again does nothing. A call racing with another thread's `close` returns
    /// only once that teardown has finished, unless it is made from a producer's own thread.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns a [`Closer`] that can close this handle from another thread.
    pub fn closer(&self) -> Closer {
        Closer(self.shared.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Current state of each producer task, in the order they were supplied.
    pub fn task_states(&self) -> Vec<TaskState> {
        self.shared.tasks.iter().map(|task| task.state()).collect()
    }

    /// Total number of values emitted by all producers so far.
    pub fn processed(&self) -> u64 {
        self.shared.tasks.iter().map(|task| task.processed()).sum()
    }
}

impl<T: Send + 'static> Drop for ResultHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// An owning iterator over a [`ResultHandle`], created by its [`IntoIterator`] implementation.
///
/// Dropping it closes the handle.
pub struct IntoIter<T: Send + 'static> {
    handle: ResultHandle<T>,
}

impl<T: Send + 'static> IntoIter<T> {
    /// Returns a [`Closer`] for the underlying handle.
    pub fn closer(&self) -> Closer {
        self.handle.closer()
    }
}

impl<T: Send + 'static> Iterator for IntoIter<T> {
    type Item = Result<T>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.handle.iter.next()
    }
}

impl<T: Send + 'static> FusedIterator for IntoIter<T> {}

impl<T: Send + 'static> IntoIterator for ResultHandle<T> {
    type Item = Result<T>;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { handle: self }
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a mut ResultHandle<T> {
    type Item = Result<T>;
    type IntoIter = &'a mut ResultIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        &mut self.iter
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use crate::test::{failing, range, HookCounter};

    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn config(buffer_size: usize) -> Config {
        Config::new().buffer_size(buffer_size).poll_interval(TICK)
    }

    fn endless() -> Producer<u64> {
        Producer::new(|emitter| {
            let mut i = 0;
            loop {
                emitter.emit(i)?;
                i += 1;
            }
        })
    }

    fn wait_finalized<T: Send + 'static>(handle: &ResultHandle<T>) {
        while handle
            .task_states()
            .iter()
            .any(|state| *state != TaskState::Finalized)
        {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn thousand_values_through_small_buffer() {
        let mut handle = range(1..=1000).run_with(&config(100)).unwrap();
        assert_eq!(handle.to_list().unwrap(), (1..=1000).collect::<Vec<_>>());
        assert_eq!(handle.processed(), 1000);
    }

    #[test]
    fn fail_fast_discards_unread_values() {
        let mut handle = failing(1..=2000, 512)
            .run_with(&config(2048).delay_error(false))
            .unwrap();
        wait_finalized(&handle);

        let items: Vec<_> = handle.iter().collect();
        let values = items.iter().filter(|item| item.is_ok()).count();
        assert!(values < 512);
        assert!(matches!(items.last(), Some(Err(Error::Producer(_)))));
    }

    #[test]
    fn delayed_error_follows_every_value() {
        let mut handle = failing(1..=1000, 512).run_with(&config(64)).unwrap();
        let items: Vec<_> = handle.iter().collect();
        assert_eq!(items.len(), 513);
        for (item, expected) in items.iter().zip(1..=512) {
            assert_eq!(*item.as_ref().unwrap(), expected);
        }
        assert!(matches!(items[512], Err(Error::Producer(_))));
        assert!(matches!(handle.iter().try_next(), Err(Error::Producer(_))));
    }

    #[test]
    fn close_stops_blocked_producer_once() {
        let hook = HookCounter::default();
        let mut handle = endless()
            .post_process(hook.hook())
            .run_with(&config(4))
            .unwrap();
        assert_eq!(handle.iter().try_next().unwrap(), 0);
        assert_eq!(handle.iter().try_next().unwrap(), 1);

        handle.close();
        assert!(handle.is_closed());
        assert_eq!(hook.calls(), 1);
        assert!(hook.last().unwrap().is_success());
        assert_eq!(handle.task_states(), [TaskState::Finalized]);

        handle.close();
        drop(handle);
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn close_from_another_thread_ends_iteration() {
        let hook = HookCounter::default();
        let mut handle = endless()
            .post_process(hook.hook())
            .run_with(&config(8))
            .unwrap();
        let closer = handle.closer();
        let t = thread::spawn(move || {
            thread::sleep(TICK * 3);
            closer.close();
        });

        let mut seen = 0;
        for item in &mut handle {
            item.unwrap();
            seen += 1;
        }
        t.join().unwrap();
        assert!(seen > 0);
        assert!(handle.is_closed());
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn concurrent_close_tears_down_once() {
        let hook = HookCounter::default();
        let handle = endless()
            .post_process(hook.hook())
            .run_with(&config(8))
            .unwrap();
        let closers: Vec<Closer> = (0..4).map(|_| handle.closer()).collect();
        let threads: Vec<_> = closers
            .into_iter()
            .map(|closer| thread::spawn(move || closer.close()))
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        handle.close();
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn zero_buffer_is_rejected_before_start() {
        let hook = HookCounter::default();
        let res = range(1..=3).post_process(hook.hook()).run_with(&config(0));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        assert_eq!(hook.calls(), 0);
    }

    #[test]
    fn empty_merge_is_rejected() {
        let res = ResultHandle::<u32>::merge(Vec::new(), &config(8));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn invalid_merge_releases_producers() {
        let hook = HookCounter::default();
        let producers = vec![
            range(1..=3).post_process(hook.hook()),
            range(4..=6).post_process(hook.hook()),
        ];
        let res = ResultHandle::merge(producers, &config(8).max_concurrent(0));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        assert_eq!(hook.calls(), 2);
    }

    #[test]
    fn merged_stream_completes() {
        let producers = vec![range(1..=50), range(51..=100), range(101..=150)];
        let handle = ResultHandle::merge(producers, &config(16).max_concurrent(2)).unwrap();
        let mut values: Vec<u32> = handle.into_iter().map(|r| r.unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, (1..=150).collect::<Vec<_>>());
    }

    #[test]
    fn closing_merged_stream_finalizes_all() {
        let hook = HookCounter::default();
        let producers = (0..3).map(|_| endless().post_process(hook.hook()));
        let mut handle = ResultHandle::merge(producers, &config(4).max_concurrent(1)).unwrap();
        handle.iter().try_next().unwrap();
        handle.close();
        assert_eq!(hook.calls(), 3);
        assert_eq!(handle.task_states(), [TaskState::Finalized; 3]);
    }

    #[test]
    fn infinite_iterator_source() {
        let handle = ResultHandle::from_iter(1u64.., &config(32)).unwrap();
        let sum: u64 = handle.into_iter().take(100).map(|r| r.unwrap()).sum();
        assert_eq!(sum, 5050);
    }

    #[test]
    fn dropping_owned_iterator_closes() {
        let hook = HookCounter::default();
        let handle = endless()
            .post_process(hook.hook())
            .run_with(&config(4))
            .unwrap();
        let mut iter = handle.into_iter();
        let closer = iter.closer();
        assert_eq!(iter.next().unwrap().unwrap(), 0);
        drop(iter);
        assert!(closer.is_closed());
        assert_eq!(hook.calls(), 1);
    }

    #[test]
    fn producer_may_close_its_own_handle() {
        let slot: Arc<Mutex<Option<Closer>>> = Arc::default();
        let s = slot.clone();
        let hook = HookCounter::default();
        let producer = Producer::<u32>::new(move |emitter| {
            emitter.emit(1)?;
            let closer = loop {
                if let Some(closer) = s.lock().take() {
                    break closer;
                }
                thread::yield_now();
            };
            closer.close();
            emitter.emit(2)?;
            Ok(())
        })
        .post_process(hook.hook());

        let mut handle = producer.run_with(&config(4)).unwrap();
        *slot.lock() = Some(handle.closer());
        let values = handle.to_list().unwrap();
        assert!(values.len() <= 1);
        assert!(handle.is_closed());
        wait_finalized(&handle);
        assert_eq!(hook.calls(), 1);
        assert_eq!(hook.last().unwrap().processed(), 1);
    }

    #[test]
    fn fail_fast_preempts_values_buffered_while_reading() {
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let producer = Producer::<u32>::new(move |emitter| {
            emitter.emit(1)?;
            go_rx.recv()?;
            emitter.emit_all(2..=4)?;
            Err("source lost".into())
        });
        let mut handle = producer.run_with(&config(8).delay_error(false)).unwrap();

        assert_eq!(handle.iter().try_next().unwrap(), 1);
        go_tx.send(()).unwrap();
        wait_finalized(&handle);
        assert_eq!(handle.shared.channel.len(), 3);

        assert!(matches!(handle.iter().has_next(), Err(Error::Producer(_))));
        assert!(handle.shared.channel.is_empty());
        let rest: Vec<_> = handle.iter().collect();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].is_err());
    }

    #[test]
    fn racing_close_waits_for_teardown() {
        let hook = HookCounter::default();
        let mut handle = Producer::<u32>::new(|emitter| {
            emitter.emit(1)?;
            thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .post_process(hook.hook())
        .run_with(&config(4))
        .unwrap();
        assert_eq!(handle.iter().try_next().unwrap(), 1);

        let closer = handle.closer();
        let watch = closer.clone();
        let t = thread::spawn(move || closer.close());
        while !watch.is_closed() {
            thread::yield_now();
        }
        // The other thread is still joining the producer.
        drop(handle);
        assert_eq!(hook.calls(), 1);
        t.join().unwrap();
    }

    #[test]
    fn hook_closing_during_close_does_not_hang() {
        let slot: Arc<Mutex<Option<Closer>>> = Arc::default();
        let s = slot.clone();
        let hook = HookCounter::default();
        let count = hook.hook();
        let producers = vec![
            endless(),
            endless().post_process(move |result| {
                let closer = s.lock().take();
                if let Some(closer) = closer {
                    closer.close();
                }
                count(result);
            }),
        ];
        let mut handle = ResultHandle::merge(producers, &config(4).max_concurrent(1)).unwrap();
        *slot.lock() = Some(handle.closer());
        handle.iter().try_next().unwrap();
        handle.close();
        assert_eq!(hook.calls(), 1);
        assert!(handle.task_states().iter().all(|state| *state == TaskState::Finalized));
    }

    #[test]
    fn hook_on_dispatcher_thread_may_close() {
        let slot: Arc<Mutex<Option<Closer>>> = Arc::default();
        let s = slot.clone();
        let hook = HookCounter::default();
        let count = hook.hook();
        // The second producer never starts: the dispatcher finalizes it after the first fails.
        let producers = vec![
            failing(1..=3, 1),
            range(10..=12).post_process(move |result| {
                let closer = s.lock().take();
                if let Some(closer) = closer {
                    closer.close();
                }
                count(result);
            }),
        ];
        let mut handle = ResultHandle::merge(producers, &config(4).max_concurrent(1)).unwrap();
        *slot.lock() = Some(handle.closer());
        let _ = handle.iter().count();
        while hook.calls() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(handle);
        assert_eq!(hook.calls(), 1);
    }
}
