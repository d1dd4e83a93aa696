//! The bounded, credit-controlled buffer between a producer and its consumer.
//!
//! A [`BoundedChannel`] holds up to `capacity` values in FIFO order plus a terminal slot that
//! records whether the producing side completed or failed. Producers do not push freely: they
//! first take a *credit* with [`BoundedChannel::acquire_credit`], and credits are only handed out
//! by the consuming side through [`BoundedChannel::request_credits`]. As long as the consumer
//! never grants more credits than it has free slots, a credited push always fits, and
//! [`Error::BufferOverflow`] indicates a broken protocol rather than a full buffer.
//!
//! Both sides block on condition variables. Every wait is additionally bounded by a caller-chosen
//! interval so that flags flipped without a notification (like a producer's `disposed` flag) are
//! noticed promptly.

use std::{
    collections::VecDeque,
    fmt, mem,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use crate::{
    error::{Cancelled, Error, Result},
    sync::{Condvar, Mutex, MutexGuard},
};

/// Outcome of [`BoundedChannel::poll`].
#[derive(Debug)]
pub enum Polled<T> {
    /// The oldest buffered value.
    Value(T),
    /// Nothing arrived before the timeout, and the producing side is still active.
    Empty,
    /// The buffer is drained and the producing side completed.
    Completed,
    /// The buffer is drained and the producing side failed.
    Failed(Error),
    /// The consuming side closed the channel. Any buffered values were dropped.
    Closed,
}

#[derive(Debug)]
enum Terminal {
    Active,
    Completed,
    Failed(Error),
}

struct State<T> {
    queue: VecDeque<T>,
    terminal: Terminal,
    /// Number of further pushes the consumer has authorized.
    credits: u64,
    /// Producers must stop emitting.
    cancelled: bool,
    /// The consumer is gone. Implies `cancelled`.
    closed: bool,
}

/// A fixed-capacity, thread-safe FIFO with a completion/error slot and backpressure credits.
pub struct BoundedChannel<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    /// Signalled when a value or terminal state arrives, or the channel is closed.
    readers: Condvar,
    /// Signalled when credits are granted, or the channel is cancelled/closed/terminated.
    writers: Condvar,
}

impl<T> BoundedChannel<T> {
    /// Creates an empty channel holding at most `capacity` values.
    ///
    /// Returns [`Error::InvalidArgument`] if `capacity` is 0. No credits are granted initially.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_argument("buffer size must be greater than 0"));
        }
        Ok(Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                terminal: Terminal::Active,
                credits: 0,
                cancelled: false,
                closed: false,
            }),
            capacity,
            readers: Condvar::new(),
            writers: Condvar::new(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffered, unread values.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of credits granted but not yet used by a producer.
    pub fn credits(&self) -> u64 {
        self.state.lock().credits
    }

    /// Returns `true` once [`complete`](Self::complete) or [`fail`](Self::fail) took effect.
    pub fn is_terminated(&self) -> bool {
        !matches!(self.state.lock().terminal, Terminal::Active)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Appends `value` if there is room for it.
    ///
    /// Returns [`Error::BufferOverflow`] if the buffer is full. If the channel has already
    /// terminated or was closed, the value is dropped silently, since nobody will read it.
    pub fn try_push(&self, value: T) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || !matches!(state.terminal, Terminal::Active) {
            drop(state);
            log::trace!("dropping value pushed after channel shutdown");
            return Ok(());
        }
        if state.queue.len() >= self.capacity {
            return Err(Error::BufferOverflow {
                capacity: self.capacity,
            });
        }
        state.queue.push_back(value);
        self.readers.notify_all();
        Ok(())
    }

    /// Authorizes `n` more pushes and wakes producers waiting for credit.
    pub fn request_credits(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.credits = state.credits.saturating_add(n as u64);
        self.writers.notify_all();
    }

    /// Takes one credit, blocking until one is available.
    ///
    /// Returns [`Cancelled`] instead if `cancel` is set, the channel was cancelled or closed, or
    /// the channel already terminated. `cancel` is re-checked at least once per `interval`.
    pub fn acquire_credit(&self, cancel: &AtomicBool, interval: Duration) -> Result<(), Cancelled> {
        let mut state = self.state.lock();
        loop {
            if cancel.load(Ordering::Acquire) || Self::stopped(&state) {
                return Err(Cancelled);
            }
            if state.credits > 0 {
                state.credits -= 1;
                return Ok(());
            }
            state = self.writers.wait_timeout(state, interval);
        }
    }

    /// Blocks the calling producer for `dur`, returning early with [`Cancelled`] under the same
    /// conditions as [`acquire_credit`](Self::acquire_credit).
    pub fn sleep(&self, cancel: &AtomicBool, dur: Duration, interval: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + dur;
        let mut state = self.state.lock();
        loop {
            if cancel.load(Ordering::Acquire) || Self::stopped(&state) {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self.writers.wait_timeout(state, (deadline - now).min(interval));
        }
    }

    /// Wakes producers blocked in [`acquire_credit`](Self::acquire_credit) or
    /// [`sleep`](Self::sleep) so they re-check their cancellation flag.
    pub fn wake_producers(&self) {
        let _state = self.state.lock();
        self.writers.notify_all();
    }

    fn stopped(state: &MutexGuard<'_, State<T>>) -> bool {
        state.cancelled || state.closed || !matches!(state.terminal, Terminal::Active)
    }

    /// Removes and returns the oldest value, waiting up to `timeout` for one to arrive.
    ///
    /// Buffered values are always returned before the terminal state, so a consumer that keeps
    /// polling sees every value pushed before [`complete`](Self::complete) or
    /// [`fail`](Self::fail).
    pub fn poll(&self, timeout: Duration) -> Polled<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Polled::Closed;
            }
            if let Some(value) = state.queue.pop_front() {
                return Polled::Value(value);
            }
            match &state.terminal {
                Terminal::Completed => return Polled::Completed,
                Terminal::Failed(e) => return Polled::Failed(e.clone()),
                Terminal::Active => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Polled::Empty;
            }
            state = self.readers.wait_timeout(state, deadline - now);
        }
    }

    /// Returns the producer's error if the channel failed, regardless of buffered values.
    pub fn failure(&self) -> Option<Error> {
        match &self.state.lock().terminal {
            Terminal::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Drops every buffered value, returning how many there were.
    pub fn discard(&self) -> usize {
        let dropped = mem::take(&mut self.state.lock().queue);
        dropped.len()
    }

    /// Marks the producing side as successfully finished.
    ///
    /// Returns `false` if the channel had already terminated, in which case nothing changes.
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Completed)
    }

    /// Marks the producing side as failed with `error`.
    ///
    /// Returns `false` if the channel had already terminated, in which case nothing changes.
    pub fn fail(&self, error: Error) -> bool {
        self.terminate(Terminal::Failed(error))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.terminal, Terminal::Active) {
            return false;
        }
        state.terminal = terminal;
        self.readers.notify_all();
        self.writers.notify_all();
        true
    }

    /// Tells producers to stop. Producers waiting for credit return [`Cancelled`].
    ///
    /// Buffered values stay readable.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.writers.notify_all();
    }

    /// Releases the channel from the consuming side.
    ///
    /// Cancels the producers, drops all buffered values, and makes every later
    /// [`poll`](Self::poll) return [`Polled::Closed`].
    pub fn close(&self) {
        self.cancel();
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            self.readers.notify_all();
            self.writers.notify_all();
            mem::take(&mut state.queue)
        };
        if !dropped.is_empty() {
            log::debug!("channel closed with {} unread values", dropped.len());
        }
    }
}

impl<T> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("BoundedChannel");
        s.field("capacity", &self.capacity);
        match self.state.try_lock() {
            Some(state) => s
                .field("len", &state.queue.len())
                .field("credits", &state.credits)
                .field("terminal", &state.terminal)
                .field("closed", &state.closed),
            None => s.field("state", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}
