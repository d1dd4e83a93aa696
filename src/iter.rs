use std::{iter::FusedIterator, sync::Arc, time::Duration};

use crate::{
    channel::{BoundedChannel, Polled},
    error::{Error, Result},
};

enum IterState {
    Open,
    Exhausted,
    Failed(Error),
}

/// A blocking, read-once iterator over the values of a producer.
///
/// Obtained from [`ResultHandle::iter`](crate::ResultHandle::iter) or by iterating over a
/// [`ResultHandle`](crate::ResultHandle).
///
/// Besides the [`Iterator`] implementation, which yields `Result<T, Error>` and stops after the
/// first error, this type offers a cursor-style interface ([`has_next`](Self::has_next) and
/// [`try_next`](Self::try_next)) for callers that want to inspect the end of the stream
/// explicitly.
///
/// The iterator is also what paces the producer: it initially grants the producer as many values
/// as the buffer holds, and grants a new batch every time roughly three quarters of the buffer
/// have been consumed.
pub struct ResultIter<T> {
    channel: Arc<BoundedChannel<T>>,
    delay_error: bool,
    poll_interval: Duration,
    /// Number of consumed values after which credits are replenished.
    limit: usize,
    /// Consumed values not yet returned to the producer as credits.
    consumed: usize,
    peeked: Option<T>,
    state: IterState,
    /// Set once the `Iterator` impl has yielded its last item.
    fused: bool,
}

impl<T> ResultIter<T> {
    pub(crate) fn new(channel: Arc<BoundedChannel<T>>, delay_error: bool, poll_interval: Duration) -> Self {
        let capacity = channel.capacity();
        channel.request_credits(capacity);
        Self {
            channel,
            delay_error,
            poll_interval,
            limit: capacity - (capacity >> 2),
            consumed: 0,
            peeked: None,
            state: IterState::Open,
            fused: false,
        }
    }

    /// Blocks until it is known whether another value is available.
    ///
    /// Returns `Ok(true)` if a value is ready, and `Ok(false)` once the producer has completed
    /// and every value was consumed, or the [`ResultHandle`](crate::ResultHandle) was closed.
    ///
    /// If the producer failed, its error is returned. With `delay_error` enabled (the default),
    /// that only happens after all values emitted before the failure were consumed; otherwise the
    /// error is reported as soon as it is seen, and unread values are discarded. Once an error
    /// was returned, every later call returns it again.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        loop {
            match &self.state {
                IterState::Open => {}
                IterState::Exhausted => return Ok(false),
                IterState::Failed(e) => return Err(e.clone()),
            }

            if !self.delay_error {
                if let Some(e) = self.channel.failure() {
                    let discarded = self.channel.discard();
                    if discarded > 0 {
                        log::debug!("producer failed, discarding {discarded} unread values");
                    }
                    self.state = IterState::Failed(e);
                    continue;
                }
            }

            match self.channel.poll(self.poll_interval) {
                Polled::Value(value) => {
                    self.peeked = Some(value);
                    return Ok(true);
                }
                Polled::Empty => {}
                Polled::Completed | Polled::Closed => self.state = IterState::Exhausted,
                Polled::Failed(e) => self.state = IterState::Failed(e),
            }
        }
    }

    /// Returns the next value, blocking until one is available.
    ///
    /// Returns [`Error::NoSuchElement`] if the stream is exhausted, or the producer's error as
    /// described in [`has_next`](Self::has_next).
    pub fn try_next(&mut self) -> Result<T> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        let value = self.peeked.take().ok_or(Error::NoSuchElement)?;
        self.consumed += 1;
        if self.consumed == self.limit {
            self.consumed = 0;
            self.channel.request_credits(self.limit);
        }
        Ok(value)
    }

    /// Always fails: values cannot be removed from a stream.
    pub fn remove(&mut self) -> Result<()> {
        Err(Error::Unsupported("remove"))
    }

    #[inline]
    pub fn delay_error(&self) -> bool {
        self.delay_error
    }
}

impl<T> Iterator for ResultIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.try_next() {
            Ok(value) => Some(Ok(value)),
            Err(Error::NoSuchElement) => {
                self.fused = true;
                None
            }
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}

impl<T> FusedIterator for ResultIter<T> {}
