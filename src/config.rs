use std::{thread, time::Duration};

use crate::error::{Error, Result};

/// Default number of values buffered between producer and consumer.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default upper bound on a single blocking wait on either side of the channel.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings for starting a [`ResultHandle`](crate::ResultHandle).
///
/// Uses the same by-value builder style as the rest of the crate:
///
/// ```
/// use tributary::Config;
///
/// let config = Config::new().buffer_size(64).delay_error(false).name("indexer");
/// assert_eq!(config.get_buffer_size(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    buffer_size: usize,
    delay_error: bool,
    max_concurrent: usize,
    poll_interval: Duration,
    name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            delay_error: true,
            max_concurrent: cpus * 2,
            poll_interval: DEFAULT_POLL_INTERVAL,
            name: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity of the buffer between producer and consumer. Must be at least 1.
    #[inline]
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..self
        }
    }

    /// Sets whether a producer error waits until all buffered values have been consumed
    /// (`true`, the default), or is reported as soon as the consumer observes it (`false`).
    ///
    /// In the latter case, values that were buffered but not yet read are discarded.
    #[inline]
    pub fn delay_error(self, delay_error: bool) -> Self {
        Self {
            delay_error,
            ..self
        }
    }

    /// Sets how many producers of a [`ResultHandle::merge`](crate::ResultHandle::merge) may run
    /// at the same time. Must be at least 1.
    ///
    /// Defaults to twice the available parallelism.
    #[inline]
    pub fn max_concurrent(self, max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..self
        }
    }

    /// Sets the upper bound of a single blocking wait.
    ///
    /// Waits are woken by notifications; this interval only bounds how long a cancellation
    /// signalled without a notification can go unnoticed.
    #[inline]
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Sets the base name of the worker threads.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn get_delay_error(&self) -> bool {
        self.delay_error
    }

    pub fn get_max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid_argument("buffer size must be greater than 0"));
        }
        if self.max_concurrent == 0 {
            return Err(Error::invalid_argument(
                "max concurrent producers must be greater than 0",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_argument("poll interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.get_buffer_size(), DEFAULT_BUFFER_SIZE);
        assert!(config.get_delay_error());
        assert!(config.get_max_concurrent() >= 2);
        assert_eq!(config.get_poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.get_name(), None);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_buffer() {
        let err = Config::new().buffer_size(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = Config::new().max_concurrent(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = Config::new()
            .poll_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
