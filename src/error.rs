//! Error types.

use std::{fmt, io, sync::Arc};

/// Boxed error type returned by a producer's `execute` closure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by this crate.
///
/// Producer-side failures are captured on the worker thread and replayed to the consumer by
/// [`ResultIter`](crate::ResultIter), so this type is [`Clone`]: the iterator keeps reporting the
/// same error on every subsequent [`has_next`](crate::ResultIter::has_next) call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A construction parameter was out of range. Raised before any worker thread is started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A value was pushed into a full buffer outside the credit protocol.
    #[error("buffer overflow (capacity {capacity})")]
    BufferOverflow { capacity: usize },

    /// The producer's `execute` closure returned an error.
    #[error("producer failed: {0}")]
    Producer(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The producer's `execute` closure panicked.
    #[error("producer panicked: {0}")]
    ProducerPanicked(String),

    /// [`ResultIter::try_next`](crate::ResultIter::try_next) was called on an exhausted iterator.
    #[error("no more elements")]
    NoSuchElement,

    /// The operation is not supported.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The OS failed to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] Arc<io::Error>),
}

impl Error {
    /// Wraps an error returned by a producer.
    pub fn producer(error: BoxError) -> Self {
        Error::Producer(Arc::from(error))
    }

    pub(crate) fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Returns the error originally returned by the producer, if this is [`Error::Producer`].
    ///
    /// Combine with [`downcast_ref`](std::error::Error) to recover the concrete type.
    pub fn producer_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Producer(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Spawn(Arc::new(e))
    }
}

/// Crate-level result alias. The error type defaults to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returned by [`Emitter`](crate::Emitter) methods once the producer has been cancelled.
///
/// The `execute` closure is expected to propagate this with `?`. It is recognized by the worker
/// and never reaches the consumer; it only stops the producer early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("producer was cancelled")
    }
}

impl std::error::Error for Cancelled {}
