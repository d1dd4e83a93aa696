//! Blocking, backpressured streams of values computed on background threads.
//!
//! A [`Producer`] computes values on its own thread and hands them to a consumer through a
//! bounded buffer. The consumer reads them through a plain blocking [`Iterator`], and the
//! producer is paced by it: it can never run more than one buffer's worth of values ahead.
//!
//! # Overview
//!
//! ## Producers
//!
//! A [`Producer`] wraps an `execute` closure that emits values through an [`Emitter`]. When the
//! closure returns `Ok(())`, the stream completes; when it returns an error (or panics), the
//! stream fails and the consumer receives the error after the values emitted before it.
//!
//! Producers can carry a post-process hook and any number of [`Listener`]s. Whatever happens to
//! the producer (it completes, fails, panics, is cancelled mid-way or is never started at all),
//! the hook and the listeners' `on_finish` run exactly once, with an [`ExecResult`] summarizing
//! the run. This makes them the right place to release whatever the producer was reading from.
//!
//! ## Result handles
//!
//! Starting a producer returns a [`ResultHandle`], which owns the producer's worker thread and
//! the buffer. The handle enforces *structured concurrency*: closing or dropping it cancels the
//! producer, waits for its thread to exit, and guarantees the producer's hooks have run. A
//! consumer that only wants part of a stream can simply stop reading and drop the handle.
//!
//! Several producers can also be merged into one stream with [`ResultHandle::merge`], running at
//! most [`Config::max_concurrent`] of them at once.
//!
//! # Usage
//!
//! A producer that reads rows from some source and releases it when done:
//!
//! ```
//! use tributary::{Config, Producer};
//!
//! let rows = vec!["a", "b", "c"];
//! let producer = Producer::new(move |emitter| {
//!     for row in rows {
//!         emitter.emit(row.to_uppercase())?;
//!     }
//!     Ok(())
//! })
//! .post_process(|result| println!("source released after {result}"));
//!
//! let handle = producer.run_with(&Config::new().buffer_size(2)).unwrap();
//! for row in handle {
//!     println!("{}", row.unwrap());
//! }
//! ```
//!
//! Errors reach the consumer once the values before them have been read:
//!
//! ```
//! use tributary::{Error, Producer};
//!
//! let mut handle = Producer::new(|emitter| {
//!     emitter.emit(1)?;
//!     emitter.emit(2)?;
//!     Err("disk on fire".into())
//! })
//! .run()
//! .unwrap();
//!
//! let iter = handle.iter();
//! assert_eq!(iter.try_next().unwrap(), 1);
//! assert_eq!(iter.try_next().unwrap(), 2);
//! assert!(matches!(iter.try_next(), Err(Error::Producer(_))));
//! ```

mod config;
mod drop;
mod error;
mod exec;
mod handle;
mod iter;
mod listener;
mod merge;
mod producer;
mod sync;
mod worker;

pub mod channel;


pub use config::{Config, DEFAULT_BUFFER_SIZE, DEFAULT_POLL_INTERVAL};
pub use error::{BoxError, Cancelled, Error, Result};
pub use exec::ExecResult;
pub use handle::{Closer, IntoIter, ResultHandle};
pub use iter::ResultIter;
pub use listener::{listener_fn, FnListener, Listener};
pub use producer::{Emitter, Producer, TaskState};
