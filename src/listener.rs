use crate::exec::ExecResult;

/// Observer of a producer's lifecycle.
///
/// Register with [`Producer::listener`](crate::Producer::listener). Both callbacks run on the
/// producer's worker thread (or, for a producer disposed before it ever started, on the thread
/// that disposed it), so they should return quickly.
pub trait Listener: Send + Sync {
    /// Called once, right before the producer's `execute` closure runs.
    ///
    /// Listeners are called in registration order.
    fn on_start(&self) {}

    /// Called once after the producer reached a terminal state, before its post-process hook.
    ///
    /// No ordering between different listeners is guaranteed.
    fn on_finish(&self, result: &ExecResult) {
        let _ = result;
    }
}

/// A [`Listener`] made from a pair of closures. Created by [`listener_fn`].
pub struct FnListener<S, F> {
    start: S,
    finish: F,
}

impl<S, F> Listener for FnListener<S, F>
where
    S: Fn() + Send + Sync,
    F: Fn(&ExecResult) + Send + Sync,
{
    fn on_start(&self) {
        (self.start)();
    }

    fn on_finish(&self, result: &ExecResult) {
        (self.finish)(result);
    }
}

/// Creates a [`Listener`] that calls `start` and `finish`.
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use tributary::{listener_fn, Producer};
///
/// let finished = Arc::new(AtomicUsize::new(0));
/// let f = finished.clone();
/// let producer = Producer::<u32>::new(|emitter| Ok(emitter.emit(1)?))
///     .listener(listener_fn(|| {}, move |_| { f.fetch_add(1, Ordering::Relaxed); }));
///
/// let mut handle = producer.run().unwrap();
/// assert_eq!(handle.to_list().unwrap(), [1]);
/// handle.close();
/// assert_eq!(finished.load(Ordering::Relaxed), 1);
/// ```
pub fn listener_fn<S, F>(start: S, finish: F) -> FnListener<S, F>
where
    S: Fn() + Send + Sync,
    F: Fn(&ExecResult) + Send + Sync,
{
    FnListener { start, finish }
}
