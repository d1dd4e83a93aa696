//! Scope guards.

/// Guard returned by [`defer`]. Runs its callback when dropped, including during unwinding.
#[must_use = "`Defer` should be assigned to a variable, or it will run immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a value that runs `cb` when dropped.
///
/// Worker threads use this to report their exit on every path out of the thread body, so that
/// owners waiting for the notification are not left hanging if the body panics.
pub fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}
