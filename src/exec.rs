use std::{fmt, time::Duration};

use crate::error::Error;

/// Summary of a finished producer run.
///
/// Built exactly once per producer, when it is finalized, and passed to its
/// [`Listener::on_finish`](crate::Listener::on_finish) callbacks and its post-process hook.
#[derive(Debug, Clone)]
pub struct ExecResult {
    processed: u64,
    elapsed: Duration,
    error: Option<Error>,
}

impl ExecResult {
    pub(crate) fn new(processed: u64, elapsed: Duration, error: Option<Error>) -> Self {
        Self {
            processed,
            elapsed,
            error,
        }
    }

    /// Number of values the producer emitted.
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Time between the start of `execute` and finalization. Zero if the producer never started.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The error the producer failed with, if any.
    ///
    /// A producer stopped by cancellation has no error.
    #[inline]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success={} elapsed={}ms processed={}",
            self.is_success(),
            self.elapsed.as_millis(),
            self.processed,
        )?;
        if let Some(e) = &self.error {
            write!(f, " error={e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_summary() {
        let result = ExecResult::new(12, Duration::from_millis(30), None);
        assert!(result.is_success());
        assert_eq!(result.processed(), 12);
        assert_eq!(result.to_string(), "success=true elapsed=30ms processed=12");
    }

    #[test]
    fn failure_summary() {
        let result = ExecResult::new(0, Duration::ZERO, Some(Error::ProducerPanicked("oops".into())));
        assert!(!result.is_success());
        assert!(matches!(result.error(), Some(Error::ProducerPanicked(_))));
        assert_eq!(
            result.to_string(),
            "success=false elapsed=0ms processed=0 error=producer panicked: oops"
        );
    }
}
