//! Wall-clock timing of a lexical scope, reported at trace level under the
//! `timing` target when the timer goes out of scope.

use tokio::time::Instant;
use tracing::trace;

pub(crate) struct ScopedTimer {
    operation: &'static str,
    started: Instant,
}

impl ScopedTimer {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    /// Milliseconds since creation, with sub-millisecond precision for histograms
    pub(crate) fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        trace!(
            target: "timing",
            operation = self.operation,
            elapsed_ms = self.elapsed_ms(),
            "scope finished"
        );
    }
}
