use std::time::{Duration, Instant};

/// Elapsed-time scope around a batch of GPU work.
///
/// The scope ends by waiting for the queue to drain, so the measured span
/// covers submission plus execution of everything encoded inside it.
#[derive(Debug, Default)]
pub(crate) struct FrameTimer {
    started: Option<Instant>,
    last: Duration,
}

impl FrameTimer {
    pub fn begin(&mut self, now: Instant) {
        if self.started.is_some() {
            tracing::warn!("timer scope restarted before it was ended");
        }
        self.started = Some(now);
    }

    /// Closes the scope; an unopened scope reports the previous result.
    pub fn end(&mut self, now: Instant) -> Duration {
        if let Some(started) = self.started.take() {
            self.last = now.saturating_duration_since(started);
        }
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_span_between_begin_and_end() {
        let start = Instant::now();
        let mut timer = FrameTimer::default();
        timer.begin(start);
        let elapsed = timer.end(start + Duration::from_millis(5));
        assert_eq!(elapsed, Duration::from_millis(5));
    }

    #[test]
    fn unopened_scope_repeats_last_result() {
        let start = Instant::now();
        let mut timer = FrameTimer::default();
        assert_eq!(timer.end(start), Duration::ZERO);
        timer.begin(start);
        timer.end(start + Duration::from_millis(2));
        assert_eq!(timer.end(start + Duration::from_secs(1)), Duration::from_millis(2));
    }
}
