use std::time::{Duration, Instant};

/// Suppression count past which the summary reads "over N".
const TOO_MANY: u32 = 16_000;

/// Rate limiter for repeated diagnostic log lines.
///
/// At most one message is let through per `interval`. When a message is
/// let through after others were suppressed, the caller gets a suffix
/// summarizing how many were dropped, to append to the log line.
#[derive(Debug)]
pub struct LogRateLimiter {
    interval: Duration,
    last_allowed: Option<Instant>,
    suppressed: u32,
}

impl LogRateLimiter {
    /// Creates a limiter that allows one message per `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_allowed: None,
            suppressed: 0,
        }
    }

    /// Decides whether a message occurring at `now` should be logged.
    ///
    /// Returns `None` if the message is suppressed, `Some("")` if it should
    /// be logged as-is, or `Some(suffix)` summarizing prior suppressions.
    pub fn check(&mut self, now: Instant) -> Option<String> {
        let ready = self
            .last_allowed
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);

        if !ready {
            if self.suppressed <= TOO_MANY {
                self.suppressed += 1;
            }
            return None;
        }

        let dropped = std::mem::take(&mut self.suppressed);
        self.last_allowed = Some(now);
        if dropped == 0 {
            return Some(String::new());
        }
        let secs = self.interval.as_secs();
        Some(if dropped > TOO_MANY {
            format!(" [over {TOO_MANY} similar message(s) suppressed in last {secs} seconds]")
        } else {
            format!(" [{dropped} similar message(s) suppressed in last {secs} seconds]")
        })
    }

    /// Number of messages suppressed since the last one let through.
    #[must_use]
    pub const fn suppressed(&self) -> u32 {
        self.suppressed
    }
}

impl Default for LogRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
