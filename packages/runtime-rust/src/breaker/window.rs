use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    requests: u64,
    accepts: u64,
}

/// Request/accept counts over a sliding window split into fixed buckets.
///
/// Buckets older than the window are zeroed lazily whenever the window is
/// touched, so an idle window costs nothing.
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Vec<Bucket>,
    width: Duration,
    /// Start of the bucket at `current`.
    start: Instant,
    current: usize,
}

impl RollingWindow {
    /// Creates a window of `size` split into `buckets` buckets.
    ///
    /// Both are clamped to sane minimums: at least one bucket and a bucket
    /// width of at least one millisecond.
    #[must_use]
    pub fn new(size: Duration, buckets: u32, now: Instant) -> Self {
        let buckets = buckets.max(1);
        let width = (size / buckets).max(Duration::from_millis(1));
        Self {
            buckets: (0..buckets).map(|_| Bucket::default()).collect(),
            width,
            start: now,
            current: 0,
        }
    }

    /// Adds counts to the bucket covering `now`.
    pub fn add(&mut self, now: Instant, requests: u64, accepts: u64) {
        self.advance(now);
        let bucket = &mut self.buckets[self.current];
        bucket.requests += requests;
        bucket.accepts += accepts;
    }

    /// Total `(requests, accepts)` inside the window ending at `now`.
    pub fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.advance(now);
        self.buckets
            .iter()
            .fold((0, 0), |(r, a), b| (r + b.requests, a + b.accepts))
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        let steps = elapsed.as_nanos() / self.width.as_nanos();
        if steps == 0 {
            return;
        }

        let len = self.buckets.len();
        match usize::try_from(steps) {
            Ok(steps) if steps < len => {
                for i in 1..=steps {
                    self.buckets[(self.current + i) % len] = Bucket::default();
                }
                self.current = (self.current + steps) % len;
                // steps < len, and len came from a u32.
                #[allow(clippy::cast_possible_truncation)]
                let steps = steps as u32;
                self.start += self.width * steps;
            }
            _ => {
                self.buckets.fill(Bucket::default());
                self.current = 0;
                self.start = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_within_window() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(Duration::from_secs(1), 10, t0);
        w.add(t0, 1, 1);
        w.add(t0 + Duration::from_millis(150), 1, 0);
        w.add(t0 + Duration::from_millis(950), 1, 1);
        assert_eq!(w.totals(t0 + Duration::from_millis(990)), (3, 2));
    }

    #[test]
    fn old_buckets_slide_out() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(Duration::from_secs(1), 10, t0);
        w.add(t0, 5, 5);
        w.add(t0 + Duration::from_millis(500), 2, 0);

        assert_eq!(w.totals(t0 + Duration::from_millis(1050)), (2, 0));
        assert_eq!(w.totals(t0 + Duration::from_millis(1550)), (0, 0));
    }

    #[test]
    fn long_idle_resets_everything() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(Duration::from_secs(1), 4, t0);
        w.add(t0, 3, 3);
        let later = t0 + Duration::from_secs(3600);
        assert_eq!(w.totals(later), (0, 0));
        w.add(later, 1, 0);
        assert_eq!(w.totals(later), (1, 0));
    }
}
