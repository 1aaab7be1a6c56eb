//! Rolling-window time-bucket aggregator.
//!
//! A [`RollingWindow`] divides a fixed observation horizon into `size`
//! fixed-width buckets arranged as a ring. Writers (`add`) credit the
//! current bucket and physically reset any buckets the ring has aged past
//! since the last write. Readers (`reduce`) are purely observational: they
//! narrow the iteration window to simulate buckets that are stale or
//! represent skipped intervals, without mutating the ring themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{LimiterError, LimiterResult};

/// Source of monotonic time for a [`RollingWindow`]. Exists so tests can
/// advance time deterministically instead of racing real sleeps.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// The real, OS-backed monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One time-slice aggregate: a running sum and a sample count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bucket {
    /// Accumulated value across all samples in this bucket.
    pub sum: f64,
    /// Number of samples accumulated in this bucket.
    pub count: i64,
}

impl Bucket {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

struct Ring {
    buckets: Vec<Bucket>,
    offset: usize,
    last_time: Instant,
}

/// Fixed-size circular array of time buckets, advanced by wall-clock time.
///
/// Concurrent `add` (exclusive) and `reduce` (shared) are both supported;
/// neither blocks the other's caller beyond the usual `RwLock` fairness.
pub struct RollingWindow {
    size: usize,
    interval: Duration,
    ignore_current: bool,
    ring: RwLock<Ring>,
    clock: Arc<dyn Clock>,
}

impl RollingWindow {
    /// Construct a window with `size` buckets each spanning `interval`,
    /// driven by the real system clock.
    ///
    /// Fails with [`LimiterError::InvalidArgument`] when `size < 1` or
    /// `interval` is zero.
    pub fn new(size: usize, interval: Duration, ignore_current: bool) -> LimiterResult<Self> {
        Self::with_clock(size, interval, ignore_current, Arc::new(SystemClock))
    }

    /// Construct a window driven by a caller-supplied [`Clock`] (tests use
    /// this to advance time deterministically).
    pub fn with_clock(
        size: usize,
        interval: Duration,
        ignore_current: bool,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Self> {
        if size < 1 {
            return Err(LimiterError::InvalidArgument(
                "rolling window size must be at least 1".into(),
            ));
        }
        if interval.is_zero() {
            return Err(LimiterError::InvalidArgument(
                "rolling window interval must be greater than zero".into(),
            ));
        }
        let last_time = clock.now();
        Ok(Self {
            size,
            interval,
            ignore_current,
            ring: RwLock::new(Ring {
                buckets: vec![Bucket::default(); size],
                offset: 0,
                last_time,
            }),
            clock,
        })
    }

    /// Number of intervals that have elapsed since `last_time`, clamped to
    /// `[0, size]`. A clamp to `size` means "the whole ring is stale" —
    /// this also covers backward clock jumps, which would otherwise yield a
    /// negative span.
    fn span(&self, ring: &Ring, now: Instant) -> usize {
        if now < ring.last_time {
            return self.size;
        }
        let elapsed = now.duration_since(ring.last_time);
        let span = (elapsed.as_nanos() / self.interval.as_nanos()) as usize;
        if span < self.size {
            span
        } else {
            self.size
        }
    }

    /// Credit the current bucket with `v`, first advancing the ring past
    /// any fully-elapsed intervals.
    pub fn add(&self, v: f64) {
        let now = self.clock.now();
        let mut ring = self.ring.write();
        let span = self.span(&ring, now);

        if span > 0 {
            for k in 1..=span {
                let idx = (ring.offset + k) % self.size;
                ring.buckets[idx].reset();
            }
            ring.offset = (ring.offset + span) % self.size;
            // Snap last_time to now, minus whatever sub-interval remainder
            // it carried, instead of stepping it forward by a fixed
            // `span * interval`. A large clock jump (or a long pause
            // between writes) would otherwise leave last_time permanently
            // behind wall-clock time, so every future span would keep
            // clamping to `size` even though the ring has caught up.
            let elapsed = now.checked_duration_since(ring.last_time).unwrap_or_default();
            let remainder = Duration::from_nanos(
                (elapsed.as_nanos() % self.interval.as_nanos()) as u64,
            );
            ring.last_time = now - remainder;
        }

        let offset = ring.offset;
        ring.buckets[offset].add(v);
    }

    /// Apply `f` to each live (non-expired, non-future) bucket, oldest
    /// first. Buckets aged out of the window, and the current bucket when
    /// `ignore_current` was set at construction, are excluded.
    pub fn reduce<F>(&self, mut f: F)
    where
        F: FnMut(&Bucket),
    {
        let now = self.clock.now();
        let ring = self.ring.read();
        let span = self.span(&ring, now);

        let count = if span == 0 && self.ignore_current {
            self.size - 1
        } else {
            self.size.saturating_sub(span)
        };

        if count == 0 {
            return;
        }

        let start = (ring.offset + span + 1) % self.size;
        for i in 0..count {
            let idx = (start + i) % self.size;
            f(&ring.buckets[idx]);
        }
    }
}

/// A [`Clock`] whose `now()` is manually advanced, for deterministic tests.
pub struct FakeClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl FakeClock {
    /// Construct a fake clock anchored at the real current instant.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        })
    }

    /// Move the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.offset_nanos
            .fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(w: &RollingWindow) -> Vec<f64> {
        let mut out = Vec::new();
        w.reduce(|b| out.push(b.sum));
        out
    }

    #[test]
    fn basic_advance() {
        let clock = FakeClock::new();
        let w =
            RollingWindow::with_clock(3, Duration::from_millis(50), false, clock.clone()).unwrap();
        assert_eq!(collect(&w), vec![0.0, 0.0, 0.0]);

        w.add(1.0);
        assert_eq!(collect(&w), vec![0.0, 0.0, 1.0]);

        clock.advance(Duration::from_millis(60));
        w.add(2.0);
        w.add(3.0);
        assert_eq!(collect(&w), vec![0.0, 1.0, 5.0]);

        clock.advance(Duration::from_millis(60));
        w.add(4.0);
        w.add(5.0);
        w.add(6.0);
        assert_eq!(collect(&w), vec![1.0, 5.0, 15.0]);

        clock.advance(Duration::from_millis(60));
        w.add(7.0);
        assert_eq!(collect(&w), vec![5.0, 15.0, 7.0]);
    }

    #[test]
    fn ignore_current_and_full_expiry() {
        let clock = FakeClock::new();
        let w =
            RollingWindow::with_clock(3, Duration::from_millis(50), true, clock.clone()).unwrap();
        w.add(1.0);

        clock.advance(Duration::from_millis(60));
        assert_eq!(collect(&w), vec![0.0, 1.0]);

        clock.advance(Duration::from_millis(60));
        assert_eq!(collect(&w), vec![1.0]);

        clock.advance(Duration::from_millis(60));
        assert!(collect(&w).is_empty());

        w.add(1.0);
        clock.advance(Duration::from_millis(500));
        assert!(collect(&w).is_empty());
    }

    #[test]
    fn invalid_constructor_args() {
        assert!(RollingWindow::new(0, Duration::from_millis(10), false).is_err());
        assert!(RollingWindow::new(10, Duration::from_millis(0), false).is_err());
    }

    #[test]
    fn add_increments_current_bucket_exactly_once() {
        let w = RollingWindow::new(4, Duration::from_millis(100), false).unwrap();
        w.add(3.0);
        w.add(4.0);
        let mut sum = 0.0;
        let mut count = 0;
        w.reduce(|b| {
            sum += b.sum;
            count += b.count;
        });
        assert_eq!(sum, 7.0);
        assert_eq!(count, 2);
    }

    #[test]
    fn large_elapsed_time_resets_whole_ring() {
        let clock = FakeClock::new();
        let w =
            RollingWindow::with_clock(5, Duration::from_millis(10), false, clock.clone()).unwrap();
        w.add(1.0);
        clock.advance(Duration::from_millis(200));
        w.add(2.0);

        let mut nonzero_buckets = 0;
        let mut total = 0.0;
        w.reduce(|b| {
            if b.count > 0 {
                nonzero_buckets += 1;
            }
            total += b.sum;
        });
        // the stale 1.0 sample must have been reset away by the backward
        // span clamp; only the just-written bucket survives
        assert_eq!(nonzero_buckets, 1);
        assert_eq!(total, 2.0);
    }

    proptest! {
        /// For any interleaving of `add`s and clock advances, `reduce` must
        /// never yield more buckets than the ring holds, and must yield
        /// exactly `size` (or `size - 1`, when the current bucket is
        /// excluded and nothing has expired) as long as no interval has
        /// fully elapsed since the last write.
        #[test]
        fn reduce_bucket_count_is_bounded(
            size in 2usize..8,
            ignore_current in any::<bool>(),
            ops in prop::collection::vec(
                prop_oneof![
                    (0u64..5).prop_map(Op::Add),
                    (0u64..30).prop_map(Op::Advance),
                ],
                0..40,
            ),
        ) {
            let clock = FakeClock::new();
            let w = RollingWindow::with_clock(
                size,
                Duration::from_millis(10),
                ignore_current,
                clock.clone(),
            )
            .unwrap();

            for op in ops {
                match op {
                    Op::Add(v) => w.add(v as f64),
                    Op::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                }

                let mut yielded = 0usize;
                w.reduce(|_| yielded += 1);
                prop_assert!(yielded <= size);
                if ignore_current {
                    // the current bucket is always excluded, so the ring
                    // can never yield a full `size` buckets
                    prop_assert!(yielded < size);
                }
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Add(u64),
        Advance(u64),
    }
}
