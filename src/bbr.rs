//! The BBR-inspired admission controller.
//!
//! [`Limiter`] combines two [`RollingWindow`]s (recent completions, recent
//! latency) with a [`CpuSource`] and an in-flight counter to decide, per
//! `allow()` call, whether to admit or shed a request. It estimates a
//! sustainable concurrency ceiling from observed peak throughput times
//! minimum response time (a Little's-law bound) and only sheds when the
//! host CPU is hot *and* current in-flight load exceeds that ceiling.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cpu::{CpuEstimator, CpuSource, ProcStatCpuSampler};
use crate::error::{LimiterError, LimiterResult};
use crate::window::{Clock, RollingWindow, SystemClock};

/// Sentinel for `prev_drop_time`: no shedding episode currently recorded.
const UNSET: u64 = u64::MAX;

/// Limiter configuration. Each [`Limiter`] owns its own snapshot — unlike
/// the upstream Go package, constructing one limiter with custom options
/// never mutates another limiter's defaults.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Total observation window (default 10s).
    pub window: Duration,
    /// Number of buckets subdividing the window (default 100).
    pub bucket_count: usize,
    /// Inclusive lower bound, in `0..=1000`, that classifies CPU as "hot"
    /// (default 800, i.e. 80%).
    pub cpu_threshold: i64,
    /// Period between CPU samples (default 500ms).
    pub sampling_interval: Duration,
    /// EMA weight retained from the prior smoothed CPU value (default 0.95).
    pub decay: f64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            bucket_count: 100,
            cpu_threshold: 800,
            sampling_interval: Duration::from_millis(500),
            decay: 0.95,
        }
    }
}

/// Builder for [`LimiterOptions`] / [`Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterBuilder {
    opts: LimiterOptions,
}

impl LimiterBuilder {
    /// Start from the default options.
    pub fn new() -> Self {
        Self {
            opts: LimiterOptions::default(),
        }
    }

    /// Set the total observation window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.opts.window = window;
        self
    }

    /// Set the number of buckets subdividing the window.
    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.opts.bucket_count = bucket_count;
        self
    }

    /// Set the CPU-hot threshold (`0..=1000`).
    pub fn with_cpu_threshold(mut self, cpu_threshold: i64) -> Self {
        self.opts.cpu_threshold = cpu_threshold;
        self
    }

    /// Set the period between CPU samples.
    pub fn with_sampling_interval(mut self, sampling_interval: Duration) -> Self {
        self.opts.sampling_interval = sampling_interval;
        self
    }

    /// Set the CPU EMA decay.
    pub fn with_decay(mut self, decay: f64) -> Self {
        self.opts.decay = decay;
        self
    }

    /// Build a limiter with a dedicated, privately-owned [`CpuEstimator`]
    /// reading `/proc/stat` on its own schedule.
    pub fn build(self) -> LimiterResult<Arc<Limiter>> {
        let cpu: Arc<dyn CpuSource> = Arc::new(CpuEstimator::spawn(
            Arc::new(ProcStatCpuSampler::new()),
            self.opts.sampling_interval,
            self.opts.decay,
        ));
        Limiter::with_cpu_source(self.opts, cpu, Arc::new(SystemClock))
    }

    /// Build a limiter reading CPU load from a caller-supplied source
    /// (the process-wide [`crate::cpu::global`] estimator, or a
    /// [`crate::cpu::FixedCpu`]/fake sampler-backed estimator in tests).
    pub fn build_with_cpu_source(self, cpu: Arc<dyn CpuSource>) -> LimiterResult<Arc<Limiter>> {
        Limiter::with_cpu_source(self.opts, cpu, Arc::new(SystemClock))
    }

    /// Build a limiter reading CPU load and time from caller-supplied
    /// sources — tests use this to drive the hysteresis tail deterministically
    /// with a [`crate::window::FakeClock`] instead of real sleeps.
    pub fn build_with_cpu_source_and_clock(
        self,
        cpu: Arc<dyn CpuSource>,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Arc<Limiter>> {
        Limiter::with_cpu_source(self.opts, cpu, clock)
    }
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterCache {
    value: i64,
    stored_at: Instant,
}

/// Stateful admission controller. Constructed behind an `Arc` because every
/// admitted request holds a [`Completion`] that keeps the limiter (and its
/// rolling windows) alive until the request finishes.
pub struct Limiter {
    opts: LimiterOptions,
    pass_stat: RollingWindow,
    rt_stat: RollingWindow,
    in_flight: AtomicI64,
    prev_drop_time: AtomicU64,
    max_pass_cache: Mutex<Option<CounterCache>>,
    min_rt_cache: Mutex<Option<CounterCache>>,
    bucket_duration: Duration,
    buckets_per_second: i64,
    cpu: Arc<dyn CpuSource>,
    clock: Arc<dyn Clock>,
    start: Instant,
}

impl Limiter {
    /// Construct a limiter with default options and the process-wide CPU
    /// estimator (see [`crate::cpu::global`]).
    pub fn new() -> LimiterResult<Arc<Self>> {
        LimiterBuilder::new().build_with_cpu_source(Arc::new(SharedCpu))
    }

    fn with_cpu_source(
        opts: LimiterOptions,
        cpu: Arc<dyn CpuSource>,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Arc<Self>> {
        let bucket_duration = opts.window / opts.bucket_count as u32;
        let buckets_per_second =
            (Duration::from_secs(1).as_nanos() / bucket_duration.as_nanos().max(1)) as i64;

        let pass_stat =
            RollingWindow::with_clock(opts.bucket_count, bucket_duration, true, clock.clone())?;
        let rt_stat =
            RollingWindow::with_clock(opts.bucket_count, bucket_duration, true, clock.clone())?;
        let start = clock.now();

        Ok(Arc::new(Self {
            opts,
            pass_stat,
            rt_stat,
            in_flight: AtomicI64::new(0),
            prev_drop_time: AtomicU64::new(UNSET),
            max_pass_cache: Mutex::new(None),
            min_rt_cache: Mutex::new(None),
            bucket_duration,
            buckets_per_second,
            cpu,
            clock,
            start,
        }))
    }

    /// Decide whether to admit a request.
    ///
    /// On admission, increments the in-flight counter and returns a
    /// [`Completion`] that, when dropped, records the observed latency and
    /// decrements the counter exactly once. On rejection, no state changes
    /// and the caller should signal 429 to its client.
    pub fn allow(self: &Arc<Self>) -> LimiterResult<Completion> {
        if self.should_drop() {
            return Err(LimiterError::Rejected);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(Completion {
            limiter: self.clone(),
            start: self.clock.now(),
        })
    }

    /// Current in-flight request count.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    fn now_nanos(&self) -> u64 {
        self.clock
            .now()
            .checked_duration_since(self.start)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    /// Bucket count elapsed since `stored_at`; clamps to the full bucket
    /// count on a backward time reading, matching `RollingWindow::span`.
    fn timespan(&self, stored_at: Instant) -> i64 {
        let now = self.clock.now();
        if now < stored_at {
            return self.opts.bucket_count as i64;
        }
        (now.duration_since(stored_at).as_nanos() / self.bucket_duration.as_nanos().max(1)) as i64
    }

    /// Peak per-bucket completion count observed in the window, floored at 1.
    fn max_pass(&self) -> i64 {
        if let Some(cache) = *self.max_pass_cache.lock() {
            if self.timespan(cache.stored_at) < 1 {
                return cache.value;
            }
        }

        let mut raw_max_pass = 0.0f64;
        self.pass_stat.reduce(|b| {
            if b.sum > raw_max_pass {
                raw_max_pass = b.sum;
            }
        });
        if raw_max_pass <= 0.0 {
            raw_max_pass = 1.0;
        }

        let value = raw_max_pass as i64;
        *self.max_pass_cache.lock() = Some(CounterCache {
            value,
            stored_at: self.clock.now(),
        });
        value
    }

    /// Minimum average per-bucket response time (ms) over the window,
    /// floored at 1.
    fn min_rt(&self) -> i64 {
        if let Some(cache) = *self.min_rt_cache.lock() {
            if self.timespan(cache.stored_at) < 1 {
                return cache.value;
            }
        }

        let mut raw_min_rt = f64::MAX;
        self.rt_stat.reduce(|b| {
            if b.count > 0 {
                let avg = (b.sum / b.count as f64).ceil();
                if avg < raw_min_rt {
                    raw_min_rt = avg;
                }
            }
        });
        if raw_min_rt == f64::MAX {
            raw_min_rt = 1.0;
        }

        let value = raw_min_rt as i64;
        *self.min_rt_cache.lock() = Some(CounterCache {
            value,
            stored_at: self.clock.now(),
        });
        value
    }

    /// Derived concurrency ceiling: a Little's-law bound on healthy
    /// in-flight load.
    fn max_in_flight(&self) -> i64 {
        let numerator = (self.max_pass() * self.min_rt() * self.buckets_per_second) as f64;
        (numerator / 1000.0).ceil() as i64
    }

    fn should_drop(&self) -> bool {
        let cpu = self.cpu.current();
        let now = self.now_nanos();
        let prev = self.prev_drop_time.load(Ordering::Acquire);
        let prev_set = prev != UNSET;

        if cpu < self.opts.cpu_threshold {
            if !prev_set {
                return false;
            }
            if now.saturating_sub(prev) <= Duration::from_secs(1).as_nanos() as u64 {
                let in_flight = self.in_flight();
                return in_flight > 1 && in_flight > self.max_in_flight();
            }
            self.prev_drop_time.store(UNSET, Ordering::Release);
            return false;
        }

        let in_flight = self.in_flight();
        let drop = in_flight > 1 && in_flight > self.max_in_flight();
        if drop && !prev_set {
            self.prev_drop_time.store(now, Ordering::Release);
        }
        drop
    }
}

/// Reads from the process-wide [`crate::cpu::global`] estimator on demand,
/// so `Limiter::new()` doesn't eagerly spawn a second background sampler.
struct SharedCpu;

impl CpuSource for SharedCpu {
    fn current(&self) -> i64 {
        crate::cpu::global().current()
    }
}

/// A handle returned by a successful [`Limiter::allow`]. Recording the
/// observed latency and releasing the in-flight slot happens exactly once,
/// on drop — including on early return, panic unwind, or cancellation —
/// so the in-flight counter can never leak or double-decrement.
pub struct Completion {
    limiter: Arc<Limiter>,
    start: Instant,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let elapsed = self
            .limiter
            .clock
            .now()
            .checked_duration_since(self.start)
            .unwrap_or_default();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.limiter.rt_stat.add(elapsed_ms);
        self.limiter.pass_stat.add(1.0);
        self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::FixedCpu;
    use crate::window::FakeClock;
    use proptest::prelude::*;

    fn limiter_with_cpu(cpu_threshold: i64, cpu: i64) -> Arc<Limiter> {
        LimiterBuilder::new()
            .with_window(Duration::from_secs(10))
            .with_bucket_count(100)
            .with_cpu_threshold(cpu_threshold)
            .build_with_cpu_source(Arc::new(FixedCpu::new(cpu)))
            .unwrap()
    }

    #[test]
    fn single_request_never_self_drops() {
        let limiter = limiter_with_cpu(800, 1000);
        let completion = limiter.allow().expect("a single in-flight request is never dropped");
        assert_eq!(limiter.in_flight(), 1);
        drop(completion);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn completion_is_balanced() {
        let limiter = limiter_with_cpu(800, 100);
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(limiter.allow().unwrap());
        }
        assert_eq!(limiter.in_flight(), 5);
        handles.clear();
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn cool_cpu_with_no_prior_drop_always_admits() {
        let limiter = limiter_with_cpu(800, 100);
        for _ in 0..50 {
            // hold every completion open; a huge in_flight count still
            // must not trip shedding while CPU has never gone hot
            std::mem::forget(limiter.allow().unwrap());
        }
        assert!(limiter.allow().is_ok());
    }

    #[test]
    fn hot_cpu_sheds_once_capacity_estimate_is_exceeded() {
        let fixed_cpu = Arc::new(FixedCpu::new(900));
        let limiter = LimiterBuilder::new()
            .with_cpu_threshold(800)
            .build_with_cpu_source(fixed_cpu.clone())
            .unwrap();

        // drive pass_stat/rt_stat so max_in_flight settles at a small number
        for _ in 0..5 {
            let c = limiter.allow().unwrap();
            drop(c);
        }
        // push in_flight far beyond the derived ceiling without completing
        let mut held = Vec::new();
        for _ in 0..20 {
            if let Ok(c) = limiter.allow() {
                held.push(c);
            } else {
                break;
            }
        }
        assert!(limiter.allow().is_err(), "hot cpu + over-capacity must shed");
    }

    #[test]
    fn default_options_match_spec() {
        let opts = LimiterOptions::default();
        assert_eq!(opts.window, Duration::from_secs(10));
        assert_eq!(opts.bucket_count, 100);
        assert_eq!(opts.cpu_threshold, 800);
        assert_eq!(opts.sampling_interval, Duration::from_millis(500));
        assert_eq!(opts.decay, 0.95);
    }

    #[test]
    fn empty_history_floors_give_small_default_ceiling() {
        // buckets_per_second for default geometry is 10 (100ms buckets);
        // max_pass=1, min_rt=1 => max_in_flight = ceil(1*1*10/1000) = 1
        let limiter = limiter_with_cpu(800, 900);
        assert_eq!(limiter.max_in_flight(), 1);
    }

    #[test]
    fn hysteresis_tail_keeps_shedding_until_it_expires() {
        let clock = FakeClock::new();
        let cpu = Arc::new(FixedCpu::new(900));
        let limiter = LimiterBuilder::new()
            .with_cpu_threshold(800)
            .build_with_cpu_source_and_clock(cpu.clone(), clock.clone())
            .unwrap();

        // settle pass_stat/rt_stat so max_in_flight is small, then push
        // in_flight far beyond it while cpu is still hot
        for _ in 0..5 {
            drop(limiter.allow().unwrap());
        }
        let mut held = Vec::new();
        for _ in 0..20 {
            match limiter.allow() {
                Ok(c) => held.push(c),
                Err(_) => break,
            }
        }
        assert!(limiter.allow().is_err(), "hot cpu over capacity must shed");

        // cpu cools, but the 1s hysteresis tail should keep shedding while
        // in_flight still exceeds the ceiling
        cpu.set(100);
        clock.advance(Duration::from_millis(500));
        assert!(
            limiter.allow().is_err(),
            "within the hysteresis tail, over-capacity still sheds"
        );

        // past the 1s tail, shedding stops regardless of in_flight
        clock.advance(Duration::from_millis(600));
        assert!(
            limiter.allow().is_ok(),
            "past the hysteresis tail, cool cpu admits again"
        );
    }

    proptest! {
        /// Random interleavings of admit-and-release-immediately vs.
        /// admit-and-hold, run across real threads, must leave `in_flight`
        /// at exactly 0 once every held `Completion` has been dropped,
        /// regardless of the order threads happen to run in.
        #[test]
        fn in_flight_is_balanced_under_random_interleavings(
            hold_flags in prop::collection::vec(any::<bool>(), 1..40),
        ) {
            let limiter = limiter_with_cpu(800, 100);
            let held: Mutex<Vec<Completion>> = Mutex::new(Vec::new());

            std::thread::scope(|scope| {
                for hold in &hold_flags {
                    let limiter = limiter.clone();
                    let held = &held;
                    let hold = *hold;
                    scope.spawn(move || {
                        let completion = limiter.allow().expect("cool cpu never sheds");
                        if hold {
                            held.lock().push(completion);
                        }
                    });
                }
            });

            held.lock().clear();
            prop_assert_eq!(limiter.in_flight(), 0);
        }
    }
}
