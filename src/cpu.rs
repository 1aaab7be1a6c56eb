//! Process-wide CPU load estimation.
//!
//! A single background task periodically samples cumulative CPU counters
//! and folds them into an exponentially-smoothed load figure, published as
//! an atomic scalar scaled so that `1000` means "100% of aggregated cores".
//! The sampling source is abstracted behind [`CpuSampler`] so the estimator
//! itself stays portable and testable; [`ProcStatCpuSampler`] is the Linux
//! `/proc/stat` reader named as an external collaborator by the spec.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Cumulative CPU time counters, as read from `/proc/stat`'s aggregate
/// `cpu` line (all values in USER_HZ ticks).
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSnapshot {
    /// Idle time.
    pub idle: u64,
    /// Time waiting for I/O.
    pub iowait: u64,
    /// Time in user mode.
    pub user: u64,
    /// Time in user mode with low priority (nice).
    pub nice: u64,
    /// Time in kernel mode.
    pub system: u64,
    /// Time servicing hardware interrupts.
    pub irq: u64,
    /// Time servicing software interrupts.
    pub softirq: u64,
    /// Time stolen by other virtualized guests.
    pub steal: u64,
}

impl CpuSnapshot {
    fn idle_group(&self) -> u64 {
        self.idle + self.iowait
    }

    fn busy_group(&self) -> u64 {
        self.user + self.nice + self.system + self.irq + self.softirq + self.steal
    }

    fn total(&self) -> u64 {
        self.idle_group() + self.busy_group()
    }
}

/// Abstract capability: "provide the current cumulative CPU counters".
/// The only dependency the controller has on `/proc/stat`, which is
/// Linux-only; implementors may read platform APIs elsewhere or script a
/// fixed sequence of snapshots for tests.
pub trait CpuSampler: Send + Sync {
    /// Read the current cumulative CPU counters.
    fn sample(&self) -> io::Result<CpuSnapshot>;
}

/// Reads the aggregate `cpu` line of Linux's `/proc/stat`.
#[derive(Debug, Default)]
pub struct ProcStatCpuSampler;

impl ProcStatCpuSampler {
    /// Construct a new sampler.
    pub fn new() -> Self {
        Self
    }

    fn parse(contents: &str) -> io::Result<CpuSnapshot> {
        let line = contents
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no aggregate cpu line"))?;

        let mut fields = line.split_whitespace().skip(1);
        let mut next = || -> io::Result<u64> {
            fields
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated cpu line"))?
                .parse::<u64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };

        Ok(CpuSnapshot {
            user: next()?,
            nice: next()?,
            system: next()?,
            idle: next()?,
            iowait: next()?,
            irq: next()?,
            softirq: next()?,
            steal: next()?,
        })
    }
}

impl CpuSampler for ProcStatCpuSampler {
    fn sample(&self) -> io::Result<CpuSnapshot> {
        let contents = std::fs::read_to_string("/proc/stat")?;
        Self::parse(&contents)
    }
}

/// A scripted [`CpuSampler`] for tests: returns queued snapshots in order,
/// then repeats the last one. A queued `None` simulates a read failure.
#[derive(Default)]
pub struct FakeCpuSampler {
    queue: Mutex<VecDeque<Option<CpuSnapshot>>>,
    last: Mutex<Option<CpuSnapshot>>,
}

impl FakeCpuSampler {
    /// Construct an empty fake; snapshots must be pushed with [`Self::push`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next value `sample()` will return.
    pub fn push(&self, snapshot: CpuSnapshot) {
        self.queue.lock().push_back(Some(snapshot));
    }

    /// Queue a simulated read failure.
    pub fn push_failure(&self) {
        self.queue.lock().push_back(None);
    }
}

impl CpuSampler for FakeCpuSampler {
    fn sample(&self) -> io::Result<CpuSnapshot> {
        let next = self.queue.lock().pop_front();
        match next {
            Some(Some(snapshot)) => {
                *self.last.lock() = Some(snapshot);
                Ok(snapshot)
            }
            Some(None) => Err(io::Error::other("simulated sampler failure")),
            None => self
                .last
                .lock()
                .ok_or_else(|| io::Error::other("no snapshot queued")),
        }
    }
}

/// Smoothed, process-wide CPU load estimator.
///
/// `current()` returns the EMA-smoothed load scaled so `1000` equals 100%
/// of aggregated core time. A single background task owns the only writer
/// side; every caller of `current()` is a lock-free reader.
pub struct CpuEstimator {
    value: Arc<AtomicI64>,
    task: JoinHandle<()>,
}

impl CpuEstimator {
    /// Spawn a new estimator sampling `sampler` every `sampling_interval`,
    /// smoothing with the given EMA `decay` (weight retained from the
    /// prior value; higher is slower to react).
    pub fn spawn(
        sampler: Arc<dyn CpuSampler>,
        sampling_interval: Duration,
        decay: f64,
    ) -> Self {
        let value = Arc::new(AtomicI64::new(0));
        let task = Self::spawn_supervised(value.clone(), sampler, sampling_interval, decay);
        Self { value, task }
    }

    /// Current smoothed CPU load, in `0..=1000`.
    pub fn current(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Stop the background sampling task. Dropping the estimator does this
    /// automatically; exposed so callers can shut one down deterministically
    /// without waiting for drop order.
    pub fn stop(&self) {
        self.task.abort();
    }

    fn spawn_supervised(
        value: Arc<AtomicI64>,
        sampler: Arc<dyn CpuSampler>,
        sampling_interval: Duration,
        decay: f64,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let handle = tokio::spawn(Self::sample_loop(
                    value.clone(),
                    sampler.clone(),
                    sampling_interval,
                    decay,
                ));
                match handle.await {
                    Ok(()) => break,
                    Err(join_err) if join_err.is_cancelled() => break,
                    Err(_) => {
                        tracing::warn!("cpu estimator sampling task panicked; restarting");
                    }
                }
            }
        })
    }

    async fn sample_loop(
        value: Arc<AtomicI64>,
        sampler: Arc<dyn CpuSampler>,
        sampling_interval: Duration,
        decay: f64,
    ) {
        let mut ticker = tokio::time::interval(sampling_interval);
        let mut prev: Option<CpuSnapshot> = None;
        loop {
            ticker.tick().await;
            match sampler.sample() {
                Ok(snapshot) => {
                    if let Some(prev_snapshot) = prev {
                        let d_total = snapshot.total().saturating_sub(prev_snapshot.total());
                        let d_idle = snapshot
                            .idle_group()
                            .saturating_sub(prev_snapshot.idle_group());
                        if d_total != 0 {
                            let usage = (d_total.saturating_sub(d_idle)) as f64 / d_total as f64;
                            let prev_load = value.load(Ordering::Acquire) as f64;
                            let new_load = prev_load * decay + (usage * 1000.0) * (1.0 - decay);
                            value.store(new_load as i64, Ordering::Release);
                        }
                    }
                    prev = Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cpu sample read failed; retaining last value");
                }
            }
        }
    }
}

impl Drop for CpuEstimator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Anything the limiter can read a smoothed `0..=1000` CPU load from.
/// Implemented by [`CpuEstimator`]; tests can substitute [`FixedCpu`].
pub trait CpuSource: Send + Sync {
    /// Current smoothed CPU load, in `0..=1000`.
    fn current(&self) -> i64;
}

impl CpuSource for CpuEstimator {
    fn current(&self) -> i64 {
        CpuEstimator::current(self)
    }
}

/// A [`CpuSource`] pinned to a fixed, test-controlled value.
#[derive(Debug, Default)]
pub struct FixedCpu(AtomicI64);

impl FixedCpu {
    /// Construct a source pinned at `value`.
    pub fn new(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    /// Change the pinned value.
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }
}

impl CpuSource for FixedCpu {
    fn current(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

static GLOBAL: OnceCell<CpuEstimator> = OnceCell::new();

/// Process-wide estimator, lazily spawned on first use with the default
/// `/proc/stat` sampler, 500ms sampling interval, and 0.95 decay.
///
/// Limiters are free to construct their own [`CpuEstimator`] (e.g. with a
/// [`FakeCpuSampler`] in tests) instead of reaching for this holder.
pub fn global() -> &'static CpuEstimator {
    GLOBAL.get_or_init(|| {
        CpuEstimator::spawn(
            Arc::new(ProcStatCpuSampler::new()),
            Duration::from_millis(500),
            0.95,
        )
    })
}
