//! Rate limiting for task execution
//!
//! Two variants share one permit bucket: [`StableRateLimiter`] refills to a
//! fixed threshold every period, [`RampUpRateLimiter`] raises its threshold
//! by a step every ramp period until it reaches the ceiling.

use crate::error::{Error, Result};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How often the available permits are reset to the current threshold
pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(1);

/// Ramp-up spec value that disables ramping
pub const RAMP_DISABLED: &str = "-1";

/// Permit bucket shared by the limiter and its background refill tasks
#[derive(Debug)]
struct Bucket {
    threshold: AtomicI64,
    available: AtomicI64,
    refilled: Notify,
}

impl Bucket {
    fn new() -> Self {
        Self {
            threshold: AtomicI64::new(0),
            available: AtomicI64::new(0),
            refilled: Notify::new(),
        }
    }

    fn try_take(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
    }

    fn refill(&self) {
        self.available
            .store(self.threshold.load(Ordering::Acquire), Ordering::Release);
        self.refilled.notify_waiters();
    }
}

fn spawn_refiller(bucket: Arc<Bucket>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            bucket.refill();
        }
    })
}

/// Fixed number of permits per period
pub struct StableRateLimiter {
    threshold: i64,
    period: Duration,
    bucket: Arc<Bucket>,
    refiller: Mutex<Option<JoinHandle<()>>>,
}

impl StableRateLimiter {
    /// `threshold` permits per second
    pub fn new(threshold: i64) -> Self {
        Self::with_period(threshold, DEFAULT_REFILL_PERIOD)
    }

    /// `threshold` permits per `period`
    pub fn with_period(threshold: i64, period: Duration) -> Self {
        Self {
            threshold: threshold.max(0),
            period,
            bucket: Arc::new(Bucket::new()),
            refiller: Mutex::new(None),
        }
    }

    fn start(&self) {
        let mut refiller = self.refiller.lock();
        if refiller.is_some() {
            return;
        }
        self.bucket.threshold.store(self.threshold, Ordering::Release);
        self.bucket.refill();
        *refiller = Some(spawn_refiller(Arc::clone(&self.bucket), self.period));
    }

    fn stop(&self) {
        if let Some(handle) = self.refiller.lock().take() {
            handle.abort();
        }
        self.bucket.refilled.notify_waiters();
    }
}

/// Threshold that grows by `ramp_up_step` every `ramp_up_period`
pub struct RampUpRateLimiter {
    max_threshold: i64,
    ramp_up_step: i64,
    ramp_up_period: Duration,
    refill_period: Duration,
    bucket: Arc<Bucket>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RampUpRateLimiter {
    /// Create a ramp-up limiter
    ///
    /// A non-positive `max_threshold` means the ramp has no ceiling.
    pub fn new(max_threshold: i64, ramp_up_step: i64, ramp_up_period: Duration) -> Self {
        let max_threshold = if max_threshold <= 0 {
            i64::MAX
        } else {
            max_threshold
        };
        Self {
            max_threshold,
            ramp_up_step,
            ramp_up_period,
            refill_period: DEFAULT_REFILL_PERIOD,
            bucket: Arc::new(Bucket::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Ceiling the threshold ramps toward
    pub fn max_threshold(&self) -> i64 {
        self.max_threshold
    }

    /// Threshold increase per ramp period
    pub fn ramp_up_step(&self) -> i64 {
        self.ramp_up_step
    }

    /// Interval between threshold increases
    pub fn ramp_up_period(&self) -> Duration {
        self.ramp_up_period
    }

    fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }

        let first = self.ramp_up_step.min(self.max_threshold);
        self.bucket.threshold.store(first, Ordering::Release);
        self.bucket.refill();

        let bucket = Arc::clone(&self.bucket);
        let (step, max, period) = (self.ramp_up_step, self.max_threshold, self.ramp_up_period);
        background.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = bucket.threshold.load(Ordering::Acquire);
                let next = current.saturating_add(step).min(max);
                bucket.threshold.store(next, Ordering::Release);
                if next >= max {
                    tracing::debug!(threshold = next, "rate limiter reached its ceiling");
                    break;
                }
            }
        }));
        background.push(spawn_refiller(
            Arc::clone(&self.bucket),
            self.refill_period,
        ));
    }

    fn stop(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.bucket.refilled.notify_waiters();
    }
}

/// Admission control for execution units
pub enum RateLimiter {
    /// Fixed ceiling
    Stable(StableRateLimiter),
    /// Ceiling reached gradually
    RampUp(RampUpRateLimiter),
}

impl RateLimiter {
    /// Build a limiter from the facade options
    ///
    /// `increase_rate` is `-1` (no ramp), `<step>/<period>` such as `2/2s`,
    /// or a bare step applied every second. Without a ramp a positive
    /// `max_rps` gives a stable limiter and anything else no limiter at all.
    ///
    /// # Examples
    /// ```
    /// use boomer_core::RateLimiter;
    ///
    /// assert!(RateLimiter::from_options(0, "-1").unwrap().is_none());
    /// assert!(RateLimiter::from_options(100, "-1").unwrap().is_some());
    /// assert!(RateLimiter::from_options(10, "2/2s").unwrap().is_some());
    /// assert!(RateLimiter::from_options(10, "fast").is_err());
    /// ```
    pub fn from_options(max_rps: i64, increase_rate: &str) -> Result<Option<Self>> {
        match parse_ramp_spec(increase_rate)? {
            Some((step, period)) => Ok(Some(Self::RampUp(RampUpRateLimiter::new(
                max_rps, step, period,
            )))),
            None if max_rps > 0 => Ok(Some(Self::Stable(StableRateLimiter::new(max_rps)))),
            None => Ok(None),
        }
    }

    fn bucket(&self) -> &Bucket {
        match self {
            Self::Stable(limiter) => &limiter.bucket,
            Self::RampUp(limiter) => &limiter.bucket,
        }
    }

    /// Begin background replenishment; idempotent
    pub fn start(&self) {
        match self {
            Self::Stable(limiter) => limiter.start(),
            Self::RampUp(limiter) => limiter.start(),
        }
    }

    /// Stop background replenishment and wake blocked callers
    pub fn stop(&self) {
        match self {
            Self::Stable(limiter) => limiter.stop(),
            Self::RampUp(limiter) => limiter.stop(),
        }
    }

    /// Try to take a permit without waiting
    ///
    /// Returns `true` when the caller is blocked and must skip this tick.
    pub fn acquire(&self) -> bool {
        !self.bucket().try_take()
    }

    /// Take a permit, or wait for the next refill when none is left
    ///
    /// Returns `true` (blocked) after waiting; the caller skips the tick and
    /// retries, so a blocked unit sleeps instead of spinning.
    pub async fn acquire_wait(&self) -> bool {
        let bucket = self.bucket();
        let refilled = bucket.refilled.notified();
        if bucket.try_take() {
            return false;
        }
        refilled.await;
        true
    }

    /// Permits granted per refill period right now
    pub fn current_threshold(&self) -> i64 {
        self.bucket().threshold.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable(limiter) => f
                .debug_struct("StableRateLimiter")
                .field("threshold", &limiter.threshold)
                .field("period", &limiter.period)
                .finish(),
            Self::RampUp(limiter) => f
                .debug_struct("RampUpRateLimiter")
                .field("max_threshold", &limiter.max_threshold)
                .field("ramp_up_step", &limiter.ramp_up_step)
                .field("ramp_up_period", &limiter.ramp_up_period)
                .field("current_threshold", &self.current_threshold())
                .finish(),
        }
    }
}

/// Parse a ramp-up spec into `(step, period)`; `None` when ramping is off
pub fn parse_ramp_spec(spec: &str) -> Result<Option<(i64, Duration)>> {
    let spec = spec.trim();
    if spec.is_empty() || spec == RAMP_DISABLED {
        return Ok(None);
    }

    let (step, period) = match spec.split_once('/') {
        Some((step, period)) => (step.trim(), parse_period(period.trim(), spec)?),
        None => (spec, Duration::from_secs(1)),
    };

    let step: i64 = step
        .parse()
        .map_err(|_| Error::RateSpec(format!("step must be an integer in {spec:?}")))?;
    if step <= 0 {
        return Err(Error::RateSpec(format!("step must be positive in {spec:?}")));
    }
    if period.is_zero() {
        return Err(Error::RateSpec(format!("period must be positive in {spec:?}")));
    }

    Ok(Some((step, period)))
}

fn parse_period(period: &str, spec: &str) -> Result<Duration> {
    let unit_at = period
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(period.len());
    let (value, unit) = period.split_at(unit_at);
    let value: f64 = value
        .parse()
        .map_err(|_| Error::RateSpec(format!("bad period in {spec:?}")))?;

    let secs = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(Error::RateSpec(format!(
                "unknown period unit {other:?} in {spec:?}"
            )))
        }
    };
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_granted(limiter: &RateLimiter, attempts: usize) -> i64 {
        (0..attempts).filter(|_| !limiter.acquire()).count() as i64
    }

    #[test]
    fn test_parse_disabled() {
        assert_eq!(parse_ramp_spec("-1").unwrap(), None);
        assert_eq!(parse_ramp_spec("").unwrap(), None);
    }

    #[test]
    fn test_parse_step_and_period() {
        assert_eq!(
            parse_ramp_spec("2/2s").unwrap(),
            Some((2, Duration::from_secs(2)))
        );
        assert_eq!(
            parse_ramp_spec("10/500ms").unwrap(),
            Some((10, Duration::from_millis(500)))
        );
        assert_eq!(
            parse_ramp_spec("1/1m").unwrap(),
            Some((1, Duration::from_secs(60)))
        );
    }

    #[test]
    fn test_parse_bare_integer_means_per_second() {
        assert_eq!(
            parse_ramp_spec("5").unwrap(),
            Some((5, Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_ramp_spec("abc").is_err());
        assert!(parse_ramp_spec("2/xs").is_err());
        assert!(parse_ramp_spec("0/1s").is_err());
        assert!(parse_ramp_spec("2/0s").is_err());
        assert!(parse_ramp_spec("-3").is_err());
    }

    #[test]
    fn test_from_options_variants() {
        assert!(RateLimiter::from_options(0, "-1").unwrap().is_none());
        assert!(RateLimiter::from_options(-5, "-1").unwrap().is_none());
        assert!(matches!(
            RateLimiter::from_options(100, "-1").unwrap(),
            Some(RateLimiter::Stable(_))
        ));
        assert!(matches!(
            RateLimiter::from_options(0, "3").unwrap(),
            Some(RateLimiter::RampUp(_))
        ));
    }

    #[test]
    fn test_ramp_up_max_threshold() {
        match RateLimiter::from_options(10, "2/2s").unwrap() {
            Some(RateLimiter::RampUp(limiter)) => {
                assert_eq!(limiter.max_threshold(), 10);
                assert_eq!(limiter.ramp_up_step(), 2);
                assert_eq!(limiter.ramp_up_period(), Duration::from_secs(2));
            }
            other => panic!("expected ramp-up limiter, got {other:?}"),
        }
    }

    #[test]
    fn test_ramp_up_without_ceiling() {
        let limiter = RampUpRateLimiter::new(0, 5, Duration::from_secs(1));
        assert_eq!(limiter.max_threshold(), i64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_exhausts_then_refills() {
        let limiter = RateLimiter::Stable(StableRateLimiter::new(3));
        limiter.start();

        assert_eq!(count_granted(&limiter, 10), 3);
        assert!(limiter.acquire());

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(count_granted(&limiter, 10), 3);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let limiter = RateLimiter::Stable(StableRateLimiter::new(2));
        limiter.start();
        assert!(!limiter.acquire());
        limiter.start();
        // a second start must not refill the bucket
        assert_eq!(count_granted(&limiter, 5), 1);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_is_monotonic_and_capped() {
        let limiter = RateLimiter::from_options(10, "2/2s").unwrap().unwrap();
        limiter.start();

        // offset samples from the refill and ramp ticks
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut previous = 0;
        for _ in 0..30 {
            let threshold = limiter.current_threshold();
            assert!(threshold >= previous, "threshold went down");
            assert!(threshold <= 10, "threshold exceeded ceiling");

            let granted = count_granted(&limiter, 50);
            assert!(granted <= 10, "granted {granted} permits in one period");
            previous = threshold;

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(limiter.current_threshold(), 10);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_starts_at_first_step() {
        let limiter = RateLimiter::from_options(0, "4/1s").unwrap().unwrap();
        limiter.start();
        assert_eq!(limiter.current_threshold(), 4);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(limiter.current_threshold(), 8);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_blocks_until_refill() {
        let limiter = RateLimiter::Stable(StableRateLimiter::new(1));
        limiter.start();

        assert!(!limiter.acquire_wait().await);

        let start = Instant::now();
        assert!(limiter.acquire_wait().await);
        assert!(start.elapsed() >= Duration::from_secs(1));

        assert!(!limiter.acquire_wait().await);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_waiters() {
        let limiter = Arc::new(RateLimiter::Stable(StableRateLimiter::new(1)));
        limiter.start();
        assert!(!limiter.acquire());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire_wait().await })
        };
        tokio::task::yield_now().await;
        limiter.stop();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_rate_limiter_debug() {
        let limiter = RateLimiter::Stable(StableRateLimiter::new(100));
        let debug = format!("{limiter:?}");
        assert!(debug.contains("StableRateLimiter"));
        assert!(debug.contains("100"));
    }
}
