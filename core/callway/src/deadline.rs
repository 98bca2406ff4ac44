// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Deadline resolution, the `grpc-timeout` text format and the per-call
//! deadline timer.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::MAX_TIMEOUT;
use crate::error::DeadlineError;

/// Absolute expiry of a call plus the relative budget it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(at: Instant, budget: Duration) -> Self {
        Self { at, budget }
    }

    /// Deadline `timeout` from now, clamped to [`MAX_TIMEOUT`].
    pub fn after(timeout: Duration) -> Self {
        Self::after_from(Instant::now(), timeout)
    }

    pub fn after_from(now: Instant, timeout: Duration) -> Self {
        let budget = timeout.min(MAX_TIMEOUT);
        Self {
            at: now + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Resolve the deadline of a new call from an inherited parent deadline and a
/// relative timeout. The earlier of the two wins.
pub fn resolve(parent: Option<Deadline>, timeout: Option<Duration>) -> Option<Deadline> {
    resolve_from(Instant::now(), parent, timeout)
}

pub fn resolve_from(
    now: Instant,
    parent: Option<Deadline>,
    timeout: Option<Duration>,
) -> Option<Deadline> {
    let own = timeout.map(|timeout| Deadline::after_from(now, timeout));
    match (parent, own) {
        (Some(parent), Some(own)) if parent.at <= own.at => Some(parent),
        (Some(_), Some(own)) => Some(own),
        (parent, own) => parent.or(own),
    }
}

// at most 8 digits are allowed by the wire format
const MAX_TIMEOUT_DIGITS: u128 = 99_999_999;

const TIMEOUT_UNITS: [(u128, char); 6] = [
    (1, 'n'),
    (1_000, 'u'),
    (1_000_000, 'm'),
    (1_000_000_000, 'S'),
    (60_000_000_000, 'M'),
    (3_600_000_000_000, 'H'),
];

/// Encode a relative timeout in the gRPC `<digits><unit>` format, using the
/// finest unit that fits. Values are rounded up.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    for (scale, unit) in TIMEOUT_UNITS {
        let value = nanos.div_ceil(scale);
        if value <= MAX_TIMEOUT_DIGITS {
            return format!("{}{}", value, unit);
        }
    }
    format!("{}H", MAX_TIMEOUT_DIGITS)
}

pub fn parse_timeout(value: &str) -> Result<Duration, DeadlineError> {
    let malformed = || DeadlineError::Malformed(value.to_string());

    let trimmed = value.trim();
    if !trimmed.is_ascii() || trimmed.len() < 2 || trimmed.len() > 9 {
        return Err(malformed());
    }

    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let amount: u64 = digits.parse().map_err(|_| malformed())?;

    match unit {
        "H" => Ok(Duration::from_secs(amount * 3600)),
        "M" => Ok(Duration::from_secs(amount * 60)),
        "S" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_millis(amount)),
        "u" => Ok(Duration::from_micros(amount)),
        "n" => Ok(Duration::from_nanos(amount)),
        _ => Err(malformed()),
    }
}

/// Single-use timer driving a call to DEADLINE_EXCEEDED.
///
/// The timer is armed at most once and disarmed at most once. Once disarmed the
/// expiry callback never runs, even if the deadline already passed.
#[derive(Debug)]
pub struct DeadlineTimer {
    call_id: u64,
    deadline: Deadline,
    armed: AtomicBool,
    cancellation_token: CancellationToken,
}

impl DeadlineTimer {
    pub fn new(call_id: u64, deadline: Deadline) -> Self {
        DeadlineTimer {
            call_id,
            deadline,
            armed: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Arm the timer. Returns false if it was already armed or disarmed.
    pub fn arm<F, Fut>(&self, on_expiry: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.armed.swap(true, Ordering::AcqRel) || self.cancellation_token.is_cancelled() {
            return false;
        }

        let call_id = self.call_id;
        let at = self.deadline.at();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            trace!(%call_id, "deadline timer armed");
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    trace!(%call_id, "deadline timer disarmed");
                }
                _ = time::sleep_until(at) => {
                    if cancellation_token.is_cancelled() {
                        return;
                    }
                    debug!(%call_id, "deadline expired");
                    on_expiry().await;
                }
            }
        });

        true
    }

    /// Disarm the timer. Only the first call returns true.
    pub fn disarm(&self) -> bool {
        if self.cancellation_token.is_cancelled() {
            return false;
        }
        self.cancellation_token.cancel();
        true
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use tracing_test::traced_test;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_resolve() {
        let now = Instant::now();
        let parent = Deadline::after_from(now, Duration::from_secs(1));

        // the parent deadline is earlier
        let resolved = resolve_from(now, Some(parent), Some(Duration::from_secs(2))).unwrap();
        assert_eq!(resolved.at(), now + Duration::from_secs(1));

        // the own timeout is earlier
        let resolved = resolve_from(now, Some(parent), Some(Duration::from_millis(500))).unwrap();
        assert_eq!(resolved.at(), now + Duration::from_millis(500));
        assert_eq!(resolved.budget(), Duration::from_millis(500));

        let resolved = resolve_from(now, None, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(resolved.at(), now + Duration::from_secs(2));

        assert_eq!(resolve_from(now, Some(parent), None), Some(parent));
        assert_eq!(resolve_from(now, None, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_expired_parent() {
        time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        let parent = Deadline::new(now - Duration::from_secs(1), Duration::from_secs(1));

        let resolved = resolve(Some(parent), Some(Duration::from_secs(5))).unwrap();
        assert!(resolved.is_expired());
        assert_eq!(resolved.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_is_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_timeout_is_clamped() {
        let deadline = Deadline::after(Duration::from_secs(100_000));
        assert_eq!(deadline.budget(), MAX_TIMEOUT);
    }

    #[test]
    fn test_encode_timeout() {
        assert_eq!(encode_timeout(Duration::ZERO), "0n");
        assert_eq!(encode_timeout(Duration::from_nanos(1500)), "1500n");
        assert_eq!(encode_timeout(Duration::from_secs(1)), "1000000u");
        assert_eq!(encode_timeout(Duration::from_secs(1000)), "1000000m");
        assert_eq!(encode_timeout(MAX_TIMEOUT), "36000000m");
        assert_eq!(encode_timeout(Duration::from_secs(200_000)), "200000S");
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("1S"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_timeout("250m"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_timeout("2H"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_timeout("3M"), Ok(Duration::from_secs(180)));
        assert_eq!(parse_timeout("10u"), Ok(Duration::from_micros(10)));
        assert_eq!(parse_timeout("99999999n"), Ok(Duration::from_nanos(99_999_999)));

        for bad in ["", "S", "10", "10s", "-1S", "123456789S", "1.5S", "1é"] {
            assert_eq!(
                parse_timeout(bad),
                Err(DeadlineError::Malformed(bad.to_string())),
                "value {bad:?}"
            );
        }
    }

    #[test]
    fn test_encoded_timeout_never_shrinks() {
        for timeout in [
            Duration::from_nanos(1),
            Duration::from_millis(999),
            Duration::from_secs(1),
            Duration::from_secs(3601),
        ] {
            let parsed = parse_timeout(&encode_timeout(timeout)).unwrap();
            assert!(parsed >= timeout);
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DeadlineTimer::new(7, Deadline::after(Duration::from_millis(100)));

        let counter = fired.clone();
        assert!(timer.arm(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!timer.arm(|| async {}));

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(logs_contain("deadline expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DeadlineTimer::new(8, Deadline::after(Duration::from_millis(100)));

        let counter = fired.clone();
        timer.arm(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.disarm());
        assert!(!timer.disarm());
        assert!(!timer.arm(|| async {}));

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
