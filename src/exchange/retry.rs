//! Bounded exponential backoff for transient upstream failures.

// crates.io
use rand::Rng;
// self
use crate::_prelude::*;

/// Retry budget applied to token-endpoint and backend calls.
///
/// Only errors reporting [`Error::is_retryable`] are retried. Delays double per attempt from
/// `initial_backoff` up to `max_backoff`; a `Retry-After` hint raises the delay but never past
/// `max_backoff`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total attempts including the first call. Values below one behave as one.
	pub max_attempts: u32,
	/// Delay before the second attempt.
	pub initial_backoff: Duration,
	/// Ceiling for any single delay.
	pub max_backoff: Duration,
	/// Randomizes the upper half of each delay to spread synchronized retries.
	pub jitter: bool,
}
impl RetryPolicy {
	/// Policy that never retries.
	pub const fn none() -> Self {
		Self {
			max_attempts: 1,
			initial_backoff: Duration::ZERO,
			max_backoff: Duration::ZERO,
			jitter: false,
		}
	}

	/// Delay to wait after failed attempt number `attempt` (1-based).
	pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
		let exponent = attempt.saturating_sub(1).min(16);
		let base = self
			.initial_backoff
			.checked_mul(1_i32 << exponent)
			.unwrap_or(self.max_backoff)
			.min(self.max_backoff)
			.max(Duration::ZERO);
		let base = if self.jitter && base.whole_milliseconds() > 1 {
			let half = base / 2_i32;
			let spread = u64::try_from(half.whole_milliseconds()).unwrap_or(0);
			let extra = rand::rng().random_range(0..=spread);

			half + Duration::milliseconds(i64::try_from(extra).unwrap_or(0))
		} else {
			base
		};

		match hint {
			Some(hint) => base.max(hint.min(self.max_backoff)),
			None => base,
		}
	}

	/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
	pub(crate) async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let max_attempts = self.max_attempts.max(1);
		let mut attempt = 1;

		loop {
			match op().await {
				Ok(value) => return Ok(value),
				Err(err) if err.is_retryable() && attempt < max_attempts => {
					let delay = self.delay_for(attempt, err.retry_after());

					#[cfg(feature = "tracing")]
					tracing::debug!(
						op = op_name,
						attempt,
						delay_ms = delay.whole_milliseconds() as u64,
						error = %err,
						"retrying transient failure"
					);
					#[cfg(not(feature = "tracing"))]
					let _ = op_name;

					tokio::time::sleep(delay.unsigned_abs()).await;

					attempt += 1;
				},
				Err(err) => return Err(err),
			}
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_backoff: Duration::milliseconds(200),
			max_backoff: Duration::seconds(2),
			jitter: true,
		}
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicU32, Ordering};
	// self
	use super::*;
	use crate::error::{ExchangeError, TransportError};

	fn fixed() -> RetryPolicy {
		RetryPolicy {
			max_attempts: 4,
			initial_backoff: Duration::milliseconds(100),
			max_backoff: Duration::milliseconds(300),
			jitter: false,
		}
	}

	#[test]
	fn delays_double_and_cap() {
		let policy = fixed();

		assert_eq!(policy.delay_for(1, None), Duration::milliseconds(100));
		assert_eq!(policy.delay_for(2, None), Duration::milliseconds(200));
		assert_eq!(policy.delay_for(3, None), Duration::milliseconds(300));
		assert_eq!(policy.delay_for(40, None), Duration::milliseconds(300));
	}

	#[test]
	fn retry_after_hint_is_bounded() {
		let policy = fixed();
		let hinted = policy.delay_for(1, Some(Duration::milliseconds(250)));
		let capped = policy.delay_for(1, Some(Duration::seconds(30)));

		assert_eq!(hinted, Duration::milliseconds(250));
		assert_eq!(capped, Duration::milliseconds(300));
	}

	#[test]
	fn jitter_stays_within_bounds() {
		let policy = RetryPolicy { jitter: true, ..fixed() };

		for _ in 0..32 {
			let delay = policy.delay_for(2, None);

			assert!(delay >= Duration::milliseconds(100) && delay <= Duration::milliseconds(200));
		}
	}

	#[tokio::test]
	async fn only_retryable_errors_are_retried() {
		let policy = RetryPolicy { initial_backoff: Duration::milliseconds(1), ..fixed() };
		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result: Result<()> = policy
			.run("test", || async move {
				calls.fetch_add(1, Ordering::SeqCst);

				Err(Error::from(ExchangeError::InvalidGrant { reason: "revoked".into() }))
			})
			.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result = policy
			.run("test", || async move {
				if calls.fetch_add(1, Ordering::SeqCst) < 2 {
					return Err(Error::from(ExchangeError::from(TransportError::network("reset"))));
				}

				Ok(7)
			})
			.await;

		assert_eq!(result.expect("Third attempt should succeed."), 7);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn attempts_are_capped() {
		let policy = RetryPolicy { initial_backoff: Duration::milliseconds(1), ..fixed() };
		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result: Result<()> = policy
			.run("test", || async move {
				calls.fetch_add(1, Ordering::SeqCst);

				Err(Error::from(ExchangeError::from(TransportError::network("reset"))))
			})
			.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 4);
	}
}
