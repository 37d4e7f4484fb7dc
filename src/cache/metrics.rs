// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for exchange-cache decisions.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
	hits: AtomicU64,
	exchanges: AtomicU64,
	coalesced: AtomicU64,
	failures: AtomicU64,
	evictions: AtomicU64,
}
impl ExchangeMetrics {
	/// Returns the number of lookups served from a fresh cached credential.
	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	/// Returns the number of exchanges started against the identity provider.
	pub fn exchanges(&self) -> u64 {
		self.exchanges.load(Ordering::Relaxed)
	}

	/// Returns the number of lookups that joined an exchange already in flight.
	pub fn coalesced(&self) -> u64 {
		self.coalesced.load(Ordering::Relaxed)
	}

	/// Returns the number of exchanges that failed.
	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	/// Returns the number of entries removed by idle or expiry sweeps.
	pub fn evictions(&self) -> u64 {
		self.evictions.load(Ordering::Relaxed)
	}

	pub(crate) fn record_hit(&self) {
		self.hits.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_exchange(&self) {
		self.exchanges.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_coalesced(&self) {
		self.coalesced.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_evictions(&self, count: usize) {
		self.evictions.fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
	}
}
