//! Per-(subject, tenant, scope) memoization of exchanged credentials with singleflight
//! coalescing.
//!
//! [`ExchangeCache::get_or_exchange`] is the only way to read or write cached credentials.
//! A fresh entry is returned straight from a shared read lock. Otherwise the caller either
//! joins the [`InFlightExchange`] already registered for the key or installs one and becomes
//! its initiator, so at most one exchange per key is ever outstanding.
//!
//! The exchange itself runs as a spawned Tokio task. The task stores the credential (on
//! success) and removes the placeholder under one lock, then every waiter observes the same
//! outcome. Dropping a waiter never cancels the exchange other waiters depend on, and a failed
//! exchange caches nothing.
//!
//! Lock order is `in_flight` before `entries`; no path acquires them in the other order.

mod metrics;

pub use metrics::ExchangeMetrics;

// std
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
// crates.io
use futures::{
	FutureExt,
	future::{BoxFuture, Shared},
};
// self
use crate::{
	_prelude::*,
	auth::{CachedCredential, CredentialStatus, IdentityContext, ScopeSet, SubjectId, TenantId},
	error::ExchangeError,
	exchange::CredentialExchanger,
};

type SharedExchange = Shared<BoxFuture<'static, Result<CachedCredential>>>;

/// Cache lookup key: exact match on subject, tenant, and normalized target scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeKey {
	/// Subject the credential speaks for.
	pub subject: SubjectId,
	/// Tenant that issued the inbound token.
	pub tenant: TenantId,
	/// Normalized, space-delimited target scope.
	pub scope: String,
}
impl ExchangeKey {
	/// Builds the key for `identity` requesting `scope`.
	pub fn new(identity: &IdentityContext, scope: &ScopeSet) -> Self {
		Self {
			subject: identity.subject.clone(),
			tenant: identity.tenant.clone(),
			scope: scope.normalized(),
		}
	}
}
impl Display for ExchangeKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "{}/{}/{}", self.tenant, self.subject, self.scope)
	}
}

/// A single lookup against the cache.
#[derive(Clone, Copy, Debug)]
pub struct CredentialRequest<'a> {
	/// Verified caller.
	pub identity: &'a IdentityContext,
	/// Target scope for the outbound credential.
	pub scope: &'a ScopeSet,
	rejected: Option<&'a CachedCredential>,
}
impl<'a> CredentialRequest<'a> {
	/// Requests a credential for `identity` scoped to `scope`.
	pub fn new(identity: &'a IdentityContext, scope: &'a ScopeSet) -> Self {
		Self { identity, scope, rejected: None }
	}

	/// Bypasses the cached `rejected` credential, forcing a new exchange unless another caller
	/// already replaced it.
	pub fn replacing(mut self, rejected: &'a CachedCredential) -> Self {
		self.rejected = Some(rejected);

		self
	}

	/// Returns `true` when this request bypasses a rejected credential.
	pub fn is_forced(&self) -> bool {
		self.rejected.is_some()
	}

	fn accepts(&self, cached: &CachedCredential) -> bool {
		match self.rejected {
			Some(rejected) => cached.credential != rejected.credential,
			None => true,
		}
	}
}

/// Freshness and size policy for [`ExchangeCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
	/// Credentials this close to expiry are treated as stale and replaced.
	pub staleness_margin: Duration,
	/// Entries unused for this long are evicted.
	pub idle_eviction: Duration,
	/// Minimum spacing between opportunistic eviction sweeps.
	pub sweep_interval: Duration,
}
impl Default for CachePolicy {
	fn default() -> Self {
		Self {
			staleness_margin: Duration::seconds(60),
			idle_eviction: Duration::minutes(15),
			sweep_interval: Duration::minutes(1),
		}
	}
}

/// Shared placeholder for an exchange currently in progress.
#[derive(Clone)]
pub struct InFlightExchange {
	id: u64,
	outcome: SharedExchange,
}
impl InFlightExchange {
	/// Waits for the exchange to finish and returns its outcome.
	pub async fn wait(self) -> Result<CachedCredential> {
		self.outcome.await
	}
}
impl Debug for InFlightExchange {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("InFlightExchange").field("id", &self.id).finish_non_exhaustive()
	}
}

struct CacheEntry {
	credential: CachedCredential,
	last_used: AtomicI64,
}
impl CacheEntry {
	fn new(credential: CachedCredential, now: OffsetDateTime) -> Self {
		Self { credential, last_used: AtomicI64::new(now.unix_timestamp()) }
	}

	fn touch(&self, now: OffsetDateTime) {
		self.last_used.fetch_max(now.unix_timestamp(), Ordering::Relaxed);
	}

	fn idle_for(&self, now: OffsetDateTime) -> Duration {
		Duration::seconds(now.unix_timestamp() - self.last_used.load(Ordering::Relaxed))
	}
}

#[derive(Default)]
struct CacheState {
	entries: RwLock<HashMap<ExchangeKey, Arc<CacheEntry>>>,
	in_flight: Mutex<HashMap<ExchangeKey, InFlightExchange>>,
	metrics: ExchangeMetrics,
	next_id: AtomicU64,
	last_sweep: AtomicI64,
}
impl CacheState {
	fn fresh(
		&self,
		key: &ExchangeKey,
		request: &CredentialRequest,
		now: OffsetDateTime,
		margin: Duration,
	) -> Option<CachedCredential> {
		let entries = self.entries.read();
		let entry = entries.get(key)?;

		if !request.accepts(&entry.credential)
			|| entry.credential.status_at(now, margin) != CredentialStatus::Fresh
		{
			return None;
		}

		entry.touch(now);

		Some(entry.credential.clone())
	}

	fn complete(&self, key: &ExchangeKey, id: u64, outcome: &Result<CachedCredential>) {
		let mut in_flight = self.in_flight.lock();

		match outcome {
			Ok(credential) => {
				let now = OffsetDateTime::now_utc();
				let entry = Arc::new(CacheEntry::new(credential.clone(), now));

				self.entries.write().insert(key.clone(), entry);
			},
			Err(_) => self.metrics.record_failure(),
		}

		if in_flight.get(key).is_some_and(|current| current.id == id) {
			in_flight.remove(key);
		}
	}
}

/// Process-wide cache of exchanged credentials.
///
/// Construct once at startup and share by `Arc`; fresh instances give tests isolated state.
/// Exchanges are spawned onto the ambient Tokio runtime.
pub struct ExchangeCache {
	exchanger: Arc<dyn CredentialExchanger>,
	policy: CachePolicy,
	state: Arc<CacheState>,
}
impl ExchangeCache {
	/// Creates an empty cache that exchanges through `exchanger`.
	pub fn new(exchanger: Arc<dyn CredentialExchanger>, policy: CachePolicy) -> Self {
		Self { exchanger, policy, state: Arc::new(CacheState::default()) }
	}

	/// Returns the policy backing this cache.
	pub fn policy(&self) -> &CachePolicy {
		&self.policy
	}

	/// Returns the cache counters.
	pub fn metrics(&self) -> &ExchangeMetrics {
		&self.state.metrics
	}

	/// Number of resolved entries currently held.
	pub fn len(&self) -> usize {
		self.state.entries.read().len()
	}

	/// Returns `true` when no resolved entries are held.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns the placeholder for `key` when an exchange is in progress.
	pub fn in_flight(&self, key: &ExchangeKey) -> Option<InFlightExchange> {
		self.state.in_flight.lock().get(key).cloned()
	}

	/// Returns a credential for the request, exchanging at most once per key concurrently.
	pub async fn get_or_exchange(
		&self,
		request: CredentialRequest<'_>,
	) -> Result<CachedCredential> {
		let key = ExchangeKey::new(request.identity, request.scope);
		let now = OffsetDateTime::now_utc();
		let margin = self.policy.staleness_margin;

		if let Some(credential) = self.state.fresh(&key, &request, now, margin) {
			self.state.metrics.record_hit();

			#[cfg(feature = "tracing")]
			tracing::debug!(scope = %request.scope.fingerprint(), "exchange cache hit");

			return Ok(credential);
		}

		self.sweep_if_due(now);

		let (placeholder, initiated) = {
			let mut in_flight = self.state.in_flight.lock();

			match in_flight.get(&key).cloned() {
				Some(existing) => (existing, false),
				None => {
					if let Some(credential) = self.state.fresh(&key, &request, now, margin) {
						self.state.metrics.record_hit();

						return Ok(credential);
					}

					let placeholder = self.start_exchange(&key, &request);

					in_flight.insert(key.clone(), placeholder.clone());

					(placeholder, true)
				},
			}
		};

		if initiated {
			self.state.metrics.record_exchange();
		} else {
			self.state.metrics.record_coalesced();

			#[cfg(feature = "tracing")]
			tracing::debug!(scope = %request.scope.fingerprint(), "joined in-flight exchange");
		}

		placeholder.wait().await
	}

	/// Removes entries idle past the window and entries already expired. Returns the count.
	pub fn evict_idle(&self, now: OffsetDateTime) -> usize {
		let idle = self.policy.idle_eviction;
		let mut entries = self.state.entries.write();
		let before = entries.len();

		entries.retain(|_, entry| {
			!entry.credential.is_expired_at(now) && entry.idle_for(now) < idle
		});

		let evicted = before - entries.len();

		drop(entries);
		self.state.metrics.record_evictions(evicted);
		self.state.last_sweep.store(now.unix_timestamp(), Ordering::Relaxed);

		evicted
	}

	/// Drops the resolved entry for `key`. In-flight exchanges are untouched.
	pub fn invalidate(&self, key: &ExchangeKey) -> bool {
		self.state.entries.write().remove(key).is_some()
	}

	fn sweep_if_due(&self, now: OffsetDateTime) {
		let last = self.state.last_sweep.load(Ordering::Relaxed);

		if now.unix_timestamp() - last >= self.policy.sweep_interval.whole_seconds() {
			self.evict_idle(now);
		}
	}

	fn start_exchange(&self, key: &ExchangeKey, request: &CredentialRequest) -> InFlightExchange {
		let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
		let state = Arc::clone(&self.state);
		let exchanger = Arc::clone(&self.exchanger);
		let assertion = request.identity.token.clone();
		let scope = request.scope.clone();
		let task_key = key.clone();
		let task = tokio::spawn(async move {
			let outcome = exchanger.exchange(&assertion, &scope).await.and_then(|credential| {
				if credential.scope == scope {
					Ok(credential)
				} else {
					Err(ExchangeError::ResponseParse {
						message: "exchanged credential scope differs from the requested scope"
							.into(),
						status: None,
					}
					.into())
				}
			});

			state.complete(&task_key, id, &outcome);

			outcome
		});
		let outcome = async move {
			task.await.unwrap_or_else(|err| {
				Err(ExchangeError::Transient {
					message: format!("exchange task ended unexpectedly: {err}"),
					status: None,
					retry_after: None,
				}
				.into())
			})
		}
		.boxed()
		.shared();

		InFlightExchange { id, outcome }
	}
}
impl Debug for ExchangeCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ExchangeCache")
			.field("policy", &self.policy)
			.field("entries", &self.len())
			.field("metrics", &self.state.metrics)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::AtomicUsize;
	// self
	use super::*;
	use crate::auth::{TokenSecret, UserProfile};

	struct CountingExchanger {
		calls: AtomicUsize,
		ttl: Duration,
	}
	impl CredentialExchanger for CountingExchanger {
		fn exchange<'a>(
			&'a self,
			_assertion: &'a TokenSecret,
			scope: &'a ScopeSet,
		) -> BoxFuture<'a, Result<CachedCredential>> {
			Box::pin(async move {
				let n = self.calls.fetch_add(1, Ordering::SeqCst);

				tokio::time::sleep(std::time::Duration::from_millis(20)).await;

				CachedCredential::builder(scope.clone())
					.credential(format!("obo-{n}"))
					.expires_in(self.ttl)
					.build()
					.map_err(|err| {
						ExchangeError::ResponseParse { message: err.to_string(), status: None }
							.into()
					})
			})
		}
	}

	fn identity(subject: &str) -> IdentityContext {
		IdentityContext {
			subject: SubjectId::new(subject).expect("Subject fixture should be valid."),
			tenant: TenantId::new("tenant-1").expect("Tenant fixture should be valid."),
			token: TokenSecret::new("inbound"),
			issuer: "https://issuer.example.com".into(),
			audience: "api://broker".into(),
			expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
			scopes: ScopeSet::from_claim("user_impersonation"),
			profile: UserProfile::default(),
		}
	}

	fn scope() -> ScopeSet {
		ScopeSet::new(["https://search.azure.com/.default"])
			.expect("Scope fixture should be valid.")
	}

	fn cache(ttl: Duration) -> (Arc<CountingExchanger>, ExchangeCache) {
		cache_with(ttl, CachePolicy::default())
	}

	fn cache_with(ttl: Duration, policy: CachePolicy) -> (Arc<CountingExchanger>, ExchangeCache) {
		let exchanger = Arc::new(CountingExchanger { calls: AtomicUsize::new(0), ttl });
		let cache = ExchangeCache::new(exchanger.clone(), policy);

		(exchanger, cache)
	}

	#[tokio::test]
	async fn keys_ignore_scope_order() {
		let user = identity("U1");
		let lhs = ScopeSet::new(["b", "a"]).expect("Scope fixture should be valid.");
		let rhs = ScopeSet::new(["a", "b"]).expect("Scope fixture should be valid.");

		assert_eq!(ExchangeKey::new(&user, &lhs), ExchangeKey::new(&user, &rhs));
		assert_ne!(ExchangeKey::new(&user, &lhs), ExchangeKey::new(&identity("U2"), &lhs));
	}

	#[tokio::test]
	async fn fresh_entries_are_reused() {
		let (exchanger, cache) = cache(Duration::hours(1));
		let user = identity("U1");
		let scope = scope();
		let first = cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("First lookup should exchange.");
		let second = cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("Second lookup should hit the cache.");

		assert_eq!(first.credential, second.credential);
		assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.metrics().hits(), 1);
	}

	#[tokio::test]
	async fn stale_entries_trigger_exactly_one_exchange() {
		// 30s lifetime sits inside the default 60s staleness margin.
		let (exchanger, cache) = cache(Duration::seconds(30));
		let user = identity("U1");
		let scope = scope();

		for _ in 0..2 {
			cache
				.get_or_exchange(CredentialRequest::new(&user, &scope))
				.await
				.expect("Lookup should exchange.");
		}

		assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn replacing_a_rejected_credential_exchanges_once() {
		let (exchanger, cache) = cache(Duration::hours(1));
		let user = identity("U1");
		let scope = scope();
		let rejected = cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("First lookup should exchange.");
		let replacement = cache
			.get_or_exchange(CredentialRequest::new(&user, &scope).replacing(&rejected))
			.await
			.expect("Forced lookup should exchange.");
		let again = cache
			.get_or_exchange(CredentialRequest::new(&user, &scope).replacing(&rejected))
			.await
			.expect("A second forced lookup should reuse the replacement.");

		assert_ne!(rejected.credential, replacement.credential);
		assert_eq!(replacement.credential, again.credential);
		assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn idle_and_expired_entries_are_evicted() {
		let (_, cache) = cache(Duration::hours(1));
		let user = identity("U1");
		let scope = scope();

		cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("Lookup should exchange.");

		assert_eq!(cache.evict_idle(OffsetDateTime::now_utc()), 0);
		assert_eq!(cache.evict_idle(OffsetDateTime::now_utc() + Duration::minutes(16)), 1);
		assert!(cache.is_empty());
		assert_eq!(cache.metrics().evictions(), 1);
	}

	#[tokio::test]
	async fn slow_path_sweeps_idle_entries_when_due() {
		let policy = CachePolicy {
			idle_eviction: Duration::ZERO,
			sweep_interval: Duration::ZERO,
			..CachePolicy::default()
		};
		let (_, cache) = cache_with(Duration::hours(1), policy);
		let scope = scope();

		cache
			.get_or_exchange(CredentialRequest::new(&identity("U1"), &scope))
			.await
			.expect("U1 lookup should exchange.");
		cache
			.get_or_exchange(CredentialRequest::new(&identity("U2"), &scope))
			.await
			.expect("U2 lookup should exchange.");

		assert_eq!(cache.len(), 1);
		assert_eq!(cache.metrics().evictions(), 1);
		assert!(cache.in_flight(&ExchangeKey::new(&identity("U2"), &scope)).is_none());
	}

	#[tokio::test]
	async fn sweeps_are_spaced_by_the_sweep_interval() {
		let policy = CachePolicy {
			idle_eviction: Duration::ZERO,
			sweep_interval: Duration::hours(1),
			..CachePolicy::default()
		};
		let (_, cache) = cache_with(Duration::hours(1), policy);
		let scope = scope();

		for subject in ["U1", "U2"] {
			cache
				.get_or_exchange(CredentialRequest::new(&identity(subject), &scope))
				.await
				.expect("Lookup should exchange.");
		}

		assert_eq!(cache.len(), 2);
		assert_eq!(cache.metrics().evictions(), 0);
	}

	#[tokio::test]
	async fn invalidate_drops_resolved_entries() {
		let (exchanger, cache) = cache(Duration::hours(1));
		let user = identity("U1");
		let scope = scope();

		cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("Lookup should exchange.");

		assert!(cache.invalidate(&ExchangeKey::new(&user, &scope)));

		cache
			.get_or_exchange(CredentialRequest::new(&user, &scope))
			.await
			.expect("Lookup after invalidation should exchange again.");

		assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
	}
}
