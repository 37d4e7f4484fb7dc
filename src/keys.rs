//! Process-wide cache of the trusted issuer's signing keys.
//!
//! [`KeySetCache`] owns the current `kid -> key` map plus the instant it was last refreshed.
//! Reads take a shared lock over an immutable snapshot; a refresh builds a new snapshot and
//! swaps it in. Concurrent refresh requests share one fetch: callers that queue behind an
//! in-progress refresh observe its outcome instead of fetching again. A failed refresh keeps
//! the previous snapshot so verification continues against stale keys.

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
// crates.io
use futures::future::BoxFuture;
use jsonwebtoken::{
	DecodingKey,
	jwk::{Jwk, JwkSet, PublicKeyUse},
};
use oauth2::{AsyncHttpClient, http::header::ACCEPT};
// self
use crate::{
	_prelude::*,
	error::{KeyFetchError, TransportError},
	http::{self, HttpTransport, ResponseMetadataSlot},
	obs::{self, Stage},
	transport::TransportErrorMapper,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, transport::ReqwestTransportErrorMapper};

/// Supplies the issuer's current key set.
///
/// The seam lets tests and alternate deployments feed keys without an HTTP round-trip.
pub trait KeySource: Send + Sync {
	/// Fetches the current key set.
	fn fetch(&self) -> BoxFuture<'_, Result<JwkSet, KeyFetchError>>;
}

/// Key source specialized for the crate's default reqwest transport stack.
#[cfg(feature = "reqwest")]
pub type ReqwestKeySource = HttpKeySource<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Fetches a JSON Web Key Set over HTTP through an [`HttpTransport`].
pub struct HttpKeySource<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	jwks_uri: Url,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> HttpKeySource<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a source for `jwks_uri` using the provided transport and error mapper.
	pub fn new(
		jwks_uri: Url,
		http_client: impl Into<Arc<C>>,
		error_mapper: impl Into<Arc<M>>,
	) -> Self {
		Self { jwks_uri, http_client: http_client.into(), error_mapper: error_mapper.into() }
	}

	async fn fetch_set(&self) -> Result<JwkSet, KeyFetchError> {
		let slot = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(slot.clone());
		let request = oauth2::http::Request::builder()
			.method("GET")
			.uri(self.jwks_uri.as_str())
			.header(ACCEPT, "application/json")
			.body(Vec::new())
			.map_err(|err| TransportError::Request { message: err.to_string() })?;
		let response = handle
			.call(request)
			.await
			.map_err(|err| self.error_mapper.map_transport_error(slot.take().as_ref(), err))?;
		let status = response.status();

		if !status.is_success() {
			return Err(KeyFetchError::Status { status: status.as_u16() });
		}

		http::parse_json::<JwkSet>(response.body())
			.map_err(|message| KeyFetchError::Parse { message })
	}
}
impl<C, M> KeySource for HttpKeySource<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fetch(&self) -> BoxFuture<'_, Result<JwkSet, KeyFetchError>> {
		Box::pin(self.fetch_set())
	}
}

/// A key set supplied up front; useful for tests and pinned-key deployments.
#[derive(Clone, Debug)]
pub struct StaticKeySource(pub JwkSet);
impl KeySource for StaticKeySource {
	fn fetch(&self) -> BoxFuture<'_, Result<JwkSet, KeyFetchError>> {
		let set = self.0.clone();

		Box::pin(async move { Ok(set) })
	}
}

/// Timing policy for [`KeySetCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeySetPolicy {
	/// Scheduled refresh interval.
	pub refresh_interval: Duration,
	/// Upper bound on a single key-set fetch.
	pub fetch_timeout: Duration,
	/// How long a `kid` that was still absent after a forced refresh is rejected without
	/// fetching again.
	pub miss_refresh_cooldown: Duration,
}
impl Default for KeySetPolicy {
	fn default() -> Self {
		Self {
			refresh_interval: Duration::hours(1),
			fetch_timeout: Duration::seconds(10),
			miss_refresh_cooldown: Duration::seconds(5),
		}
	}
}

#[derive(Default)]
struct KeySnapshot {
	keys: HashMap<String, Arc<DecodingKey>>,
	refreshed_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct RefreshLedger {
	last_outcome: Option<Result<(), KeyFetchError>>,
	absent_kids: HashMap<String, OffsetDateTime>,
}

/// Current signing keys for the configured issuer.
pub struct KeySetCache {
	source: Arc<dyn KeySource>,
	policy: KeySetPolicy,
	snapshot: RwLock<Arc<KeySnapshot>>,
	refresh_guard: AsyncMutex<RefreshLedger>,
	generation: AtomicU64,
	background_scheduled: AtomicBool,
}
impl KeySetCache {
	/// Creates an empty cache backed by `source`. Call [`prime`](Self::prime) before serving.
	pub fn new(source: Arc<dyn KeySource>, policy: KeySetPolicy) -> Self {
		Self {
			source,
			policy,
			snapshot: RwLock::new(Arc::new(KeySnapshot::default())),
			refresh_guard: AsyncMutex::new(RefreshLedger::default()),
			generation: AtomicU64::new(0),
			background_scheduled: AtomicBool::new(false),
		}
	}

	/// Returns the policy backing this cache.
	pub fn policy(&self) -> &KeySetPolicy {
		&self.policy
	}

	/// Returns the decoding key registered under `kid`, if any.
	pub fn get_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
		self.snapshot.read().keys.get(kid).cloned()
	}

	/// Number of usable keys currently held.
	pub fn len(&self) -> usize {
		self.snapshot.read().keys.len()
	}

	/// Returns `true` when no keys are held.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Instant of the last successful refresh.
	pub fn refreshed_at(&self) -> Option<OffsetDateTime> {
		self.snapshot.read().refreshed_at
	}

	/// Performs the startup fetch. An unreachable issuer is fatal to startup.
	pub async fn prime(&self) -> Result<()> {
		self.refresh().await.map_err(Error::from)
	}

	/// Counter bumped by every completed refresh, successful or not.
	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	/// Fetches the issuer's current key set and installs it.
	///
	/// A refresh already in progress is shared: callers that arrive while one runs wait for it
	/// and receive its outcome. On failure the previous keys stay in place and the error is
	/// returned only to the callers of this refresh.
	pub async fn refresh(&self) -> Result<(), KeyFetchError> {
		let observed = self.generation();
		let mut ledger = self.refresh_guard.lock().await;

		if self.generation() != observed {
			return ledger.last_outcome.clone().unwrap_or(Ok(()));
		}

		self.run_refresh(&mut ledger).await
	}

	/// Refreshes only when the scheduled interval has elapsed.
	pub async fn refresh_if_due(&self) -> Result<(), KeyFetchError> {
		if !self.is_due(OffsetDateTime::now_utc()) {
			return Ok(());
		}

		self.refresh().await
	}

	/// Refreshes after `kid` was missing from the snapshot at generation `observed`.
	///
	/// The fetch is skipped when a refresh completed after the miss was observed, or when the
	/// same `kid` was still absent after a forced refresh within the miss cooldown.
	pub(crate) async fn refresh_for_miss(
		&self,
		kid: &str,
		observed: u64,
	) -> Result<(), KeyFetchError> {
		let mut ledger = self.refresh_guard.lock().await;
		let now = OffsetDateTime::now_utc();
		let cooldown = self.policy.miss_refresh_cooldown;

		ledger.absent_kids.retain(|_, at| now - *at < cooldown);

		if self.generation() != observed || ledger.absent_kids.contains_key(kid) {
			return ledger.last_outcome.clone().unwrap_or(Ok(()));
		}

		let outcome = self.run_refresh(&mut ledger).await;

		if outcome.is_ok() && self.get_key(kid).is_none() {
			ledger.absent_kids.insert(kid.to_owned(), now);
		}

		outcome
	}

	/// Spawns [`refresh_if_due`](Self::refresh_if_due) on the Tokio runtime without awaiting it.
	///
	/// At most one background refresh is scheduled at a time.
	pub fn spawn_refresh_if_due(self: &Arc<Self>) {
		if !self.is_due(OffsetDateTime::now_utc())
			|| self.background_scheduled.swap(true, Ordering::AcqRel)
		{
			return;
		}

		let cache = Arc::clone(self);

		tokio::spawn(async move {
			let _ = cache.refresh_if_due().await;

			cache.background_scheduled.store(false, Ordering::Release);
		});
	}

	async fn run_refresh(&self, ledger: &mut RefreshLedger) -> Result<(), KeyFetchError> {
		let outcome = obs::observe(Stage::KeyRefresh, "refresh", self.fetch_and_install()).await;

		#[cfg(feature = "tracing")]
		if let Err(err) = &outcome {
			tracing::warn!(
				error = %err,
				retained_keys = self.len(),
				"key-set refresh failed, serving previous keys"
			);
		}

		ledger.last_outcome = Some(outcome.clone());
		self.generation.fetch_add(1, Ordering::AcqRel);

		outcome
	}

	fn is_due(&self, now: OffsetDateTime) -> bool {
		self.refreshed_at().is_none_or(|at| now - at >= self.policy.refresh_interval)
	}

	async fn fetch_and_install(&self) -> Result<(), KeyFetchError> {
		let timeout = self.policy.fetch_timeout;
		let set = tokio::time::timeout(timeout.unsigned_abs(), self.source.fetch())
			.await
			.map_err(|_| TransportError::Timeout { timeout })??;
		let keys = decode_keys(&set.keys);

		if keys.is_empty() {
			return Err(KeyFetchError::NoUsableKeys);
		}

		*self.snapshot.write() =
			Arc::new(KeySnapshot { keys, refreshed_at: Some(OffsetDateTime::now_utc()) });

		Ok(())
	}
}
impl Debug for KeySetCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let snapshot = self.snapshot.read();

		f.debug_struct("KeySetCache")
			.field("policy", &self.policy)
			.field("kids", &snapshot.keys.keys().collect::<Vec<_>>())
			.field("refreshed_at", &snapshot.refreshed_at)
			.finish()
	}
}

fn decode_keys(jwks: &[Jwk]) -> HashMap<String, Arc<DecodingKey>> {
	jwks.iter()
		.filter(|jwk| !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)))
		.filter_map(|jwk| {
			let kid = jwk.common.key_id.clone()?;
			let key = DecodingKey::from_jwk(jwk).ok()?;

			Some((kid, Arc::new(key)))
		})
		.collect()
}
