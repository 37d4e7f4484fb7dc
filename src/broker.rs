//! Wiring for a complete broker: verifier, key-set cache, exchange cache, and dispatcher.

// self
use crate::{
	_prelude::*,
	tools::{ToolDispatcher, ToolError, ToolRequest, ToolResult},
	verify::IdentityVerifier,
};
#[cfg(feature = "reqwest")]
use crate::{
	backend::ReqwestSearchBackend,
	cache::ExchangeCache,
	config::BrokerConfig,
	error::ConfigError,
	exchange::ReqwestExchangeClient,
	http::ReqwestHttpClient,
	keys::{KeySetCache, ReqwestKeySource},
	provider::AzureAdStrategy,
	transport::ReqwestTransportErrorMapper,
};

/// Verifies each inbound call and dispatches it to the tool surface.
///
/// Build once at startup and share by reference; the key-set and exchange caches inside are the
/// only process-wide mutable state.
#[derive(Clone, Debug)]
pub struct SearchBroker {
	verifier: IdentityVerifier,
	dispatcher: ToolDispatcher,
}
impl SearchBroker {
	/// Assembles a broker from already-built components.
	pub fn from_parts(verifier: IdentityVerifier, dispatcher: ToolDispatcher) -> Self {
		Self { verifier, dispatcher }
	}

	/// Builds the reqwest-backed broker described by `config` and primes its signing keys.
	///
	/// An unreachable issuer or an invalid descriptor aborts startup.
	#[cfg(feature = "reqwest")]
	pub async fn bootstrap(config: &BrokerConfig) -> Result<Self> {
		let http = Arc::new(ReqwestHttpClient::with_timeout(config.http_timeout)?);
		let mapper = Arc::new(ReqwestTransportErrorMapper);
		let descriptor = config.descriptor().map_err(ConfigError::from)?;
		let source = ReqwestKeySource::new(
			descriptor.endpoints.jwks.clone(),
			Arc::clone(&http),
			Arc::clone(&mapper),
		);
		let keys = Arc::new(KeySetCache::new(Arc::new(source), config.keys));

		keys.prime().await?;

		let exchanger = ReqwestExchangeClient::with_http_client(
			descriptor,
			Arc::new(AzureAdStrategy),
			config.client_id.clone(),
			config.client_secret.expose(),
			Arc::clone(&http),
			Arc::clone(&mapper),
		)
		.with_retry_policy(config.retry)
		.with_timeout(config.http_timeout);
		let cache = Arc::new(ExchangeCache::new(Arc::new(exchanger), config.cache));
		let backend = ReqwestSearchBackend::with_http_client(config.search.clone(), http, mapper);
		let dispatcher =
			ToolDispatcher::new(cache, Arc::new(backend), config.search_scope.clone())
				.with_retry_policy(config.retry);

		#[cfg(feature = "tracing")]
		tracing::info!(
			issuer = %config.issuer,
			signing_keys = keys.len(),
			index = %config.search.index,
			"broker ready"
		);

		Ok(Self::from_parts(IdentityVerifier::new(keys, config.verifier_settings()), dispatcher))
	}

	/// Returns the inbound verifier.
	pub fn verifier(&self) -> &IdentityVerifier {
		&self.verifier
	}

	/// Returns the tool dispatcher.
	pub fn dispatcher(&self) -> &ToolDispatcher {
		&self.dispatcher
	}

	/// Verifies `raw_token` and runs `request` on the caller's behalf.
	///
	/// Verification failures return before any exchange or backend traffic.
	pub async fn handle(&self, raw_token: &str, request: &ToolRequest) -> ToolResult {
		match self.verifier.verify(raw_token).await {
			Ok(identity) => self.dispatcher.call(Some(&identity), request).await,
			Err(err) => ToolResult::Error { error: ToolError::from(&err) },
		}
	}
}
