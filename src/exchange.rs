//! On-behalf-of exchange against the identity provider's token endpoint.
//!
//! [`OboExchangeClient`] presents a verified inbound token as a `jwt-bearer` assertion together
//! with the target scope and returns the outbound credential plus its expiry. Failures are
//! classified by the configured [`ProviderStrategy`]: interaction requirements surface as
//! [`Error::ConsentRequired`] and are never retried, transient failures (network, throttling,
//! 5xx) are retried under a [`RetryPolicy`], and everything else surfaces immediately.

pub mod retry;

pub use retry::RetryPolicy;

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::future::BoxFuture;
use oauth2::{
	AsyncHttpClient, HttpRequest, HttpResponse,
	http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use url::form_urlencoded;
// self
use crate::{
	_prelude::*,
	auth::{CachedCredential, ScopeSet, TokenSecret},
	error::{ConfigError, ExchangeError, TransportError},
	http::{self, HttpTransport, ResponseMetadata, ResponseMetadataSlot},
	obs::{self, Stage},
	provider::{
		ClientAuthMethod, IdentityProviderDescriptor, ProviderErrorContext, ProviderErrorKind,
		ProviderStrategy,
	},
	transport::TransportErrorMapper,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, transport::ReqwestTransportErrorMapper};

/// `grant_type` for the on-behalf-of exchange.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Performs the on-behalf-of exchange.
///
/// Object-safe so the exchange cache can hold any implementation behind an `Arc`.
pub trait CredentialExchanger: Send + Sync {
	/// Trades `assertion` for an outbound credential scoped to `scope`.
	fn exchange<'a>(
		&'a self,
		assertion: &'a TokenSecret,
		scope: &'a ScopeSet,
	) -> BoxFuture<'a, Result<CachedCredential>>;
}

/// Exchange client specialized for the crate's default reqwest transport stack.
#[cfg(feature = "reqwest")]
pub type ReqwestExchangeClient = OboExchangeClient<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Confidential client that calls the token endpoint with the `jwt-bearer` grant.
pub struct OboExchangeClient<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	descriptor: IdentityProviderDescriptor,
	strategy: Arc<dyn ProviderStrategy>,
	client_id: String,
	client_secret: TokenSecret,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	retry: RetryPolicy,
	timeout: Duration,
}
impl<C, M> OboExchangeClient<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	const DEFAULT_TIMEOUT: Duration = Duration::seconds(10);

	/// Creates a client for `descriptor` using the caller-provided transport + mapper pair.
	pub fn with_http_client(
		descriptor: IdentityProviderDescriptor,
		strategy: Arc<dyn ProviderStrategy>,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			descriptor,
			strategy,
			client_id: client_id.into(),
			client_secret: TokenSecret::new(client_secret),
			http_client: http_client.into(),
			error_mapper: mapper.into(),
			retry: RetryPolicy::default(),
			timeout: Self::DEFAULT_TIMEOUT,
		}
	}

	/// Overrides the retry policy for transient failures.
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Overrides the per-attempt timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Returns the descriptor this client exchanges against.
	pub fn descriptor(&self) -> &IdentityProviderDescriptor {
		&self.descriptor
	}

	/// Exchanges `assertion` for a credential scoped to `scope`, retrying transient failures.
	pub async fn exchange(
		&self,
		assertion: &TokenSecret,
		scope: &ScopeSet,
	) -> Result<CachedCredential> {
		obs::observe(
			Stage::Exchange,
			"exchange",
			self.retry.run("obo_exchange", move || self.exchange_once(assertion, scope)),
		)
		.await
	}

	async fn exchange_once(
		&self,
		assertion: &TokenSecret,
		scope: &ScopeSet,
	) -> Result<CachedCredential> {
		let slot = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(slot.clone());
		let request = self.build_request(assertion, scope)?;
		let response = tokio::time::timeout(self.timeout.unsigned_abs(), handle.call(request))
			.await
			.map_err(|_| ExchangeError::from(TransportError::Timeout { timeout: self.timeout }))?
			.map_err(|err| {
				let err = self.error_mapper.map_transport_error(slot.take().as_ref(), err);

				ExchangeError::from(err)
			})?;
		let meta = slot.take();

		if response.status().is_success() {
			return map_token_response(scope, &response);
		}

		Err(self.map_error_response(&response, meta.as_ref()))
	}

	fn build_request(&self, assertion: &TokenSecret, scope: &ScopeSet) -> Result<HttpRequest> {
		let mut form = BTreeMap::from([
			("grant_type".to_owned(), JWT_BEARER_GRANT.to_owned()),
			("requested_token_use".to_owned(), "on_behalf_of".to_owned()),
			("assertion".to_owned(), assertion.expose().to_owned()),
			("scope".to_owned(), scope.normalized()),
			("client_id".to_owned(), self.client_id.clone()),
		]);
		let mut builder = oauth2::http::Request::builder()
			.method("POST")
			.uri(self.descriptor.endpoints.token.as_str())
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.header(ACCEPT, "application/json");

		match self.descriptor.client_auth_method {
			ClientAuthMethod::ClientSecretPost => {
				form.insert("client_secret".into(), self.client_secret.expose().to_owned());
			},
			ClientAuthMethod::ClientSecretBasic => {
				let encode = |value: &str| {
					form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>()
				};
				let pair =
					format!("{}:{}", encode(&self.client_id), encode(self.client_secret.expose()));

				builder = builder.header(AUTHORIZATION, format!("Basic {}", STANDARD.encode(pair)));
			},
		}

		self.strategy.augment_exchange_request(&mut form);

		let body = form_urlencoded::Serializer::new(String::new()).extend_pairs(&form).finish();

		builder.body(body.into_bytes()).map_err(|err| ConfigError::from(err).into())
	}

	fn map_error_response(
		&self,
		response: &HttpResponse,
		meta: Option<&ResponseMetadata>,
	) -> Error {
		let status = response.status().as_u16();
		let retry_after = meta.and_then(|value| value.retry_after);
		let mut ctx = ProviderErrorContext::default().with_http_status(status);
		let body = http::parse_json::<ErrorBody>(response.body()).ok();

		match &body {
			Some(body) => {
				if let Some(error) = &body.error {
					ctx = ctx.with_oauth_error(error.clone());
				}
				if let Some(description) = &body.error_description {
					ctx = ctx.with_error_description(description.clone());
				}
				if let Some(suberror) = &body.suberror {
					ctx = ctx.with_suberror(suberror.clone());
				}
				if let Some(claims) = &body.claims {
					ctx = ctx.with_claims(claims.clone());
				}

				ctx = ctx.with_error_codes(body.error_codes.iter().copied());
			},
			None => {
				ctx = ctx.with_body_preview(String::from_utf8_lossy(response.body()).into_owned());
			},
		}

		let message =
			body.as_ref().map(ErrorBody::summary).unwrap_or_else(|| format!("HTTP {status}"));

		match self.strategy.classify_exchange_error(&ctx) {
			ProviderErrorKind::ConsentRequired =>
				Error::ConsentRequired { reason: message, claims: ctx.claims },
			ProviderErrorKind::InvalidGrant =>
				ExchangeError::InvalidGrant { reason: message }.into(),
			ProviderErrorKind::InvalidClient =>
				ExchangeError::InvalidClient { reason: message }.into(),
			ProviderErrorKind::Transient =>
				ExchangeError::Transient { message, status: Some(status), retry_after }.into(),
		}
	}
}
#[cfg(feature = "reqwest")]
impl OboExchangeClient<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a client that provisions its own reqwest-backed transport.
	pub fn new(
		descriptor: IdentityProviderDescriptor,
		strategy: Arc<dyn ProviderStrategy>,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
	) -> Self {
		Self::with_http_client(
			descriptor,
			strategy,
			client_id,
			client_secret,
			ReqwestHttpClient::default(),
			Arc::new(ReqwestTransportErrorMapper),
		)
	}
}
impl<C, M> CredentialExchanger for OboExchangeClient<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn exchange<'a>(
		&'a self,
		assertion: &'a TokenSecret,
		scope: &'a ScopeSet,
	) -> BoxFuture<'a, Result<CachedCredential>> {
		Box::pin(OboExchangeClient::exchange(self, assertion, scope))
	}
}
impl<C, M> Debug for OboExchangeClient<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OboExchangeClient")
			.field("descriptor", &self.descriptor)
			.field("client_id", &self.client_id)
			.field("retry", &self.retry)
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

#[derive(Deserialize)]
struct TokenBody {
	access_token: String,
	expires_in: Option<ExpiresIn>,
}

/// Entra ID has historically returned `expires_in` as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
	Seconds(i64),
	Text(String),
}

#[derive(Deserialize)]
struct ErrorBody {
	error: Option<String>,
	error_description: Option<String>,
	#[serde(default)]
	error_codes: Vec<u32>,
	suberror: Option<String>,
	claims: Option<String>,
}
impl ErrorBody {
	/// `error` code plus the first line of `error_description` (trace details follow it).
	fn summary(&self) -> String {
		let description = self.error_description.as_deref().and_then(|value| value.lines().next());

		match (self.error.as_deref(), description) {
			(Some(error), Some(description)) => format!("{error}: {description}"),
			(Some(error), None) => error.to_owned(),
			(None, Some(description)) => description.to_owned(),
			(None, None) => "unknown error".into(),
		}
	}
}

fn map_token_response(scope: &ScopeSet, response: &HttpResponse) -> Result<CachedCredential> {
	let status = Some(response.status().as_u16());
	let parse_error = |message: String| ExchangeError::ResponseParse { message, status };
	let body = http::parse_json::<TokenBody>(response.body()).map_err(parse_error)?;
	let expires_in = match body.expires_in {
		Some(ExpiresIn::Seconds(secs)) => secs,
		Some(ExpiresIn::Text(raw)) => raw
			.trim()
			.parse::<i64>()
			.map_err(|_| parse_error(format!("expires_in `{raw}` is not an integer")))?,
		None => return Err(parse_error("expires_in is missing".into()).into()),
	};

	if expires_in <= 0 {
		return Err(parse_error(format!("expires_in must be positive, got {expires_in}")).into());
	}
	if expires_in > i64::from(u32::MAX) {
		return Err(parse_error(format!("expires_in {expires_in} exceeds the supported range"))
			.into());
	}

	CachedCredential::builder(scope.clone())
		.credential(body.access_token)
		.issued_at(OffsetDateTime::now_utc())
		.expires_in(Duration::seconds(expires_in))
		.build()
		.map_err(|err| parse_error(err.to_string()).into())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::ErrorKind;

	fn response(status: u16, body: &str) -> HttpResponse {
		let mut response = HttpResponse::new(body.as_bytes().to_vec());

		*response.status_mut() =
			oauth2::http::StatusCode::from_u16(status).expect("Status fixture should be valid.");

		response
	}

	fn scope() -> ScopeSet {
		ScopeSet::new(["https://search.azure.com/.default"])
			.expect("Scope fixture should be valid for exchange tests.")
	}

	#[test]
	fn token_response_accepts_numeric_and_string_expiry() {
		let numeric = map_token_response(
			&scope(),
			&response(200, r#"{"access_token":"obo","token_type":"Bearer","expires_in":3599}"#),
		)
		.expect("Numeric expires_in should parse.");
		let text = map_token_response(
			&scope(),
			&response(200, r#"{"access_token":"obo","expires_in":"3599"}"#),
		)
		.expect("String expires_in should parse.");

		assert_eq!(numeric.expires_at - numeric.issued_at, Duration::seconds(3599));
		assert_eq!(text.expires_at - text.issued_at, Duration::seconds(3599));
		assert_eq!(numeric.scope, scope());
	}

	#[test]
	fn token_response_rejects_missing_or_non_positive_expiry() {
		let missing = map_token_response(&scope(), &response(200, r#"{"access_token":"obo"}"#));
		let zero = map_token_response(
			&scope(),
			&response(200, r#"{"access_token":"obo","expires_in":0}"#),
		);

		for outcome in [missing, zero] {
			let err = outcome.expect_err("Unusable expiry should fail the exchange.");

			assert_eq!(err.kind(), ErrorKind::Exchange);
			assert!(matches!(
				err,
				Error::Exchange(ExchangeError::ResponseParse { status: Some(200), .. })
			));
		}
	}

	#[test]
	fn error_summary_keeps_code_and_first_description_line() {
		let body: ErrorBody = serde_json::from_value(serde_json::json!({
			"error": "invalid_grant",
			"error_description": "AADSTS65001: consent missing.\r\nTrace ID: 1",
			"error_codes": [65001],
		}))
		.expect("Error body fixture should deserialize.");

		assert_eq!(body.summary(), "invalid_grant: AADSTS65001: consent missing.");
		assert_eq!(body.error_codes, vec![65001]);
	}

	#[test]
	fn malformed_token_response_is_a_parse_error() {
		let err = map_token_response(&scope(), &response(200, r#"{"token":"obo"}"#))
			.expect_err("Missing access_token should fail.");

		assert!(matches!(err, Error::Exchange(ExchangeError::ResponseParse { .. })));
	}
}
