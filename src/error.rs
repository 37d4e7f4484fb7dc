//! Broker-level error types shared across verification, exchange, caching, and dispatch.
//!
//! Every error is `Clone` so the outcome of a single in-flight exchange can be handed to
//! each caller waiting on it. Messages never embed raw credential material.

// self
use crate::{
	_prelude::*,
	auth::{IdentifierError, ScopeValidationError},
	provider::DescriptorError,
};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Canonical broker error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// Inbound credential is missing, malformed, expired, or otherwise untrusted.
	#[error(transparent)]
	Authentication(#[from] AuthenticationError),
	/// The identity provider needs the user to interact (consent, MFA) before exchanging.
	#[error("User interaction is required before the exchange can succeed: {reason}.")]
	ConsentRequired {
		/// Provider-supplied reason string.
		reason: String,
		/// Claims challenge a client can replay in an interactive flow.
		claims: Option<String>,
	},
	/// On-behalf-of exchange failed.
	#[error(transparent)]
	Exchange(#[from] ExchangeError),
	/// Search backend failure unrelated to authorization.
	#[error(transparent)]
	Backend(#[from] BackendError),
	/// Document is absent or not visible to the caller; the two are indistinguishable.
	#[error("Document `{id}` was not found.")]
	NotFound {
		/// Identifier requested by the caller.
		id: String,
	},
	/// Tool arguments failed validation before any network call.
	#[error("Invalid tool arguments: {reason}.")]
	InvalidRequest {
		/// Human-readable validation failure.
		reason: String,
	},
	/// Signing keys could not be fetched from the issuer.
	#[error(transparent)]
	KeyFetch(#[from] KeyFetchError),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
}
impl Error {
	/// Returns the coarse error class surfaced to callers.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Authentication(_) => ErrorKind::Authentication,
			Self::ConsentRequired { .. } => ErrorKind::ConsentRequired,
			Self::Exchange(_) => ErrorKind::Exchange,
			Self::Backend(_) => ErrorKind::Backend,
			Self::NotFound { .. } => ErrorKind::NotFound,
			Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
			Self::KeyFetch(_) => ErrorKind::KeyFetch,
			Self::Config(_) => ErrorKind::Config,
		}
	}

	/// Returns `true` when retrying the same operation may succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Exchange(err) => err.is_retryable(),
			Self::Backend(err) => err.is_retryable(),
			Self::KeyFetch(err) => err.is_retryable(),
			_ => false,
		}
	}

	/// Upstream retry hint carried by retryable errors.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Exchange(err) => err.retry_after(),
			Self::Backend(err) => err.retry_after(),
			_ => None,
		}
	}
}

/// Stable error classes used for structured tool errors and metric labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// See [`Error::Authentication`].
	Authentication,
	/// See [`Error::ConsentRequired`].
	ConsentRequired,
	/// See [`Error::Exchange`].
	Exchange,
	/// See [`Error::Backend`].
	Backend,
	/// See [`Error::NotFound`].
	NotFound,
	/// See [`Error::InvalidRequest`].
	InvalidRequest,
	/// See [`Error::KeyFetch`].
	KeyFetch,
	/// See [`Error::Config`].
	Config,
}
impl ErrorKind {
	/// Returns a stable label suitable for payloads or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Authentication => "authentication",
			Self::ConsentRequired => "consent_required",
			Self::Exchange => "exchange",
			Self::Backend => "backend",
			Self::NotFound => "not_found",
			Self::InvalidRequest => "invalid_request",
			Self::KeyFetch => "key_fetch",
			Self::Config => "config",
		}
	}
}
impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Reasons an inbound credential is rejected. Never retried.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum AuthenticationError {
	/// No verified identity was attached to the call.
	#[error("No verified identity is attached to the call.")]
	MissingContext,
	/// Token is not a well-formed compact JWS.
	#[error("Bearer token is malformed: {reason}.")]
	Malformed {
		/// Parser failure summary.
		reason: String,
	},
	/// Token header carries no `kid`.
	#[error("Bearer token header is missing a key identifier.")]
	MissingKeyId,
	/// Token is signed with an algorithm the verifier does not accept.
	#[error("Bearer token uses an unsupported algorithm: {algorithm}.")]
	UnsupportedAlgorithm {
		/// Algorithm named by the token header.
		algorithm: String,
	},
	/// No signing key with the token's `kid` exists, even after a key-set refresh.
	#[error("No signing key matches key identifier `{kid}`.")]
	UnknownKey {
		/// Key identifier named by the token header.
		kid: String,
	},
	/// Signature does not verify against the issuer key.
	#[error("Bearer token signature is invalid.")]
	InvalidSignature,
	/// `exp` is in the past.
	#[error("Bearer token has expired.")]
	Expired,
	/// `nbf` is in the future.
	#[error("Bearer token is not valid yet.")]
	NotYetValid,
	/// `iss` differs from the configured issuer.
	#[error("Bearer token issuer does not match the configured issuer.")]
	IssuerMismatch,
	/// `aud` differs from the configured audience.
	#[error("Bearer token audience does not match the configured audience.")]
	AudienceMismatch,
	/// A claim required to build the identity is absent.
	#[error("Bearer token is missing the `{claim}` claim.")]
	MissingClaim {
		/// Claim name.
		claim: &'static str,
	},
	/// Token lacks a scope the broker requires.
	#[error("Bearer token lacks the required scopes: {missing}.")]
	InsufficientScope {
		/// Space-delimited list of missing scopes.
		missing: String,
	},
}
impl AuthenticationError {
	/// Short machine-readable reason label.
	pub const fn reason(&self) -> &'static str {
		match self {
			Self::MissingContext => "missing-context",
			Self::Malformed { .. } => "malformed",
			Self::MissingKeyId => "missing-key-id",
			Self::UnsupportedAlgorithm { .. } => "unsupported-algorithm",
			Self::UnknownKey { .. } => "unknown-key",
			Self::InvalidSignature => "invalid-signature",
			Self::Expired => "expired",
			Self::NotYetValid => "not-yet-valid",
			Self::IssuerMismatch => "issuer-mismatch",
			Self::AudienceMismatch => "audience-mismatch",
			Self::MissingClaim { .. } => "missing-claim",
			Self::InsufficientScope { .. } => "insufficient-scope",
		}
	}
}

/// Failures raised while exchanging a delegated credential.
#[derive(Clone, Debug, ThisError)]
pub enum ExchangeError {
	/// Temporary upstream failure; retried with backoff.
	#[error("Token endpoint returned a temporary failure: {message}.")]
	Transient {
		/// Provider- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Network-level failure while calling the token endpoint.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Token endpoint responded with a payload that could not be parsed.
	#[error("Token endpoint returned an unusable response: {message}.")]
	ResponseParse {
		/// Structured parsing failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Provider rejected the inbound assertion.
	#[error("Provider rejected the assertion: {reason}.")]
	InvalidGrant {
		/// Provider-supplied reason string.
		reason: String,
	},
	/// Provider rejected the broker's client credentials.
	#[error("Client authentication failed: {reason}.")]
	InvalidClient {
		/// Provider-supplied reason string.
		reason: String,
	},
	/// Backend rejected the exchanged credential even after a forced re-exchange.
	#[error("Backend rejected the exchanged credential.")]
	StaleCredential,
}
impl ExchangeError {
	/// Returns `true` for network, timeout, throttling, and 5xx classes.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Transient { .. } => true,
			Self::Transport(err) => err.is_retryable(),
			_ => false,
		}
	}

	/// Upstream retry hint, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Transient { retry_after, .. } => *retry_after,
			_ => None,
		}
	}
}

/// Search backend failures unrelated to authorization.
#[derive(Clone, Debug, ThisError)]
pub enum BackendError {
	/// Backend answered with an unexpected HTTP status.
	#[error("Search backend returned HTTP {status}: {message}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Backend-supplied message.
		message: String,
		/// Retry-After hint from the backend, if supplied.
		retry_after: Option<Duration>,
	},
	/// Network-level failure while calling the backend.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Backend responded with a payload that could not be parsed.
	#[error("Search backend returned malformed JSON: {message}.")]
	ResponseParse {
		/// Structured parsing failure.
		message: String,
	},
}
impl BackendError {
	/// Returns `true` for network, timeout, throttling, and 5xx classes.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Status { status, .. } => *status == 429 || *status >= 500,
			Self::Transport(err) => err.is_retryable(),
			Self::ResponseParse { .. } => false,
		}
	}

	/// Upstream retry hint, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Status { retry_after, .. } => *retry_after,
			_ => None,
		}
	}
}

/// Failures raised while fetching the issuer's signing keys.
#[derive(Clone, Debug, ThisError)]
pub enum KeyFetchError {
	/// Key-set endpoint answered with an unexpected HTTP status.
	#[error("Key-set endpoint returned HTTP {status}.")]
	Status {
		/// HTTP status code.
		status: u16,
	},
	/// Network-level failure while calling the key-set endpoint.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Key-set payload could not be parsed.
	#[error("Key-set endpoint returned an unreadable key set: {message}.")]
	Parse {
		/// Parsing failure summary.
		message: String,
	},
	/// Key set contained no key usable for signature verification.
	#[error("Key set contains no usable signing keys.")]
	NoUsableKeys,
}
impl KeyFetchError {
	/// Returns `true` for network, timeout, throttling, and 5xx classes.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Status { status } => *status == 429 || *status >= 500,
			Self::Transport(err) => err.is_retryable(),
			_ => false,
		}
	}
}

/// Transport-level failures (network, IO, timeouts).
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum TransportError {
	/// Request exceeded its time budget.
	#[error("Request timed out after {timeout}.")]
	Timeout {
		/// Budget that was exceeded.
		timeout: Duration,
	},
	/// Underlying HTTP client reported a network failure.
	#[error("Network error: {message}.")]
	Network {
		/// Transport-specific failure summary.
		message: String,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error: {message}.")]
	Io {
		/// IO failure summary.
		message: String,
	},
	/// Request could not be constructed.
	#[error("Request could not be built: {message}.")]
	Request {
		/// Builder failure summary.
		message: String,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl Display) -> Self {
		Self::Network { message: src.to_string() }
	}

	/// Returns `true` unless the request itself was invalid.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, Self::Request { .. })
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Clone, Debug, ThisError)]
pub enum ConfigError {
	/// One or more required settings are absent.
	#[error("Missing required settings: {}.", keys.join(", "))]
	MissingSetting {
		/// Every missing key.
		keys: Vec<String>,
	},
	/// A setting could not be parsed.
	#[error("Setting `{key}` is invalid: {reason}.")]
	InvalidSetting {
		/// Offending key.
		key: String,
		/// Parse failure summary.
		reason: String,
	},
	/// Identity-provider descriptor failed validation.
	#[error(transparent)]
	Descriptor(#[from] DescriptorError),
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed: {message}.")]
	HttpClientBuild {
		/// Builder failure summary.
		message: String,
	},
	/// HTTP request construction failed.
	#[error("HTTP request could not be constructed: {message}.")]
	HttpRequest {
		/// Builder failure summary.
		message: String,
	},
	/// Scope configuration cannot be normalized.
	#[error("Configured scopes are invalid.")]
	InvalidScope(#[from] ScopeValidationError),
	/// Identifier validation failed.
	#[error(transparent)]
	InvalidIdentifier(#[from] IdentifierError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl Display) -> Self {
		Self::HttpClientBuild { message: src.to_string() }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}
impl From<oauth2::http::Error> for ConfigError {
	fn from(e: oauth2::http::Error) -> Self {
		Self::HttpRequest { message: e.to_string() }
	}
}
