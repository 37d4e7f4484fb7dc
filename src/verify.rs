//! Inbound bearer verification against the trusted issuer's signing keys.
//!
//! [`IdentityVerifier::verify`] parses the compact token, resolves its `kid` through the
//! [`KeySetCache`] (forcing one refresh on a miss), validates signature, `exp`, `nbf`, `iss`
//! and `aud`, checks the delegated scopes the broker requires, and returns an immutable
//! [`IdentityContext`]. Nothing here performs I/O except the key-set refresh on a miss.

// crates.io
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind as JwtErrorKind};
// self
use crate::{
	_prelude::*,
	auth::{IdentityContext, ScopeSet, SubjectId, TenantId, TokenSecret, UserProfile},
	error::AuthenticationError,
	keys::KeySetCache,
	obs::{self, Stage},
};

/// Expected issuer, audience, and claim policy for inbound tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifierSettings {
	/// Issuer inbound tokens must carry in `iss`.
	pub issuer: String,
	/// Audience inbound tokens must carry in `aud`.
	pub audience: String,
	/// Accepted signing algorithms.
	pub algorithms: Vec<Algorithm>,
	/// Clock-skew tolerance applied to `exp` and `nbf`.
	pub leeway: Duration,
	/// Delegated scopes every inbound token must grant via `scp`.
	pub required_scopes: ScopeSet,
}
impl VerifierSettings {
	/// Creates settings for `issuer` + `audience` with RS256, no leeway, and no required scopes.
	pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
		Self {
			issuer: issuer.into(),
			audience: audience.into(),
			algorithms: vec![Algorithm::RS256],
			leeway: Duration::ZERO,
			required_scopes: ScopeSet::default(),
		}
	}

	/// Overrides the scopes inbound tokens must grant.
	pub fn with_required_scopes(mut self, scopes: ScopeSet) -> Self {
		self.required_scopes = scopes;

		self
	}

	/// Overrides the clock-skew tolerance. Negative values clamp to zero.
	pub fn with_leeway(mut self, leeway: Duration) -> Self {
		self.leeway = if leeway.is_negative() { Duration::ZERO } else { leeway };

		self
	}

	fn validation(&self) -> Validation {
		let mut validation = Validation::new(Algorithm::RS256);

		validation.algorithms = self.algorithms.clone();
		validation.leeway = self.leeway.whole_seconds().unsigned_abs();
		validation.validate_exp = true;
		validation.validate_nbf = true;
		validation.set_issuer(&[self.issuer.as_str()]);
		validation.set_audience(&[self.audience.as_str()]);
		validation.set_required_spec_claims(&["exp", "iss", "aud"]);

		validation
	}
}

#[derive(Deserialize)]
struct Claims {
	oid: Option<String>,
	sub: Option<String>,
	tid: Option<String>,
	exp: i64,
	scp: Option<String>,
	name: Option<String>,
	email: Option<String>,
	preferred_username: Option<String>,
}

/// Validates inbound bearer tokens.
#[derive(Clone, Debug)]
pub struct IdentityVerifier {
	keys: Arc<KeySetCache>,
	settings: VerifierSettings,
}
impl IdentityVerifier {
	/// Creates a verifier over a shared key-set cache.
	pub fn new(keys: Arc<KeySetCache>, settings: VerifierSettings) -> Self {
		Self { keys, settings }
	}

	/// Returns the shared key-set cache.
	pub fn keys(&self) -> &Arc<KeySetCache> {
		&self.keys
	}

	/// Returns the verification settings.
	pub fn settings(&self) -> &VerifierSettings {
		&self.settings
	}

	/// Verifies `raw_token` and returns the identity it speaks for.
	pub async fn verify(&self, raw_token: &str) -> Result<IdentityContext> {
		obs::observe(Stage::Verify, "verify", async {
			self.verify_inner(raw_token).await.map_err(Error::from)
		})
		.await
	}

	async fn verify_inner(&self, raw_token: &str) -> Result<IdentityContext, AuthenticationError> {
		let raw_token = raw_token.trim();

		if raw_token.is_empty() {
			return Err(AuthenticationError::Malformed { reason: "token is empty".into() });
		}

		let header = jsonwebtoken::decode_header(raw_token).map_err(map_jwt_error)?;

		if !self.settings.algorithms.contains(&header.alg) {
			return Err(AuthenticationError::UnsupportedAlgorithm {
				algorithm: format!("{:?}", header.alg),
			});
		}

		let kid = header.kid.ok_or(AuthenticationError::MissingKeyId)?;

		self.keys.spawn_refresh_if_due();

		let observed = self.keys.generation();
		let key = match self.keys.get_key(&kid) {
			Some(key) => key,
			None => {
				#[cfg(feature = "tracing")]
				tracing::debug!(kid = %kid, "unknown signing key, forcing a key-set refresh");

				if let Err(_err) = self.keys.refresh_for_miss(&kid, observed).await {
					#[cfg(feature = "tracing")]
					tracing::warn!(error = %_err, "key-set refresh after kid miss failed");
				}

				self.keys.get_key(&kid).ok_or(AuthenticationError::UnknownKey { kid })?
			},
		};
		let data = jsonwebtoken::decode::<Claims>(raw_token, &key, &self.settings.validation())
			.map_err(map_jwt_error)?;

		self.build_context(raw_token, data.claims)
	}

	fn build_context(
		&self,
		raw_token: &str,
		claims: Claims,
	) -> Result<IdentityContext, AuthenticationError> {
		let subject = claims
			.oid
			.or(claims.sub)
			.ok_or(AuthenticationError::MissingClaim { claim: "oid" })?;
		let subject = SubjectId::new(subject).map_err(|err| AuthenticationError::Malformed {
			reason: format!("subject claim is invalid: {err}"),
		})?;
		let tenant = claims.tid.ok_or(AuthenticationError::MissingClaim { claim: "tid" })?;
		let tenant = TenantId::new(tenant).map_err(|err| AuthenticationError::Malformed {
			reason: format!("tenant claim is invalid: {err}"),
		})?;
		let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp).map_err(|_| {
			AuthenticationError::Malformed { reason: "exp is out of range".into() }
		})?;
		let scopes = claims.scp.as_deref().map(ScopeSet::from_claim).unwrap_or_default();
		let missing = scopes.missing(&self.settings.required_scopes);

		if !missing.is_empty() {
			return Err(AuthenticationError::InsufficientScope { missing: missing.join(" ") });
		}

		Ok(IdentityContext {
			subject,
			tenant,
			token: TokenSecret::new(raw_token),
			issuer: self.settings.issuer.clone(),
			audience: self.settings.audience.clone(),
			expires_at,
			scopes,
			profile: UserProfile {
				name: claims.name,
				email: claims.email,
				preferred_username: claims.preferred_username,
			},
		})
	}
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthenticationError {
	match err.kind() {
		JwtErrorKind::ExpiredSignature => AuthenticationError::Expired,
		JwtErrorKind::ImmatureSignature => AuthenticationError::NotYetValid,
		JwtErrorKind::InvalidIssuer => AuthenticationError::IssuerMismatch,
		JwtErrorKind::InvalidAudience => AuthenticationError::AudienceMismatch,
		JwtErrorKind::InvalidSignature => AuthenticationError::InvalidSignature,
		JwtErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
			"exp" => AuthenticationError::MissingClaim { claim: "exp" },
			"iss" => AuthenticationError::MissingClaim { claim: "iss" },
			"aud" => AuthenticationError::MissingClaim { claim: "aud" },
			other => AuthenticationError::Malformed { reason: format!("missing claim {other}") },
		},
		JwtErrorKind::InvalidAlgorithm
		| JwtErrorKind::MissingAlgorithm
		| JwtErrorKind::InvalidAlgorithmName => AuthenticationError::UnsupportedAlgorithm {
			algorithm: err.to_string(),
		},
		JwtErrorKind::InvalidToken
		| JwtErrorKind::Base64(_)
		| JwtErrorKind::Json(_)
		| JwtErrorKind::Utf8(_) => AuthenticationError::Malformed { reason: err.to_string() },
		_ => AuthenticationError::InvalidSignature,
	}
}
