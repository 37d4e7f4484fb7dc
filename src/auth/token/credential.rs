//! Outbound credentials produced by the on-behalf-of exchange.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, token::secret::TokenSecret},
};

/// Lifecycle status for a cached outbound credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialStatus {
	/// Usable and outside the staleness margin.
	Fresh,
	/// Still valid but within the staleness margin; must be replaced before use.
	Stale,
	/// Past its expiry instant.
	Expired,
}

/// Errors produced by [`CachedCredentialBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CredentialBuilderError {
	/// No credential value was provided.
	#[error("Credential value is required.")]
	MissingCredential,
	/// No expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
}

/// Exchanged credential plus the scope it was issued for.
///
/// Records are immutable once built; a refresh replaces the whole record.
#[derive(Clone)]
pub struct CachedCredential {
	/// Outbound credential; callers must avoid logging it.
	pub credential: TokenSecret,
	/// Target scope the credential was requested for.
	pub scope: ScopeSet,
	/// Instant the exchange completed.
	pub issued_at: OffsetDateTime,
	/// Expiry instant reported by the token endpoint.
	pub expires_at: OffsetDateTime,
}
impl CachedCredential {
	/// Returns a builder for the provided target scope.
	pub fn builder(scope: ScopeSet) -> CachedCredentialBuilder {
		CachedCredentialBuilder::new(scope)
	}

	/// Computes the status at `instant` given a staleness margin.
	pub fn status_at(&self, instant: OffsetDateTime, margin: Duration) -> CredentialStatus {
		if instant >= self.expires_at {
			return CredentialStatus::Expired;
		}
		if self.expires_at - instant <= margin {
			return CredentialStatus::Stale;
		}

		CredentialStatus::Fresh
	}

	/// Returns `true` if the credential may be handed out at `instant`.
	pub fn is_fresh_at(&self, instant: OffsetDateTime, margin: Duration) -> bool {
		matches!(self.status_at(instant, margin), CredentialStatus::Fresh)
	}

	/// Returns `true` if the credential has expired at `instant`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		instant >= self.expires_at
	}
}
impl Debug for CachedCredential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CachedCredential")
			.field("credential", &"<redacted>")
			.field("scope", &self.scope)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Builder for [`CachedCredential`].
#[derive(Clone, Debug)]
pub struct CachedCredentialBuilder {
	scope: ScopeSet,
	credential: Option<TokenSecret>,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl CachedCredentialBuilder {
	fn new(scope: ScopeSet) -> Self {
		Self { scope, credential: None, issued_at: None, expires_at: None, expires_in: None }
	}

	/// Provides the credential value.
	pub fn credential(mut self, value: impl Into<String>) -> Self {
		self.credential = Some(TokenSecret::new(value));

		self
	}

	/// Sets the issued-at instant.
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration from the issued instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Consumes the builder and produces a [`CachedCredential`].
	pub fn build(self) -> Result<CachedCredential, CredentialBuilderError> {
		let credential = self.credential.ok_or(CredentialBuilderError::MissingCredential)?;
		let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => issued_at + delta,
			(None, None) => return Err(CredentialBuilderError::MissingExpiry),
		};

		Ok(CachedCredential { credential, scope: self.scope, issued_at, expires_at })
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	fn scope() -> ScopeSet {
		ScopeSet::new(["https://search.azure.com/.default"])
			.expect("Scope fixture should be valid for credential tests.")
	}

	#[test]
	fn status_respects_staleness_margin() {
		let credential = CachedCredential::builder(scope())
			.credential("outbound")
			.issued_at(macros::datetime!(2025-01-01 00:00 UTC))
			.expires_in(Duration::hours(1))
			.build()
			.expect("Credential builder should succeed.");
		let margin = Duration::minutes(5);

		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 00:30 UTC), margin),
			CredentialStatus::Fresh
		);
		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 00:55 UTC), margin),
			CredentialStatus::Stale
		);
		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 01:00 UTC), margin),
			CredentialStatus::Expired
		);
		assert!(credential.is_fresh_at(macros::datetime!(2025-01-01 00:54 UTC), margin));
	}

	#[test]
	fn builder_requires_value_and_expiry() {
		assert_eq!(
			CachedCredential::builder(scope()).expires_in(Duration::minutes(1)).build().err(),
			Some(CredentialBuilderError::MissingCredential)
		);
		assert_eq!(
			CachedCredential::builder(scope()).credential("outbound").build().err(),
			Some(CredentialBuilderError::MissingExpiry)
		);
	}

	#[test]
	fn debug_output_redacts_credential() {
		let credential = CachedCredential::builder(scope())
			.credential("very-secret-outbound")
			.expires_in(Duration::minutes(10))
			.build()
			.expect("Credential builder should succeed.");

		assert!(!format!("{credential:?}").contains("very-secret-outbound"));
	}
}
