//! Verified caller identity carried through a single tool invocation.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, SubjectId, TenantId, TokenSecret},
};

/// Identity established by verifying an inbound bearer token.
///
/// Built once per request by [`IdentityVerifier`](crate::verify::IdentityVerifier), never
/// mutated, and dropped with the request. The raw token is kept only so it can be presented
/// as the on-behalf-of assertion.
#[derive(Clone)]
pub struct IdentityContext {
	/// Stable user identifier (`oid`, falling back to `sub`).
	pub subject: SubjectId,
	/// Issuing directory tenant (`tid`).
	pub tenant: TenantId,
	/// The verified inbound token.
	pub token: TokenSecret,
	/// Issuer the token was verified against.
	pub issuer: String,
	/// Audience the token was verified against.
	pub audience: String,
	/// Token expiry.
	pub expires_at: OffsetDateTime,
	/// Delegated scopes granted to the caller (`scp`).
	pub scopes: ScopeSet,
	/// Optional profile claims surfaced by the `user_info` tool.
	pub profile: UserProfile,
}
impl IdentityContext {
	/// Returns `true` if the inbound token has expired at `instant`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		instant >= self.expires_at
	}
}
impl Debug for IdentityContext {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("IdentityContext")
			.field("subject", &self.subject)
			.field("tenant", &self.tenant)
			.field("token", &self.token)
			.field("issuer", &self.issuer)
			.field("audience", &self.audience)
			.field("expires_at", &self.expires_at)
			.field("scopes", &self.scopes)
			.finish_non_exhaustive()
	}
}

/// Display-oriented claims copied from the inbound token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	/// `name` claim.
	pub name: Option<String>,
	/// `email` claim.
	pub email: Option<String>,
	/// `preferred_username` claim.
	pub preferred_username: Option<String>,
}
