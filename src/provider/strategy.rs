//! Provider strategy hooks that customize on-behalf-of exchanges.
//!
//! Implementations decorate outgoing exchange requests and normalize error mapping
//! without tying the exchange client to any particular HTTP client.

// self
use crate::_prelude::*;

/// Strategy hook that allows providers to decorate requests and classify errors.
///
/// Implementors are required to be `Send + Sync`, and the hooks use crate-owned data types
/// so downstream crates never depend on reqwest-specific structures. Override only what you
/// need; `augment_exchange_request` has a default no-op implementation.
pub trait ProviderStrategy: Send + Sync {
	/// Maps token-endpoint failures into the broker taxonomy.
	fn classify_exchange_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind;

	/// Gives providers a chance to add custom form parameters before dispatching.
	fn augment_exchange_request(&self, _form: &mut BTreeMap<String, String>) {}
}

/// Canonical provider error categories used by strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
	/// The user must interact (consent, MFA, sign-in) before the exchange can succeed.
	ConsentRequired,
	/// Provider rejected the assertion or the requested scope.
	InvalidGrant,
	/// Client authentication failed.
	InvalidClient,
	/// Failure is temporary and should be retried.
	Transient,
}

/// Context passed to provider strategies when classifying exchange errors.
///
/// Only primitive data is kept (status codes, OAuth fields, body preview) so strategies stay
/// decoupled from any HTTP client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderErrorContext {
	/// HTTP status code returned by the provider, when available.
	pub http_status: Option<u16>,
	/// Provider-supplied OAuth `error` field.
	pub oauth_error: Option<String>,
	/// Provider-supplied OAuth `error_description` field.
	pub error_description: Option<String>,
	/// Provider-specific numeric error codes (`error_codes`).
	pub error_codes: Vec<u32>,
	/// Provider-specific sub-classification (`suberror`).
	pub suberror: Option<String>,
	/// Claims challenge returned alongside interaction errors.
	pub claims: Option<String>,
	/// Preview of the response body for non-JSON payloads.
	pub body_preview: Option<String>,
	/// Indicates whether the failure originated from the network/transport layer.
	pub network_error: bool,
}
impl ProviderErrorContext {
	const BODY_PREVIEW_LIMIT: usize = 256;

	/// Convenience constructor for transport-level/network failures.
	pub fn network_failure() -> Self {
		Self { network_error: true, ..Default::default() }
	}

	/// Adds an HTTP status code (e.g., 400, 401, 500).
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Adds the OAuth error code string returned by the provider.
	pub fn with_oauth_error(mut self, error: impl Into<String>) -> Self {
		self.oauth_error = Some(error.into());

		self
	}

	/// Adds the OAuth `error_description` field.
	pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
		self.error_description = Some(description.into());

		self
	}

	/// Adds provider-specific numeric error codes.
	pub fn with_error_codes(mut self, codes: impl IntoIterator<Item = u32>) -> Self {
		self.error_codes.extend(codes);

		self
	}

	/// Adds the provider `suberror` field.
	pub fn with_suberror(mut self, suberror: impl Into<String>) -> Self {
		self.suberror = Some(suberror.into());

		self
	}

	/// Adds a claims challenge.
	pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
		self.claims = Some(claims.into());

		self
	}

	/// Adds a body preview for providers that return non-JSON payloads.
	pub fn with_body_preview(mut self, body: impl Into<String>) -> Self {
		self.body_preview = Some(truncate_preview(body.into()));

		self
	}
}

/// Default strategy that applies RFC 6749 and OpenID Connect heuristics.
///
/// It prioritizes structured OAuth fields (`error`, `error_description`), then falls back to
/// body text hints, and finally the HTTP status code. Network failures are always transient.
#[derive(Debug, Default)]
pub struct DefaultProviderStrategy;
impl Display for DefaultProviderStrategy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("default-provider-strategy")
	}
}
impl ProviderStrategy for DefaultProviderStrategy {
	fn classify_exchange_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind {
		if ctx.network_error {
			return ProviderErrorKind::Transient;
		}

		if let Some(kind) =
			classify_oauth_error(ctx.oauth_error.as_deref(), ctx.error_description.as_deref())
		{
			return kind;
		}
		if let Some(kind) = classify_body(ctx.body_preview.as_deref()) {
			return kind;
		}

		classify_status(ctx.http_status)
	}
}

/// Strategy for Microsoft Entra ID token endpoints.
///
/// Entra ID reports interaction requirements through `AADSTS` codes, a `suberror`, or a
/// `claims` challenge even when `error` is a generic `invalid_grant`; any of those signals
/// classifies the failure as [`ProviderErrorKind::ConsentRequired`].
#[derive(Debug, Default)]
pub struct AzureAdStrategy;
impl AzureAdStrategy {
	/// `AADSTS65001`: the user or administrator has not consented to the application.
	pub const CONSENT_NOT_GRANTED: u32 = 65001;
	/// `AADSTS50076`: multi-factor authentication is required.
	pub const MFA_REQUIRED: u32 = 50076;
	/// `AADSTS50079`: the user must enroll in multi-factor authentication.
	pub const MFA_ENROLLMENT_REQUIRED: u32 = 50079;
}
impl Display for AzureAdStrategy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("azure-ad-strategy")
	}
}
impl ProviderStrategy for AzureAdStrategy {
	fn classify_exchange_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind {
		if ctx.network_error {
			return ProviderErrorKind::Transient;
		}

		let interaction_code = ctx.error_codes.iter().any(|code| {
			matches!(
				*code,
				Self::CONSENT_NOT_GRANTED | Self::MFA_REQUIRED | Self::MFA_ENROLLMENT_REQUIRED
			)
		});
		let interaction_suberror = ctx
			.suberror
			.as_deref()
			.is_some_and(|value| value.eq_ignore_ascii_case("consent_required"));

		if interaction_code || interaction_suberror || ctx.claims.is_some() {
			return ProviderErrorKind::ConsentRequired;
		}

		DefaultProviderStrategy.classify_exchange_error(ctx)
	}
}

fn truncate_preview(body: String) -> String {
	if body.chars().count() <= ProviderErrorContext::BODY_PREVIEW_LIMIT {
		return body;
	}

	let mut buf = String::new();

	for (idx, ch) in body.chars().enumerate() {
		if idx >= ProviderErrorContext::BODY_PREVIEW_LIMIT {
			buf.push('…');

			break;
		}
		buf.push(ch);
	}

	buf
}

fn classify_oauth_error(
	oauth_error: Option<&str>,
	error_description: Option<&str>,
) -> Option<ProviderErrorKind> {
	oauth_error
		.and_then(match_exact_value)
		.or_else(|| error_description.and_then(match_exact_value))
		.or_else(|| classify_body(error_description))
}

fn match_exact_value(value: &str) -> Option<ProviderErrorKind> {
	const INTERACTION: [&str; 3] = ["interaction_required", "consent_required", "login_required"];

	if INTERACTION.iter().any(|code| value.eq_ignore_ascii_case(code)) {
		Some(ProviderErrorKind::ConsentRequired)
	} else if value.eq_ignore_ascii_case("invalid_grant")
		|| value.eq_ignore_ascii_case("access_denied")
		|| value.eq_ignore_ascii_case("invalid_scope")
	{
		Some(ProviderErrorKind::InvalidGrant)
	} else if value.eq_ignore_ascii_case("invalid_client")
		|| value.eq_ignore_ascii_case("unauthorized_client")
	{
		Some(ProviderErrorKind::InvalidClient)
	} else if value.eq_ignore_ascii_case("temporarily_unavailable")
		|| value.eq_ignore_ascii_case("server_error")
	{
		Some(ProviderErrorKind::Transient)
	} else {
		None
	}
}

fn classify_body(body: Option<&str>) -> Option<ProviderErrorKind> {
	let body = body?;
	let lowered = body.to_ascii_lowercase();

	match lowered.as_str() {
		text if text.contains("interaction_required") || text.contains("consent_required") =>
			Some(ProviderErrorKind::ConsentRequired),
		text if text.contains("invalid_grant") || text.contains("invalid_scope") =>
			Some(ProviderErrorKind::InvalidGrant),
		text if text.contains("invalid_client") => Some(ProviderErrorKind::InvalidClient),
		text if text.contains("temporarily_unavailable") => Some(ProviderErrorKind::Transient),
		_ => None,
	}
}

fn classify_status(status: Option<u16>) -> ProviderErrorKind {
	match status {
		Some(400 | 403 | 404 | 410) => ProviderErrorKind::InvalidGrant,
		Some(401) => ProviderErrorKind::InvalidClient,
		_ => ProviderErrorKind::Transient,
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn interaction_errors_require_consent() {
		for code in ["interaction_required", "consent_required", "login_required"] {
			let ctx = ProviderErrorContext::default().with_http_status(400).with_oauth_error(code);

			assert_eq!(
				DefaultProviderStrategy.classify_exchange_error(&ctx),
				ProviderErrorKind::ConsentRequired,
				"{code} should require consent",
			);
		}
	}

	#[test]
	fn azure_codes_and_claims_override_invalid_grant() {
		let base =
			ProviderErrorContext::default().with_http_status(400).with_oauth_error("invalid_grant");

		assert_eq!(
			DefaultProviderStrategy.classify_exchange_error(&base),
			ProviderErrorKind::InvalidGrant
		);
		assert_eq!(
			AzureAdStrategy.classify_exchange_error(&base.clone().with_error_codes([65001])),
			ProviderErrorKind::ConsentRequired
		);
		assert_eq!(
			AzureAdStrategy.classify_exchange_error(&base.clone().with_error_codes([50076])),
			ProviderErrorKind::ConsentRequired
		);
		let with_suberror = base.clone().with_suberror("consent_required");
		let with_claims = base.clone().with_claims("{\"access_token\":{}}");

		assert_eq!(
			AzureAdStrategy.classify_exchange_error(&with_suberror),
			ProviderErrorKind::ConsentRequired
		);
		assert_eq!(
			AzureAdStrategy.classify_exchange_error(&with_claims),
			ProviderErrorKind::ConsentRequired
		);
		assert_eq!(
			AzureAdStrategy.classify_exchange_error(&base.with_error_codes([70011])),
			ProviderErrorKind::InvalidGrant
		);
	}

	#[test]
	fn status_fallbacks_split_client_and_transient_failures() {
		let strategy = DefaultProviderStrategy;
		let status = |code| ProviderErrorContext::default().with_http_status(code);

		assert_eq!(
			strategy.classify_exchange_error(&status(401)),
			ProviderErrorKind::InvalidClient
		);
		assert_eq!(strategy.classify_exchange_error(&status(503)), ProviderErrorKind::Transient);
		assert_eq!(
			strategy.classify_exchange_error(&ProviderErrorContext::network_failure()),
			ProviderErrorKind::Transient
		);
	}

	#[test]
	fn body_previews_are_truncated() {
		let ctx = ProviderErrorContext::default().with_body_preview("x".repeat(400));
		let preview = ctx.body_preview.expect("Body preview should be stored.");

		assert_eq!(preview.chars().count(), ProviderErrorContext::BODY_PREVIEW_LIMIT + 1);
		assert!(preview.ends_with('…'));
	}
}
