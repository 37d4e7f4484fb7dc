//! Environment-style configuration for a deployed broker.
//!
//! [`BrokerConfig::from_env`] reads the process environment; [`BrokerConfig::from_vars`] takes
//! any key/value iterator so tests never touch global state. Every required key is checked
//! before anything is parsed, and all missing keys are reported together.

// self
use crate::{
	_prelude::*,
	auth::{ProviderId, ScopeSet, TenantId, TokenSecret},
	backend::SearchServiceSettings,
	cache::CachePolicy,
	error::ConfigError,
	exchange::RetryPolicy,
	keys::KeySetPolicy,
	provider::{ClientAuthMethod, DescriptorError, IdentityProviderDescriptor},
	verify::VerifierSettings,
};

const REQUIRED: [&str; 5] = [
	"AZURE_TENANT_ID",
	"AZURE_CLIENT_ID",
	"AZURE_CLIENT_SECRET",
	"AZURE_SEARCH_ENDPOINT",
	"AZURE_SEARCH_ADMIN_KEY",
];
const AUTHORITY: &str = "https://login.microsoftonline.com";

/// Fully resolved broker settings.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
	/// Directory tenant (`AZURE_TENANT_ID`).
	pub tenant_id: TenantId,
	/// Broker application id (`AZURE_CLIENT_ID`).
	pub client_id: String,
	/// Broker application secret (`AZURE_CLIENT_SECRET`).
	pub client_secret: TokenSecret,
	/// Token endpoint client authentication (`OBO_CLIENT_AUTH_METHOD`).
	pub client_auth_method: ClientAuthMethod,
	/// Expected `iss` (`JWT_ISSUER`).
	pub issuer: String,
	/// Expected `aud` (`JWT_AUDIENCE`).
	pub audience: String,
	/// Signing key-set endpoint (`JWKS_URI`).
	pub jwks_uri: Url,
	/// On-behalf-of token endpoint (`OBO_TOKEN_ENDPOINT`).
	pub token_endpoint: Url,
	/// Scope requested for backend credentials (`OBO_SEARCH_SCOPE`).
	pub search_scope: ScopeSet,
	/// Scopes every inbound token must grant (`OBO_REQUIRED_SCOPES`).
	pub required_scopes: ScopeSet,
	/// Search service connection.
	pub search: SearchServiceSettings,
	/// Exchange cache policy.
	pub cache: CachePolicy,
	/// Key-set cache policy.
	pub keys: KeySetPolicy,
	/// Retry budget for the token endpoint and the backend.
	pub retry: RetryPolicy,
	/// Per-call timeout for every outbound request (`OBO_HTTP_TIMEOUT_SECS`).
	pub http_timeout: Duration,
	/// Permits plain-HTTP identity endpoints (`OBO_ALLOW_INSECURE_ENDPOINTS`); local testing only.
	pub allow_insecure_endpoints: bool,
}
impl BrokerConfig {
	/// Reads settings from the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_vars(std::env::vars())
	}

	/// Reads settings from `vars`.
	pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let vars = Vars(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
		let missing = REQUIRED
			.iter()
			.filter(|key| vars.get(key).is_none())
			.map(|key| (*key).to_owned())
			.collect::<Vec<_>>();

		if !missing.is_empty() {
			return Err(ConfigError::MissingSetting { keys: missing });
		}

		let tenant = vars.required("AZURE_TENANT_ID")?;
		let tenant_id = TenantId::new(tenant).map_err(|err| invalid("AZURE_TENANT_ID", err))?;
		let client_id = vars.required("AZURE_CLIENT_ID")?.to_owned();
		let http_timeout = seconds(vars.parse_or("OBO_HTTP_TIMEOUT_SECS", 10_u32)?);

		if !http_timeout.is_positive() {
			return Err(invalid("OBO_HTTP_TIMEOUT_SECS", "must be positive"));
		}

		let search_scope = vars.parse_or("OBO_SEARCH_SCOPE", default_search_scope()?)?;

		if search_scope.is_empty() {
			return Err(invalid("OBO_SEARCH_SCOPE", "must name at least one scope"));
		}

		let search = SearchServiceSettings {
			endpoint: vars.url("AZURE_SEARCH_ENDPOINT", None)?,
			index: vars.get("AZURE_SEARCH_INDEX").unwrap_or("documents").to_owned(),
			api_key: TokenSecret::new(vars.required("AZURE_SEARCH_ADMIN_KEY")?),
			api_version: vars
				.get("AZURE_SEARCH_API_VERSION")
				.unwrap_or("2025-11-01-preview")
				.to_owned(),
			suggester: vars.get("AZURE_SEARCH_SUGGESTER").unwrap_or("sg").to_owned(),
			max_top: vars.parse_or("OBO_SEARCH_MAX_TOP", 50_u32)?,
			timeout: http_timeout,
		};

		if search.max_top == 0 {
			return Err(invalid("OBO_SEARCH_MAX_TOP", "must be at least 1"));
		}

		let cache = CachePolicy {
			staleness_margin: seconds(vars.parse_or("OBO_STALENESS_MARGIN_SECS", 60_u32)?),
			idle_eviction: seconds(vars.parse_or("OBO_IDLE_EVICTION_SECS", 900_u32)?),
			..CachePolicy::default()
		};
		let keys = KeySetPolicy {
			refresh_interval: seconds(vars.parse_or("OBO_KEYSET_REFRESH_SECS", 3_600_u32)?),
			fetch_timeout: http_timeout,
			..KeySetPolicy::default()
		};
		let retry = RetryPolicy {
			max_attempts: vars.parse_or("OBO_RETRY_MAX_ATTEMPTS", 3_u32)?.max(1),
			initial_backoff: millis(vars.parse_or("OBO_RETRY_INITIAL_BACKOFF_MS", 200_u32)?),
			max_backoff: millis(vars.parse_or("OBO_RETRY_MAX_BACKOFF_MS", 2_000_u32)?),
			jitter: true,
		};
		let client_auth_method = match vars.get("OBO_CLIENT_AUTH_METHOD") {
			None | Some("client_secret_post") => ClientAuthMethod::ClientSecretPost,
			Some("client_secret_basic") => ClientAuthMethod::ClientSecretBasic,
			Some(other) => return Err(invalid("OBO_CLIENT_AUTH_METHOD", format!("`{other}`"))),
		};

		Ok(Self {
			issuer: vars
				.get("JWT_ISSUER")
				.map(str::to_owned)
				.unwrap_or_else(|| format!("{AUTHORITY}/{tenant}/v2.0")),
			audience: vars
				.get("JWT_AUDIENCE")
				.map(str::to_owned)
				.unwrap_or_else(|| format!("api://{client_id}")),
			jwks_uri: vars
				.url("JWKS_URI", Some(format!("{AUTHORITY}/{tenant}/discovery/v2.0/keys")))?,
			token_endpoint: vars.url(
				"OBO_TOKEN_ENDPOINT",
				Some(format!("{AUTHORITY}/{tenant}/oauth2/v2.0/token")),
			)?,
			client_secret: TokenSecret::new(vars.required("AZURE_CLIENT_SECRET")?),
			required_scopes: vars
				.parse_or("OBO_REQUIRED_SCOPES", ScopeSet::from_claim("user_impersonation"))?,
			allow_insecure_endpoints: vars.parse_or("OBO_ALLOW_INSECURE_ENDPOINTS", false)?,
			tenant_id,
			client_id,
			client_auth_method,
			search_scope,
			search,
			cache,
			keys,
			retry,
			http_timeout,
		})
	}

	/// Verification settings for inbound tokens.
	pub fn verifier_settings(&self) -> VerifierSettings {
		VerifierSettings::new(self.issuer.clone(), self.audience.clone())
			.with_required_scopes(self.required_scopes.clone())
	}

	/// Identity-provider descriptor for the configured tenant and endpoints.
	pub fn descriptor(&self) -> Result<IdentityProviderDescriptor, DescriptorError> {
		let id = ProviderId::new(self.tenant_id.as_ref()).map_err(|err| {
			DescriptorError::InvalidEndpoint { endpoint: "issuer", reason: err.to_string() }
		})?;

		IdentityProviderDescriptor::builder(id)
			.issuer(self.issuer.clone())
			.token_endpoint(self.token_endpoint.clone())
			.jwks_endpoint(self.jwks_uri.clone())
			.client_auth_method(self.client_auth_method)
			.allow_insecure_endpoints(self.allow_insecure_endpoints)
			.build()
	}
}

struct Vars(HashMap<String, String>);
impl Vars {
	/// Trimmed, non-empty value for `key`.
	fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
	}

	fn required(&self, key: &'static str) -> Result<&str, ConfigError> {
		self.get(key).ok_or_else(|| ConfigError::MissingSetting { keys: vec![key.into()] })
	}

	fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
	where
		T: FromStr,
		T::Err: Display,
	{
		match self.get(key) {
			Some(raw) => raw.parse().map_err(|err| invalid(key, err)),
			None => Ok(default),
		}
	}

	fn url(&self, key: &'static str, default: Option<String>) -> Result<Url, ConfigError> {
		let raw = match (self.get(key), default) {
			(Some(raw), _) => raw.to_owned(),
			(None, Some(default)) => default,
			(None, None) => return Err(ConfigError::MissingSetting { keys: vec![key.into()] }),
		};

		Url::parse(&raw).map_err(|err| invalid(key, err))
	}
}

fn invalid(key: &'static str, reason: impl Display) -> ConfigError {
	ConfigError::InvalidSetting { key: key.into(), reason: reason.to_string() }
}

fn seconds(value: u32) -> Duration {
	Duration::seconds(value.into())
}

fn millis(value: u32) -> Duration {
	Duration::milliseconds(value.into())
}

fn default_search_scope() -> Result<ScopeSet, ConfigError> {
	ScopeSet::new(["https://search.azure.com/.default"]).map_err(ConfigError::from)
}
