// self
use crate::{
	_prelude::*,
	auth::ProviderId,
	provider::{ClientAuthMethod, IdentityProviderDescriptor, ProviderEndpoints},
};

/// Errors raised while constructing or validating descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum DescriptorError {
	/// Issuer is mandatory for token verification.
	#[error("Missing issuer.")]
	MissingIssuer,
	/// Token endpoint is mandatory for the exchange.
	#[error("Missing token endpoint.")]
	MissingTokenEndpoint,
	/// Key-set endpoint is mandatory for token verification.
	#[error("Missing key-set endpoint.")]
	MissingJwksEndpoint,
	/// Endpoints must use HTTPS.
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// Endpoint could not be parsed.
	#[error("The {endpoint} endpoint is invalid: {reason}.")]
	InvalidEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Parse failure summary.
		reason: String,
	},
}

/// Builder for [`IdentityProviderDescriptor`] values.
#[derive(Debug)]
pub struct IdentityProviderDescriptorBuilder {
	/// Identifier for the descriptor being constructed.
	pub id: ProviderId,
	/// Issuer expected in inbound tokens.
	pub issuer: Option<String>,
	/// Token endpoint used for the exchange.
	pub token_endpoint: Option<Url>,
	/// Key-set endpoint used by the verifier.
	pub jwks_endpoint: Option<Url>,
	/// Client authentication method for the token endpoint.
	pub client_auth_method: ClientAuthMethod,
	allow_insecure_endpoints: bool,
}
impl IdentityProviderDescriptorBuilder {
	/// Creates a new builder seeded with the provided identifier.
	pub fn new(id: ProviderId) -> Self {
		Self {
			id,
			issuer: None,
			token_endpoint: None,
			jwks_endpoint: None,
			client_auth_method: ClientAuthMethod::default(),
			allow_insecure_endpoints: false,
		}
	}

	/// Sets the trusted issuer.
	pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
		self.issuer = Some(issuer.into());

		self
	}

	/// Sets the token endpoint.
	pub fn token_endpoint(mut self, url: Url) -> Self {
		self.token_endpoint = Some(url);

		self
	}

	/// Sets the key-set endpoint.
	pub fn jwks_endpoint(mut self, url: Url) -> Self {
		self.jwks_endpoint = Some(url);

		self
	}

	/// Overrides the client authentication method.
	pub fn client_auth_method(mut self, method: ClientAuthMethod) -> Self {
		self.client_auth_method = method;

		self
	}

	/// Permits plain-HTTP endpoints. Only loopback mocks should need this.
	pub fn allow_insecure_endpoints(mut self, allow: bool) -> Self {
		self.allow_insecure_endpoints = allow;

		self
	}

	/// Consumes the builder and validates the resulting descriptor.
	pub fn build(self) -> Result<IdentityProviderDescriptor, DescriptorError> {
		let issuer =
			self.issuer.filter(|value| !value.is_empty()).ok_or(DescriptorError::MissingIssuer)?;
		let token = self.token_endpoint.ok_or(DescriptorError::MissingTokenEndpoint)?;
		let jwks = self.jwks_endpoint.ok_or(DescriptorError::MissingJwksEndpoint)?;

		if !self.allow_insecure_endpoints {
			validate_endpoint("token", &token)?;
			validate_endpoint("jwks", &jwks)?;
		}

		Ok(IdentityProviderDescriptor {
			id: self.id,
			issuer,
			endpoints: ProviderEndpoints { token, jwks },
			client_auth_method: self.client_auth_method,
		})
	}
}

fn validate_endpoint(name: &'static str, url: &Url) -> Result<(), DescriptorError> {
	if url.scheme() != "https" {
		Err(DescriptorError::InsecureEndpoint { endpoint: name, url: url.to_string() })
	} else {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn url(raw: &str) -> Url {
		Url::parse(raw).expect("URL fixture should parse.")
	}

	fn builder() -> IdentityProviderDescriptorBuilder {
		IdentityProviderDescriptorBuilder::new(
			ProviderId::new("mock").expect("Provider identifier fixture should be valid."),
		)
		.issuer("https://issuer.example.com/v2.0")
	}

	#[test]
	fn http_endpoints_are_rejected_by_default() {
		let err = builder()
			.token_endpoint(url("http://127.0.0.1/token"))
			.jwks_endpoint(url("https://issuer.example.com/keys"))
			.build()
			.expect_err("Plain HTTP token endpoint should be rejected.");

		assert!(matches!(err, DescriptorError::InsecureEndpoint { endpoint: "token", .. }));
	}

	#[test]
	fn insecure_override_permits_loopback_mocks() {
		let descriptor = builder()
			.token_endpoint(url("http://127.0.0.1/token"))
			.jwks_endpoint(url("http://127.0.0.1/keys"))
			.allow_insecure_endpoints(true)
			.build()
			.expect("Insecure override should allow loopback endpoints.");

		assert_eq!(descriptor.endpoints.jwks.path(), "/keys");
	}

	#[test]
	fn missing_fields_are_reported() {
		assert_eq!(
			IdentityProviderDescriptorBuilder::new(
				ProviderId::new("mock").expect("Provider identifier fixture should be valid.")
			)
			.build()
			.err(),
			Some(DescriptorError::MissingIssuer)
		);
		assert_eq!(builder().build().err(), Some(DescriptorError::MissingTokenEndpoint));
	}
}
