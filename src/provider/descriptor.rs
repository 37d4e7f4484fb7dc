//! Identity-provider descriptor data structures.

/// Builder API for assembling provider descriptors.
pub mod builder;

pub use builder::*;

// self
use crate::{_prelude::*, auth::ProviderId};

/// Client authentication modes for token endpoint calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
	#[default]
	/// Form POST body parameters for `client_id`/`client_secret`.
	ClientSecretPost,
	/// HTTP Basic with `client_id`/`client_secret`.
	ClientSecretBasic,
}

/// Endpoint set declared by a provider descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
	/// Token endpoint that performs the on-behalf-of exchange.
	pub token: Url,
	/// Signing key-set (JWKS) endpoint for the trusted issuer.
	pub jwks: Url,
}

/// Immutable identity-provider descriptor consumed by the verifier and the exchange client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProviderDescriptor {
	/// Descriptor identifier.
	pub id: ProviderId,
	/// Issuer string inbound tokens must carry in `iss`.
	pub issuer: String,
	/// Endpoint definitions exposed by the provider.
	pub endpoints: ProviderEndpoints,
	/// Client authentication mechanism for the token endpoint.
	pub client_auth_method: ClientAuthMethod,
}
impl IdentityProviderDescriptor {
	/// Creates a new builder for the provided identifier.
	pub fn builder(id: ProviderId) -> IdentityProviderDescriptorBuilder {
		IdentityProviderDescriptorBuilder::new(id)
	}

	/// Descriptor for a Microsoft Entra ID (v2.0) tenant.
	pub fn entra_id(tenant: &str) -> Result<Self, DescriptorError> {
		let base = format!("https://login.microsoftonline.com/{tenant}");
		let parse = |endpoint: &'static str, raw: String| {
			Url::parse(&raw).map_err(|err| DescriptorError::InvalidEndpoint {
				endpoint,
				reason: err.to_string(),
			})
		};
		let id = ProviderId::new(tenant).map_err(|err| DescriptorError::InvalidEndpoint {
			endpoint: "issuer",
			reason: err.to_string(),
		})?;

		Self::builder(id)
			.issuer(format!("{base}/v2.0"))
			.token_endpoint(parse("token", format!("{base}/oauth2/v2.0/token"))?)
			.jwks_endpoint(parse("jwks", format!("{base}/discovery/v2.0/keys"))?)
			.build()
	}
}
