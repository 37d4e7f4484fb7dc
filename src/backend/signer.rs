//! Attaches the exchanged credential to outbound backend requests.

// crates.io
use oauth2::{
	HttpRequest,
	http::header::{HeaderName, HeaderValue},
};
// self
use crate::{_prelude::*, auth::TokenSecret, error::TransportError};

/// Header the search service reads the caller's delegated credential from.
pub const QUERY_SOURCE_AUTHORIZATION: &str = "x-ms-query-source-authorization";

/// Describes how to attach an exchanged credential to an outbound request without
/// constraining the HTTP client type.
pub trait RequestSigner<Request, Error>
where
	Self: Send + Sync,
{
	/// Consumes the request and injects authorization state derived from `credential`.
	fn sign(&self, request: Request, credential: &TokenSecret) -> Result<Request, Error>;
}

/// Sends the credential as `x-ms-query-source-authorization: Bearer <credential>`.
///
/// The service connection keeps authenticating with its own key; this header only tells the
/// backend whose permissions to filter by.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuerySourceAuthorization;
impl RequestSigner<HttpRequest, TransportError> for QuerySourceAuthorization {
	fn sign(
		&self,
		mut request: HttpRequest,
		credential: &TokenSecret,
	) -> Result<HttpRequest, TransportError> {
		let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
			.map_err(|_| TransportError::Request {
				message: "delegated credential is not a valid header value".into(),
			})?;

		value.set_sensitive(true);
		request
			.headers_mut()
			.insert(HeaderName::from_static(QUERY_SOURCE_AUTHORIZATION), value);

		Ok(request)
	}
}
