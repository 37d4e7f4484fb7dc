//! Mapping from HTTP-client failures into broker [`TransportError`] values.

// crates.io
use oauth2::HttpClientError;
// self
use crate::{_prelude::*, error::TransportError, http::ResponseMetadata};

/// Maps HTTP transport failures into broker [`TransportError`] values.
///
/// Every outbound call (key-set fetch, token exchange, backend request) funnels its
/// client-level failure through one mapper so timeouts and connection errors classify the
/// same way regardless of which stage hit them.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> TransportError;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> TransportError {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(meta, *inner),
			HttpClientError::Http(inner) => TransportError::Request { message: inner.to_string() },
			HttpClientError::Io(inner) => TransportError::Io { message: inner.to_string() },
			HttpClientError::Other(message) => TransportError::network(message),
			_ => TransportError::network("HTTP client error occurred"),
		}
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(meta: Option<&ResponseMetadata>, err: ReqwestError) -> TransportError {
	if err.is_builder() {
		return TransportError::Request { message: err.to_string() };
	}
	if err.is_timeout() {
		let status =
			meta.and_then(|value| value.status).or_else(|| err.status().map(|s| s.as_u16()));

		return match status {
			Some(status) => TransportError::network(format!("request timed out (HTTP {status})")),
			None => TransportError::network("request timed out"),
		};
	}

	TransportError::from(err)
}
