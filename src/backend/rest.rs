//! REST client for an Azure AI Search style index.

// crates.io
use futures::future::BoxFuture;
use oauth2::{
	AsyncHttpClient, HttpRequest, HttpResponse,
	http::{
		Method,
		header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue},
	},
};
use serde_json::{Map, Value, json};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	backend::{BackendFailure, Document, QuerySourceAuthorization, RequestSigner, SearchBackend},
	error::{BackendError, TransportError},
	http::{self, HttpTransport, ResponseMetadata, ResponseMetadataSlot},
	transport::TransportErrorMapper,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, transport::ReqwestTransportErrorMapper};

const API_KEY: &str = "api-key";
const BODY_PREVIEW_LIMIT: usize = 256;

/// Backend client specialized for the crate's default reqwest transport stack.
#[cfg(feature = "reqwest")]
pub type ReqwestSearchBackend = RestSearchBackend<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Connection settings for the search service.
#[derive(Clone, Debug)]
pub struct SearchServiceSettings {
	/// Service root, e.g. `https://<service>.search.windows.net`.
	pub endpoint: Url,
	/// Index holding the documents.
	pub index: String,
	/// Service key authenticating the broker's connection.
	pub api_key: TokenSecret,
	/// REST API version.
	pub api_version: String,
	/// Suggester used by `suggest`.
	pub suggester: String,
	/// Largest `top` the broker forwards.
	pub max_top: u32,
	/// Upper bound on one backend call.
	pub timeout: Duration,
}
impl SearchServiceSettings {
	/// Creates settings with the default index, API version, suggester, and limits.
	pub fn new(endpoint: Url, api_key: impl Into<String>) -> Self {
		Self {
			endpoint,
			index: "documents".into(),
			api_key: TokenSecret::new(api_key),
			api_version: "2025-11-01-preview".into(),
			suggester: "sg".into(),
			max_top: 50,
			timeout: Duration::seconds(10),
		}
	}

	/// Overrides the index name.
	pub fn with_index(mut self, index: impl Into<String>) -> Self {
		self.index = index.into();

		self
	}

	fn url(&self, tail: &[&str]) -> Result<Url, TransportError> {
		let mut url = self.endpoint.clone();

		url.path_segments_mut()
			.map_err(|_| TransportError::Request {
				message: "search endpoint cannot carry a path".into(),
			})?
			.pop_if_empty()
			.extend(["indexes", self.index.as_str(), "docs"])
			.extend(tail);
		url.query_pairs_mut().append_pair("api-version", &self.api_version);

		Ok(url)
	}
}

/// Calls the search REST API with the delegated credential attached to every request.
pub struct RestSearchBackend<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	settings: SearchServiceSettings,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	signer: Arc<dyn RequestSigner<HttpRequest, TransportError>>,
}
impl<C, M> RestSearchBackend<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a backend using the caller-provided transport + mapper pair.
	pub fn with_http_client(
		settings: SearchServiceSettings,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			settings,
			http_client: http_client.into(),
			error_mapper: mapper.into(),
			signer: Arc::new(QuerySourceAuthorization),
		}
	}

	/// Replaces the signer that attaches the delegated credential.
	pub fn with_signer(
		mut self,
		signer: Arc<dyn RequestSigner<HttpRequest, TransportError>>,
	) -> Self {
		self.signer = signer;

		self
	}

	/// Returns the connection settings.
	pub fn settings(&self) -> &SearchServiceSettings {
		&self.settings
	}

	async fn search_docs(
		&self,
		query: &str,
		top: u32,
		credential: &TokenSecret,
	) -> Result<Vec<Document>, BackendFailure> {
		let url = self.settings.url(&["search"])?;
		let body = json!({ "search": query, "top": top });
		let response = self.send(Method::POST, url, Some(body), credential).await?;

		parse_documents(&response)
	}

	async fn get_doc(
		&self,
		id: &str,
		credential: &TokenSecret,
	) -> Result<Document, BackendFailure> {
		let url = self.settings.url(&[id])?;
		let response = self.send(Method::GET, url, None, credential).await?;
		let raw = http::parse_json::<Map<String, Value>>(response.body())
			.map_err(|message| BackendError::ResponseParse { message })?;

		Ok(Document::from_raw(raw)?)
	}

	async fn suggest_docs(
		&self,
		query: &str,
		top: u32,
		credential: &TokenSecret,
	) -> Result<Vec<Document>, BackendFailure> {
		let url = self.settings.url(&["suggest"])?;
		let body = json!({
			"search": query,
			"suggesterName": self.settings.suggester,
			"top": top,
		});
		let response = self.send(Method::POST, url, Some(body), credential).await?;

		parse_documents(&response)
	}

	async fn send(
		&self,
		method: Method,
		url: Url,
		body: Option<Value>,
		credential: &TokenSecret,
	) -> Result<HttpResponse, BackendFailure> {
		let slot = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(slot.clone());
		let request = self.build_request(method, url, body, credential)?;
		let timeout = self.settings.timeout;
		let response = tokio::time::timeout(timeout.unsigned_abs(), handle.call(request))
			.await
			.map_err(|_| TransportError::Timeout { timeout })?
			.map_err(|err| self.error_mapper.map_transport_error(slot.take().as_ref(), err))?;
		let meta = slot.take();

		match response.status().as_u16() {
			200..=299 => Ok(response),
			401 => Err(BackendFailure::Unauthorized),
			403 => Err(BackendFailure::Forbidden),
			404 => Err(BackendFailure::NotFound),
			status => Err(status_error(status, &response, meta.as_ref()).into()),
		}
	}

	fn build_request(
		&self,
		method: Method,
		url: Url,
		body: Option<Value>,
		credential: &TokenSecret,
	) -> Result<HttpRequest, TransportError> {
		let mut api_key = HeaderValue::from_str(self.settings.api_key.expose()).map_err(|_| {
			TransportError::Request { message: "search api key is not a valid header value".into() }
		})?;

		api_key.set_sensitive(true);

		let body = match body {
			Some(value) => serde_json::to_vec(&value)
				.map_err(|err| TransportError::Request { message: err.to_string() })?,
			None => Vec::new(),
		};
		let request = oauth2::http::Request::builder()
			.method(method)
			.uri(url.as_str())
			.header(ACCEPT, "application/json")
			.header(CONTENT_TYPE, "application/json")
			.header(HeaderName::from_static(API_KEY), api_key)
			.body(body)
			.map_err(|err| TransportError::Request { message: err.to_string() })?;

		self.signer.sign(request, credential)
	}
}
#[cfg(feature = "reqwest")]
impl RestSearchBackend<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a backend that provisions its own reqwest-backed transport.
	pub fn new(settings: SearchServiceSettings) -> Self {
		Self::with_http_client(
			settings,
			ReqwestHttpClient::default(),
			Arc::new(ReqwestTransportErrorMapper),
		)
	}
}
impl<C, M> SearchBackend for RestSearchBackend<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn max_top(&self) -> u32 {
		self.settings.max_top
	}

	fn search<'a>(
		&'a self,
		query: &'a str,
		top: u32,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Vec<Document>, BackendFailure>> {
		Box::pin(self.search_docs(query, top, credential))
	}

	fn get<'a>(
		&'a self,
		id: &'a str,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Document, BackendFailure>> {
		Box::pin(self.get_doc(id, credential))
	}

	fn suggest<'a>(
		&'a self,
		query: &'a str,
		top: u32,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Vec<Document>, BackendFailure>> {
		Box::pin(self.suggest_docs(query, top, credential))
	}
}
impl<C, M> Debug for RestSearchBackend<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RestSearchBackend")
			.field("endpoint", &self.settings.endpoint.as_str())
			.field("index", &self.settings.index)
			.field("api_version", &self.settings.api_version)
			.finish_non_exhaustive()
	}
}

#[derive(Deserialize)]
struct ResultPage {
	#[serde(default)]
	value: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
	error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
	code: Option<String>,
	message: Option<String>,
}

fn parse_documents(response: &HttpResponse) -> Result<Vec<Document>, BackendFailure> {
	let page = http::parse_json::<ResultPage>(response.body())
		.map_err(|message| BackendError::ResponseParse { message })?;

	page.value
		.into_iter()
		.map(Document::from_raw)
		.collect::<Result<_, _>>()
		.map_err(BackendFailure::from)
}

fn status_error(
	status: u16,
	response: &HttpResponse,
	meta: Option<&ResponseMetadata>,
) -> BackendError {
	let message = match http::parse_json::<ErrorEnvelope>(response.body()) {
		Ok(ErrorEnvelope { error: ErrorDetail { code, message } }) => match (code, message) {
			(Some(code), Some(message)) => format!("{code}: {message}"),
			(None, Some(text)) | (Some(text), None) => text,
			(None, None) => format!("HTTP {status}"),
		},
		Err(_) =>
			String::from_utf8_lossy(response.body()).chars().take(BODY_PREVIEW_LIMIT).collect(),
	};

	BackendError::Status { status, message, retry_after: meta.and_then(|value| value.retry_after) }
}
