//! Tool surface: `search_documents`, `get_document`, `suggest`, and `user_info`.
//!
//! Every backend-facing tool walks the same path. The verified identity is checked, arguments
//! are validated, an outbound credential comes from the [`ExchangeCache`], and the backend is
//! called with that credential attached. When the backend rejects the credential itself the
//! dispatcher forces exactly one re-exchange and retries before surfacing
//! [`ExchangeError::StaleCredential`].

pub mod stage;

pub use stage::RequestStage;

// self
use crate::{
	_prelude::*,
	auth::{CachedCredential, IdentityContext, ScopeSet, TokenSecret},
	backend::{BackendFailure, Document, SearchBackend},
	cache::{CredentialRequest, ExchangeCache},
	error::{AuthenticationError, BackendError, ErrorKind, ExchangeError},
	exchange::RetryPolicy,
	obs::{self, Stage},
};
use stage::StageTracker;

/// `top` used when a caller does not supply one.
pub const DEFAULT_TOP: u32 = 5;

/// A tool invocation as received from the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolRequest {
	/// Full-text search.
	SearchDocuments {
		/// Query text.
		query: String,
		/// Result count, defaulting to [`DEFAULT_TOP`].
		#[serde(default)]
		top: Option<u32>,
	},
	/// Point lookup.
	GetDocument {
		/// Document key.
		id: String,
	},
	/// Suggestions for a partial query.
	Suggest {
		/// Partial query text.
		query: String,
		/// Suggestion count, defaulting to [`DEFAULT_TOP`].
		#[serde(default)]
		top: Option<u32>,
	},
	/// Caller profile from the verified token.
	UserInfo,
}
impl ToolRequest {
	/// Tool name as exposed to callers.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::SearchDocuments { .. } => "search_documents",
			Self::GetDocument { .. } => "get_document",
			Self::Suggest { .. } => "suggest",
			Self::UserInfo => "user_info",
		}
	}
}

/// Outcome of a tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
	/// Search or suggestion results; empty when nothing matched.
	Documents {
		/// Matching documents in backend order.
		documents: Vec<Document>,
	},
	/// A single document.
	Document {
		/// The requested document.
		document: Document,
	},
	/// Caller profile.
	UserInfo {
		/// Profile derived from the verified token.
		user: UserInfo,
	},
	/// Structured failure.
	Error {
		/// Kind and message.
		error: ToolError,
	},
}
impl ToolResult {
	/// Returns the error payload, if this result is a failure.
	pub fn error(&self) -> Option<&ToolError> {
		match self {
			Self::Error { error } => Some(error),
			_ => None,
		}
	}
}
impl From<Result<ToolResult>> for ToolResult {
	fn from(result: Result<ToolResult>) -> Self {
		result.unwrap_or_else(|err| Self::Error { error: ToolError::from(&err) })
	}
}

/// Structured error returned to tool callers. Never carries credential material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
	/// Stable error class.
	pub kind: ErrorKind,
	/// Human-readable message.
	pub message: String,
	/// Claims challenge for an interactive step-up, when consent is required.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub claims: Option<String>,
}
impl From<&Error> for ToolError {
	fn from(err: &Error) -> Self {
		let claims = match err {
			Error::ConsentRequired { claims, .. } => claims.clone(),
			_ => None,
		};

		Self { kind: err.kind(), message: err.to_string(), claims }
	}
}

/// Caller profile returned by `user_info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
	/// Stable subject identifier.
	pub subject: String,
	/// Tenant identifier.
	pub tenant: String,
	/// Display name.
	pub name: Option<String>,
	/// Email address.
	pub email: Option<String>,
	/// Sign-in name.
	pub preferred_username: Option<String>,
	/// Delegated scopes granted to the caller.
	pub scopes: Vec<String>,
}
impl From<&IdentityContext> for UserInfo {
	fn from(identity: &IdentityContext) -> Self {
		Self {
			subject: identity.subject.to_string(),
			tenant: identity.tenant.to_string(),
			name: identity.profile.name.clone(),
			email: identity.profile.email.clone(),
			preferred_username: identity.profile.preferred_username.clone(),
			scopes: identity.scopes.iter().map(str::to_owned).collect(),
		}
	}
}

/// Routes tool calls through the exchange cache to the search backend.
#[derive(Clone)]
pub struct ToolDispatcher {
	cache: Arc<ExchangeCache>,
	backend: Arc<dyn SearchBackend>,
	scope: ScopeSet,
	retry: RetryPolicy,
}
impl ToolDispatcher {
	/// Creates a dispatcher requesting `scope` for every backend call.
	pub fn new(
		cache: Arc<ExchangeCache>,
		backend: Arc<dyn SearchBackend>,
		scope: ScopeSet,
	) -> Self {
		Self { cache, backend, scope, retry: RetryPolicy::default() }
	}

	/// Overrides the retry policy for transient backend failures.
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Returns the shared exchange cache.
	pub fn cache(&self) -> &Arc<ExchangeCache> {
		&self.cache
	}

	/// Returns the scope requested for backend credentials.
	pub fn scope(&self) -> &ScopeSet {
		&self.scope
	}

	/// Runs `request` for `identity` and folds any failure into [`ToolResult::Error`].
	pub async fn call(
		&self,
		identity: Option<&IdentityContext>,
		request: &ToolRequest,
	) -> ToolResult {
		let result = match request {
			ToolRequest::SearchDocuments { query, top } => self
				.search_documents(identity, query, *top)
				.await
				.map(|documents| ToolResult::Documents { documents }),
			ToolRequest::GetDocument { id } => self
				.get_document(identity, id)
				.await
				.map(|document| ToolResult::Document { document }),
			ToolRequest::Suggest { query, top } => self
				.suggest(identity, query, *top)
				.await
				.map(|documents| ToolResult::Documents { documents }),
			ToolRequest::UserInfo =>
				self.user_info(identity).await.map(|user| ToolResult::UserInfo { user }),
		};

		result.into()
	}

	/// Searches the index; an empty result set is not an error.
	pub async fn search_documents(
		&self,
		identity: Option<&IdentityContext>,
		query: &str,
		top: Option<u32>,
	) -> Result<Vec<Document>> {
		let mut tracker = StageTracker::new("search_documents");
		let result = obs::observe(Stage::Search, "search_documents", async {
			let identity = establish(&mut tracker, identity)?;
			let (query, top) = self.validate_query(query, top)?;
			let backend = &self.backend;

			self.with_credential(&mut tracker, identity, None, move |credential| async move {
				backend.search(query, top, &credential).await
			})
			.await
		})
		.await;

		tracker.finish(result)
	}

	/// Fetches one document. Missing and forbidden documents are both [`Error::NotFound`].
	pub async fn get_document(
		&self,
		identity: Option<&IdentityContext>,
		id: &str,
	) -> Result<Document> {
		let mut tracker = StageTracker::new("get_document");
		let result = obs::observe(Stage::Get, "get_document", async {
			let identity = establish(&mut tracker, identity)?;
			let id = id.trim();

			if id.is_empty() {
				return Err(Error::InvalidRequest { reason: "id must not be empty".into() });
			}

			let backend = &self.backend;

			self.with_credential(&mut tracker, identity, Some(id), move |credential| async move {
				backend.get(id, &credential).await
			})
			.await
		})
		.await;

		tracker.finish(result)
	}

	/// Requests suggestions from the backend's suggester.
	pub async fn suggest(
		&self,
		identity: Option<&IdentityContext>,
		query: &str,
		top: Option<u32>,
	) -> Result<Vec<Document>> {
		let mut tracker = StageTracker::new("suggest");
		let result = obs::observe(Stage::Suggest, "suggest", async {
			let identity = establish(&mut tracker, identity)?;
			let (query, top) = self.validate_query(query, top)?;
			let backend = &self.backend;

			self.with_credential(&mut tracker, identity, None, move |credential| async move {
				backend.suggest(query, top, &credential).await
			})
			.await
		})
		.await;

		tracker.finish(result)
	}

	/// Returns the caller's profile without exchanging or calling the backend.
	pub async fn user_info(&self, identity: Option<&IdentityContext>) -> Result<UserInfo> {
		let mut tracker = StageTracker::new("user_info");
		let result = obs::observe(Stage::UserInfo, "user_info", async {
			establish(&mut tracker, identity).map(UserInfo::from)
		})
		.await;

		tracker.finish(result)
	}

	fn validate_query<'q>(&self, query: &'q str, top: Option<u32>) -> Result<(&'q str, u32)> {
		let query = query.trim();
		let max = self.backend.max_top().max(1);
		let top = top.unwrap_or(DEFAULT_TOP.min(max));

		if query.is_empty() {
			return Err(Error::InvalidRequest { reason: "query must not be empty".into() });
		}
		if top == 0 || top > max {
			return Err(Error::InvalidRequest {
				reason: format!("top must be between 1 and {max}"),
			});
		}

		Ok((query, top))
	}

	async fn with_credential<T, F, Fut>(
		&self,
		tracker: &mut StageTracker,
		identity: &IdentityContext,
		document: Option<&str>,
		call: F,
	) -> Result<T>
	where
		F: Fn(TokenSecret) -> Fut,
		Fut: Future<Output = Result<T, BackendFailure>>,
	{
		let mut credential =
			self.cache.get_or_exchange(CredentialRequest::new(identity, &self.scope)).await?;
		let mut replaced = false;

		tracker.advance(RequestStage::CredentialObtained);
		tracker.advance(RequestStage::BackendCalled);

		loop {
			let outcome = self
				.retry
				.run("backend_call", || {
					let secret = credential.credential.clone();
					let call = &call;

					async move {
						match call(secret).await {
							Err(BackendFailure::Error(err)) => Err(Error::from(err)),
							other => Ok(other),
						}
					}
				})
				.await?;

			match outcome {
				Ok(value) => return Ok(value),
				Err(BackendFailure::Unauthorized) if !replaced => {
					#[cfg(feature = "tracing")]
					tracing::debug!(
						credential = %credential.credential.fingerprint(),
						"backend rejected the exchanged credential, forcing one re-exchange"
					);

					replaced = true;
					credential = self.replace(identity, credential).await?;
				},
				Err(BackendFailure::Unauthorized) =>
					return Err(ExchangeError::StaleCredential.into()),
				Err(BackendFailure::NotFound) => return Err(hidden(document, 404)),
				Err(BackendFailure::Forbidden) => return Err(hidden(document, 403)),
				Err(BackendFailure::Error(err)) => return Err(err.into()),
			}
		}
	}

	async fn replace(
		&self,
		identity: &IdentityContext,
		rejected: CachedCredential,
	) -> Result<CachedCredential> {
		self.cache
			.get_or_exchange(CredentialRequest::new(identity, &self.scope).replacing(&rejected))
			.await
	}
}
impl Debug for ToolDispatcher {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ToolDispatcher")
			.field("cache", &self.cache)
			.field("scope", &self.scope)
			.field("retry", &self.retry)
			.finish_non_exhaustive()
	}
}

fn establish<'i>(
	tracker: &mut StageTracker,
	identity: Option<&'i IdentityContext>,
) -> Result<&'i IdentityContext> {
	let identity = identity.ok_or(AuthenticationError::MissingContext)?;

	if identity.is_expired_at(OffsetDateTime::now_utc()) {
		return Err(AuthenticationError::Expired.into());
	}

	tracker.advance(RequestStage::Verified);

	Ok(identity)
}

/// Absent and forbidden documents must look the same to the caller.
fn hidden(document: Option<&str>, status: u16) -> Error {
	match document {
		Some(id) => Error::NotFound { id: id.to_owned() },
		None => BackendError::Status {
			status,
			message: "search index is not available to the caller".into(),
			retry_after: None,
		}
		.into(),
	}
}
