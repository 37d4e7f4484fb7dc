//! Search backend contract used by the tool dispatcher.
//!
//! The backend owns ranking and per-document permission filtering. The broker hands it a query
//! plus the exchanged credential and gets back documents or a [`BackendFailure`] that keeps the
//! authorization classes (unauthorized, forbidden, not found) apart from plain errors.

pub mod rest;
pub mod signer;

pub use rest::*;
pub use signer::*;

// crates.io
use futures::future::BoxFuture;
use serde_json::{Map, Value};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	error::{BackendError, TransportError},
};

/// Document returned by the search backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
	/// Document key.
	pub id: String,
	/// Display title, empty when the index does not carry one.
	#[serde(default)]
	pub title: String,
	/// Document body, empty when not selected.
	#[serde(default)]
	pub content: String,
	/// Relevance score reported by the backend; absent for point lookups.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub score: Option<f64>,
	/// Remaining index fields.
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub fields: Map<String, Value>,
}
impl Document {
	/// Builds a document from a raw backend object.
	///
	/// Annotation fields (names starting with `@`) are dropped; `@search.score` becomes
	/// [`score`](Self::score).
	pub fn from_raw(mut raw: Map<String, Value>) -> Result<Self, BackendError> {
		let score = raw.get("@search.score").and_then(Value::as_f64);

		raw.retain(|key, _| !key.starts_with('@'));

		let id = match raw.remove("id") {
			Some(Value::String(id)) => id,
			Some(Value::Number(id)) => id.to_string(),
			_ =>
				return Err(BackendError::ResponseParse {
					message: "document is missing a string `id` field".into(),
				}),
		};
		let mut take_text = |key: &str| match raw.remove(key) {
			Some(Value::String(text)) => text,
			Some(Value::Null) | None => String::new(),
			Some(other) => other.to_string(),
		};
		let title = take_text("title");
		let content = take_text("content");

		Ok(Self { id, title, content, score, fields: raw })
	}
}

/// Backend outcome classes the dispatcher treats differently.
#[derive(Clone, Debug, ThisError)]
pub enum BackendFailure {
	/// Backend rejected the delegated credential itself.
	#[error("Search backend rejected the delegated credential.")]
	Unauthorized,
	/// Caller is not permitted to read the document.
	#[error("Search backend denied access to the document.")]
	Forbidden,
	/// Document does not exist.
	#[error("Search backend has no such document.")]
	NotFound,
	/// Any other failure.
	#[error(transparent)]
	Error(#[from] BackendError),
}
impl From<TransportError> for BackendFailure {
	fn from(e: TransportError) -> Self {
		Self::Error(e.into())
	}
}

/// Search service that applies its own permission filter from the delegated credential.
pub trait SearchBackend: Send + Sync {
	/// Largest `top` the backend accepts.
	fn max_top(&self) -> u32;

	/// Full-text search.
	fn search<'a>(
		&'a self,
		query: &'a str,
		top: u32,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Vec<Document>, BackendFailure>>;

	/// Point lookup by document key.
	fn get<'a>(
		&'a self,
		id: &'a str,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Document, BackendFailure>>;

	/// Suggestions for a partial query.
	fn suggest<'a>(
		&'a self,
		query: &'a str,
		top: u32,
		credential: &'a TokenSecret,
	) -> BoxFuture<'a, Result<Vec<Document>, BackendFailure>>;
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	fn object(value: Value) -> Map<String, Value> {
		match value {
			Value::Object(map) => map,
			_ => panic!("Fixture should be a JSON object."),
		}
	}

	#[test]
	fn annotations_are_stripped_and_score_lifted() {
		let doc = Document::from_raw(object(json!({
			"@search.score": 1.5,
			"@search.highlights": {"content": ["x"]},
			"id": "doc-1",
			"title": "Travel policy",
			"content": "Book economy.",
			"department": "hr"
		})))
		.expect("Document fixture should convert.");

		assert_eq!(doc.id, "doc-1");
		assert_eq!(doc.title, "Travel policy");
		assert_eq!(doc.score, Some(1.5));
		assert_eq!(doc.fields.len(), 1);
		assert_eq!(doc.fields.get("department"), Some(&json!("hr")));
	}

	#[test]
	fn missing_title_and_content_default_to_empty() {
		let doc = Document::from_raw(object(json!({ "@search.text": "pol", "id": 7 })))
			.expect("Numeric ids should convert.");

		assert_eq!(doc.id, "7");
		assert!(doc.title.is_empty() && doc.content.is_empty());
		assert_eq!(doc.score, None);
	}

	#[test]
	fn documents_without_ids_are_rejected() {
		let err = Document::from_raw(object(json!({ "title": "orphan" })))
			.expect_err("Documents need an id.");

		assert!(matches!(err, BackendError::ResponseParse { .. }));
	}
}
