mod common;

// std
use std::sync::Arc;
// crates.io
use httpmock::prelude::*;
use serde_json::json;
// self
use obo_broker::{
	auth::ScopeSet,
	cache::{CachePolicy, CredentialRequest, ExchangeCache, ExchangeKey},
	error::ErrorKind,
	exchange::{ReqwestExchangeClient, RetryPolicy},
	http::ReqwestHttpClient,
	provider::AzureAdStrategy,
	transport::ReqwestTransportErrorMapper,
};

fn cache(server: &MockServer) -> ExchangeCache {
	let client = ReqwestExchangeClient::with_http_client(
		common::descriptor(server),
		Arc::new(AzureAdStrategy),
		common::CLIENT_ID,
		common::CLIENT_SECRET,
		ReqwestHttpClient::default(),
		Arc::new(ReqwestTransportErrorMapper),
	)
	.with_retry_policy(RetryPolicy::none());

	ExchangeCache::new(Arc::new(client), CachePolicy::default())
}

fn scope() -> ScopeSet {
	common::SEARCH_SCOPE.parse().expect("Search scope fixture should parse.")
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200)
				.header("content-type", "application/json")
				.delay(std::time::Duration::from_millis(100))
				.json_body(common::token_body("obo-U1", 3_600));
		})
		.await;
	let cache = cache(&server);
	let identity = common::identity("U1").await;
	let scope = scope();
	let request = CredentialRequest::new(&identity, &scope);
	let (a, b, c, d) = tokio::join!(
		cache.get_or_exchange(request),
		cache.get_or_exchange(request),
		cache.get_or_exchange(request),
		cache.get_or_exchange(request),
	);

	mock.assert_calls_async(1).await;

	for outcome in [a, b, c, d] {
		let credential = outcome.expect("Every waiter should receive the shared credential.");

		assert_eq!(credential.credential.expose(), "obo-U1");
	}

	assert_eq!(cache.metrics().exchanges(), 1);
	assert_eq!(cache.metrics().coalesced(), 3);
	assert_eq!(cache.len(), 1);
	assert!(cache.in_flight(&ExchangeKey::new(&identity, &scope)).is_none());

	let again = cache.get_or_exchange(request).await.expect("Cached credential should be reused.");

	assert_eq!(again.credential.expose(), "obo-U1");
	assert_eq!(cache.metrics().hits(), 1);
	mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn users_never_share_credentials() {
	let server = MockServer::start_async().await;
	let u1 = common::identity("U1").await;
	let u2 = common::identity("U2").await;
	let first = server
		.mock_async(|when, then| {
			when.method(POST).path("/token").form_urlencoded_tuple("assertion", u1.token.expose());
			then.status(200)
				.header("content-type", "application/json")
				.json_body(common::token_body("obo-U1", 3_600));
		})
		.await;
	let second = server
		.mock_async(|when, then| {
			when.method(POST).path("/token").form_urlencoded_tuple("assertion", u2.token.expose());
			then.status(200)
				.header("content-type", "application/json")
				.json_body(common::token_body("obo-U2", 3_600));
		})
		.await;
	let cache = cache(&server);
	let scope = scope();
	let (one, two) = tokio::join!(
		cache.get_or_exchange(CredentialRequest::new(&u1, &scope)),
		cache.get_or_exchange(CredentialRequest::new(&u2, &scope)),
	);

	first.assert_calls_async(1).await;
	second.assert_calls_async(1).await;

	assert_eq!(one.expect("U1 exchange should succeed.").credential.expose(), "obo-U1");
	assert_eq!(two.expect("U2 exchange should succeed.").credential.expose(), "obo-U2");
	assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn failed_exchanges_are_shared_but_not_cached() {
	let server = MockServer::start_async().await;
	let consent = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(400)
				.header("content-type", "application/json")
				.delay(std::time::Duration::from_millis(50))
				.json_body(json!({ "error": "invalid_grant", "error_codes": [65001] }));
		})
		.await;
	let cache = cache(&server);
	let identity = common::identity("U1").await;
	let scope = scope();
	let request = CredentialRequest::new(&identity, &scope);
	let (a, b) = tokio::join!(cache.get_or_exchange(request), cache.get_or_exchange(request));

	consent.assert_calls_async(1).await;

	for outcome in [a, b] {
		let err = outcome.expect_err("Both waiters should observe the consent failure.");

		assert_eq!(err.kind(), ErrorKind::ConsentRequired);
	}

	assert!(cache.is_empty());
	assert_eq!(cache.metrics().failures(), 1);

	consent.delete_async().await;

	let granted = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(common::token_body("obo-after-consent", 3_600));
		})
		.await;
	let credential =
		cache.get_or_exchange(request).await.expect("Exchange should succeed after consent.");

	granted.assert_calls_async(1).await;

	assert_eq!(credential.credential.expose(), "obo-after-consent");
}

#[tokio::test]
async fn replacing_a_rejected_credential_exchanges_again() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(common::token_body("obo-U1", 3_600));
		})
		.await;
	let cache = cache(&server);
	let identity = common::identity("U1").await;
	let scope = scope();
	let request = CredentialRequest::new(&identity, &scope);
	let rejected = cache.get_or_exchange(request).await.expect("First exchange should succeed.");
	let replacement = cache
		.get_or_exchange(request.replacing(&rejected))
		.await
		.expect("Forced exchange should succeed.");

	mock.assert_calls_async(2).await;

	assert_eq!(replacement.credential.expose(), "obo-U1");
	assert_eq!(cache.metrics().exchanges(), 2);
	assert_eq!(cache.len(), 1);
}
