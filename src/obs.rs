//! Observability helpers for the request pipeline.
//!
//! # Feature Flags
//!
//! - Enable `tracing` (on by default) to emit spans named `obo_broker.stage` with the `stage`
//!   and `op` (call site) fields, plus debug/warn events for cache and retry decisions.
//! - Enable `metrics` to increment the `obo_broker_stage_total` counter for every
//!   attempt/success/failure, labeled by `stage` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Pipeline stages observed by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
	/// Inbound bearer verification.
	Verify,
	/// Signing key-set refresh.
	KeyRefresh,
	/// On-behalf-of exchange against the token endpoint.
	Exchange,
	/// `search_documents` backend call.
	Search,
	/// `get_document` backend call.
	Get,
	/// `suggest` backend call.
	Suggest,
	/// `user_info` lookup.
	UserInfo,
}
impl Stage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Stage::Verify => "verify",
			Stage::KeyRefresh => "key_refresh",
			Stage::Exchange => "exchange",
			Stage::Search => "search",
			Stage::Get => "get",
			Stage::Suggest => "suggest",
			Stage::UserInfo => "user_info",
		}
	}
}
impl Display for Stage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageOutcome {
	/// Entry to a stage.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl StageOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			StageOutcome::Attempt => "attempt",
			StageOutcome::Success => "success",
			StageOutcome::Failure => "failure",
		}
	}
}
impl Display for StageOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Runs `fut` inside a [`StageSpan`] and records attempt plus success/failure outcomes.
pub(crate) async fn observe<T, E, Fut>(stage: Stage, op: &'static str, fut: Fut) -> Result<T, E>
where
	Fut: Future<Output = Result<T, E>>,
{
	let span = StageSpan::new(stage, op);

	record_stage_outcome(stage, StageOutcome::Attempt);

	let result = span.instrument(fut).await;

	match &result {
		Ok(_) => record_stage_outcome(stage, StageOutcome::Success),
		Err(_) => record_stage_outcome(stage, StageOutcome::Failure),
	}

	result
}
