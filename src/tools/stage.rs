//! Per-request lifecycle of a tool invocation.

// self
use crate::_prelude::*;

/// Stages a tool invocation moves through.
///
/// Transitions only move forward, and `Failed` is reachable from every non-terminal stage.
/// Tools that never reach the backend (such as `user_info`) skip straight from
/// [`Verified`](Self::Verified) to [`Completed`](Self::Completed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
	/// Call accepted, nothing checked yet.
	Received,
	/// Caller identity is established.
	Verified,
	/// Outbound credential obtained from the exchange cache.
	CredentialObtained,
	/// Backend request issued.
	BackendCalled,
	/// Result delivered.
	Completed,
	/// Early exit with an error.
	Failed,
}
impl RequestStage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Received => "received",
			Self::Verified => "verified",
			Self::CredentialObtained => "credential_obtained",
			Self::BackendCalled => "backend_called",
			Self::Completed => "completed",
			Self::Failed => "failed",
		}
	}

	/// Returns `true` for [`Completed`](Self::Completed) and [`Failed`](Self::Failed).
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}

	/// Returns `true` when moving from `self` to `next` is allowed.
	pub fn can_transition_to(self, next: Self) -> bool {
		!self.is_terminal() && (next == Self::Failed || next > self)
	}
}
impl Display for RequestStage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Tracks one invocation's stage and logs each transition.
#[derive(Debug)]
pub(crate) struct StageTracker {
	#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
	tool: &'static str,
	stage: RequestStage,
}
impl StageTracker {
	pub(crate) fn new(tool: &'static str) -> Self {
		Self { tool, stage: RequestStage::Received }
	}

	#[cfg(test)]
	pub(crate) fn stage(&self) -> RequestStage {
		self.stage
	}

	pub(crate) fn advance(&mut self, next: RequestStage) {
		debug_assert!(
			self.stage.can_transition_to(next),
			"illegal stage transition {} -> {next}",
			self.stage
		);

		#[cfg(feature = "tracing")]
		tracing::debug!(tool = self.tool, from = %self.stage, to = %next, "tool stage");

		self.stage = next;
	}

	/// Records the outcome: `Completed` on success, `Failed` otherwise.
	pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
		match &result {
			Ok(_) => self.advance(RequestStage::Completed),
			Err(_err) => {
				#[cfg(feature = "tracing")]
				tracing::debug!(
					tool = self.tool,
					stage = %self.stage,
					kind = %_err.kind(),
					"tool failed"
				);

				self.advance(RequestStage::Failed);
			},
		}

		result
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::AuthenticationError;

	#[test]
	fn transitions_move_forward_or_fail() {
		assert!(RequestStage::Received.can_transition_to(RequestStage::Verified));
		assert!(RequestStage::Verified.can_transition_to(RequestStage::Completed));
		assert!(RequestStage::BackendCalled.can_transition_to(RequestStage::Failed));
		assert!(!RequestStage::BackendCalled.can_transition_to(RequestStage::Verified));
		assert!(!RequestStage::Completed.can_transition_to(RequestStage::Failed));
		assert!(!RequestStage::Failed.can_transition_to(RequestStage::Completed));
	}

	#[test]
	fn finish_marks_the_terminal_stage() {
		let mut ok = StageTracker::new("search_documents");

		ok.advance(RequestStage::Verified);

		assert_eq!(ok.finish(Ok(3)).expect("Success should pass through."), 3);
		assert_eq!(ok.stage(), RequestStage::Completed);

		let mut failed = StageTracker::new("get_document");
		let result: Result<()> = failed.finish(Err(AuthenticationError::MissingContext.into()));

		assert!(result.is_err());
		assert_eq!(failed.stage(), RequestStage::Failed);
	}
}
