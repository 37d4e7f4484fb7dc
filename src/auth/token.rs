//! Credential models: redacted secrets and cached outbound credentials.

pub mod credential;
pub mod secret;
