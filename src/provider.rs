//! Identity-provider descriptors (data) and strategies (behavior).
//!
//! `descriptor` exposes validated metadata ([`IdentityProviderDescriptor`]) covering the
//! trusted issuer, the HTTPS-only token and key-set endpoints, and the client authentication
//! preference used during the on-behalf-of exchange.
//! `strategy` defines [`ProviderStrategy`], an HTTP-client-agnostic hook used by the exchange
//! client to decorate outgoing requests and classify token-endpoint failures.

pub mod descriptor;
pub mod strategy;

pub use descriptor::*;
pub use strategy::*;
