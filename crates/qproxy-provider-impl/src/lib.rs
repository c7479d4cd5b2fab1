//! Built-in upstream provider implementations.
//!
//! This crate does not perform network IO for the request/response path —
//! providers build `UpstreamHttpRequest` values and a higher layer sends them.
//! The one exception is `antigravity::camouflage`: background chatter that
//! never flows through the request/response cycle, so it owns its own
//! `wreq::Client` instances the same way `providers::http_client` does.

mod auth_extractor;
mod builtin;
mod providers;
mod registry;

pub use builtin::{BuiltinProviderSeed, builtin_provider_seeds};
pub use providers::antigravity::camouflage;
pub use providers::antigravity::{ANTIGRAVITY_USER_AGENT, DEFAULT_BASE_URL as ANTIGRAVITY_DEFAULT_BASE_URL};
pub use registry::register_builtin_providers;
