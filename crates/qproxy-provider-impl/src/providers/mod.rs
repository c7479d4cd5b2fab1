pub mod antigravity;
pub mod http_client;
mod oauth_common;

pub use antigravity::AntigravityProvider;
