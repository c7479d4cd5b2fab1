use std::sync::Arc;

use qproxy_provider_core::registry::ProviderRegistry;

use crate::providers::AntigravityProvider;

/// Registers every built-in `UpstreamProvider` this crate ships. Single-upstream
/// deployment, so this is one registration rather than a provider menu.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(AntigravityProvider::new()));
}
