//! Seed data for the providers table on first boot.
//!
//! This deployment fronts exactly one upstream, so there is exactly one seed: unlike the
//! multi-provider predecessor this crate was derived from, there is no provider-selection
//! menu to populate.

use qproxy_provider_core::config::{AntigravityConfig, ProviderConfig};

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: String,
    pub enabled: bool,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    let config = ProviderConfig::Antigravity(AntigravityConfig::default());
    let config_json =
        serde_json::to_string(&config).expect("ProviderConfig::Antigravity always serializes");
    vec![BuiltinProviderSeed {
        name: "antigravity",
        config_json,
        enabled: true,
    }]
}
