pub mod count_tokens;
pub mod generate_content;
pub mod get_model;
pub mod list_models;
pub mod middleware;
pub mod prefill;
pub mod safety;
pub mod signature_cache;
pub mod stream2nostream;
pub mod tool_output;

pub use signature_cache::{SignatureCache, SignatureCacheConfig};
