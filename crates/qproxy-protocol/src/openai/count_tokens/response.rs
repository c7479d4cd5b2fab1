pub use crate::openai::count_tokens::types::InputTokenCount as InputTokenCountResponse;
