/// `:streamGenerateContent` emits a series of chunks shaped exactly like the
/// unary `GenerateContentResponse`.
pub use crate::gemini::generate_content::response::GenerateContentResponse as StreamGenerateContentResponse;
