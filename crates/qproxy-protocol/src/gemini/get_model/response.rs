/// `GET /v1beta/models/{model}` returns the model object directly.
pub use crate::gemini::get_model::types::Model as GetModelResponse;
