/// `GET /v1/models/{model}` returns the model object directly.
pub use crate::openai::get_model::types::Model as GetModelResponse;
