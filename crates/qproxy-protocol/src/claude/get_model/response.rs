/// `GET /v1/models/{model_id}` returns the model object directly.
pub use crate::claude::get_model::types::ModelInfo as GetModelResponse;
