/// OpenAI's `GET /v1/models` takes no query parameters or body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListModelsRequest;
