use crate::openai::list_response_items::types::ResponseItemList;

/// `GET /v1/responses/{response_id}/input_items` returns the same paginated
/// list-object shape as listing a response's output items.
pub type ListInputItemsResponse = ResponseItemList;
