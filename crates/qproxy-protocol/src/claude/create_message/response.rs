/// `POST /v1/messages` returns the created message object directly.
pub use crate::claude::create_message::types::BetaMessage as CreateMessageResponse;
