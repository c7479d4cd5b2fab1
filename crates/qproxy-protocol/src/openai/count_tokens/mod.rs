pub mod request;
pub mod response;
pub mod types;

pub use request::*;
pub use response::InputTokenCountResponse;
pub use types::*;
