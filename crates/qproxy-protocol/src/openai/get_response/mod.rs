pub mod request;
pub mod response;

pub use request::{GetResponsePath, GetResponseQuery, GetResponseRequest, GetResponseStream};
pub use response::GetResponseResponse;
