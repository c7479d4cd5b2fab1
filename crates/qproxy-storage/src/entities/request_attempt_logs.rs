use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_attempt_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub credential_id: Option<i64>,
    pub model: String,
    pub attempt_no: i32,
    pub account_attempt: i32,
    pub same_retry: bool,
    pub status: String,
    pub latency_ms: i64,
    pub error_message: Option<String>,
    pub started_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
