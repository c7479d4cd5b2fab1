use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "signature_cache")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "signature_cache_kind_tool_call")]
    pub kind: String,
    #[sea_orm(unique_key = "signature_cache_kind_tool_call")]
    pub tool_call_id: String,
    pub signature: String,
    pub thought_text: Option<String>,
    pub saved_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
