use std::time::SystemTime;

use async_trait::async_trait;
use sea_orm::sea_query::{Index, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use time::OffsetDateTime;

use qproxy_common::GlobalConfig;
use qproxy_provider_core::{Event, OperationalEvent};

use crate::entities;
use crate::snapshot::{
    CredentialRow, GlobalConfigRow, ProviderRow, StorageSnapshot, UserKeyRow, UserRow,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone)]
pub struct LogQueryFilter {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub kind: Option<LogRecordKind>,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub trace_id: Option<String>,
    pub operation: Option<String>,
    pub request_path_contains: Option<String>,
    pub status_min: Option<i32>,
    pub status_max: Option<i32>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: i64,
    pub kind: LogRecordKind,
    pub at: OffsetDateTime,
    pub trace_id: Option<String>,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub attempt_no: Option<i32>,
    pub operation: Option<String>,
    pub request_method: String,
    pub request_path: String,
    pub response_status: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogQueryResult {
    pub rows: Vec<LogRecord>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct UsageAggregateFilter {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub model: Option<String>,
    pub model_contains: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageAggregate {
    pub matched_rows: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub total_tokens: i64,
}

/// Storage is used for bootstrap (load_snapshot), admin mutations, and event
/// persistence (append_event). Runtime request handling reads from the
/// in-memory snapshot held by `AppState`, never from here directly.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn sync(&self) -> StorageResult<()>;

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>>;
    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    async fn provider_names(&self) -> StorageResult<Vec<String>>;
    async fn upsert_provider(
        &self,
        name: &str,
        config_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64>;
    async fn delete_provider(&self, name: &str) -> StorageResult<()>;

    async fn insert_credential(
        &self,
        provider_name: &str,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64>;
    async fn update_credential(
        &self,
        credential_id: i64,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
    ) -> StorageResult<()>;
    async fn set_credential_enabled(&self, credential_id: i64, enabled: bool) -> StorageResult<()>;
    async fn delete_credential(&self, credential_id: i64) -> StorageResult<()>;

    async fn upsert_user_by_id(&self, user_id: i64, name: &str, enabled: bool) -> StorageResult<()>;
    async fn set_user_enabled(&self, user_id: i64, enabled: bool) -> StorageResult<()>;
    async fn delete_user(&self, user_id: i64) -> StorageResult<()>;

    async fn insert_user_key(
        &self,
        user_id: i64,
        api_key: &str,
        label: Option<&str>,
        enabled: bool,
    ) -> StorageResult<i64>;
    async fn set_user_key_enabled(&self, user_key_id: i64, enabled: bool) -> StorageResult<()>;
    async fn update_user_key_label(
        &self,
        user_key_id: i64,
        label: Option<&str>,
    ) -> StorageResult<()>;
    async fn delete_user_key(&self, user_key_id: i64) -> StorageResult<()>;

    /// Persists one telemetry event. Best-effort from the sink's point of view;
    /// returns an error so the sink can decide whether to log it.
    async fn append_event(&self, event: &Event) -> StorageResult<()>;

    async fn aggregate_usage_tokens(
        &self,
        filter: UsageAggregateFilter,
    ) -> StorageResult<UsageAggregate>;
    async fn query_logs(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_request_attempt_log(
        &self,
        request_id: &str,
        credential_id: Option<i64>,
        model: &str,
        attempt_no: i32,
        account_attempt: i32,
        same_retry: bool,
        status: &str,
        latency_ms: i64,
        error_message: Option<String>,
        started_at: OffsetDateTime,
    ) -> StorageResult<()>;
}

#[derive(Debug, FromQueryResult)]
struct UsageAggregateRow {
    matched_rows: Option<i64>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_read_input_tokens: Option<i64>,
    cache_creation_input_tokens: Option<i64>,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn ensure_performance_indexes(&self) -> StorageResult<()> {
        use entities::downstream_requests::Column as DownstreamColumn;
        use entities::upstream_requests::Column as UpstreamColumn;
        use entities::upstream_usages::Column as UpstreamUsageColumn;

        let statements = vec![
            Index::create()
                .name("idx_upstream_requests_at_id")
                .table(entities::upstream_requests::Entity)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_provider_at_id")
                .table(entities::upstream_requests::Entity)
                .col(UpstreamColumn::Provider)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_credential_at_id")
                .table(entities::upstream_requests::Entity)
                .col(UpstreamColumn::CredentialId)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_user_at_id")
                .table(entities::upstream_requests::Entity)
                .col(UpstreamColumn::UserId)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_trace_at_id")
                .table(entities::upstream_requests::Entity)
                .col(UpstreamColumn::TraceId)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_downstream_requests_at_id")
                .table(entities::downstream_requests::Entity)
                .col(DownstreamColumn::At)
                .col(DownstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_downstream_requests_trace_at_id")
                .table(entities::downstream_requests::Entity)
                .col(DownstreamColumn::TraceId)
                .col(DownstreamColumn::At)
                .col(DownstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_usages_at")
                .table(entities::upstream_usages::Entity)
                .col(UpstreamUsageColumn::At)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_usages_provider_at")
                .table(entities::upstream_usages::Entity)
                .col(UpstreamUsageColumn::Provider)
                .col(UpstreamUsageColumn::At)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_usages_model_at")
                .table(entities::upstream_usages::Entity)
                .col(UpstreamUsageColumn::Model)
                .col(UpstreamUsageColumn::At)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    /// §3 AccountModelQuota upsert: `(credential_id, model)` is unique. A missing row
    /// means "unknown", never phantom-full.
    pub async fn upsert_account_model_quota(
        &self,
        credential_id: i64,
        model: &str,
        quota_remaining: f64,
        quota_reset_time: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        use entities::account_model_quotas::Column;

        let now = OffsetDateTime::now_utc();
        let active = entities::account_model_quotas::ActiveModel {
            id: ActiveValue::NotSet,
            credential_id: ActiveValue::Set(credential_id),
            model: ActiveValue::Set(model.to_string()),
            quota_remaining: ActiveValue::Set(quota_remaining.clamp(0.0, 1.0)),
            quota_reset_time: ActiveValue::Set(quota_reset_time),
            updated_at: ActiveValue::Set(now),
        };

        entities::AccountModelQuotas::insert(active)
            .on_conflict(
                OnConflict::columns([Column::CredentialId, Column::Model])
                    .update_columns([
                        Column::QuotaRemaining,
                        Column::QuotaResetTime,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn get_account_model_quota(
        &self,
        credential_id: i64,
        model: &str,
    ) -> StorageResult<Option<entities::account_model_quotas::Model>> {
        use entities::account_model_quotas::Column;

        let row = entities::AccountModelQuotas::find()
            .filter(Column::CredentialId.eq(credential_id))
            .filter(Column::Model.eq(model))
            .one(&self.db)
            .await?;
        Ok(row)
    }

    /// §4.4 persisted signature-cache tier, mirroring the in-memory TTL map so a
    /// restart does not lose thought-signature replay state for in-flight tool calls.
    pub async fn upsert_signature_cache(
        &self,
        kind: &str,
        tool_call_id: &str,
        signature: &str,
        thought_text: Option<String>,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()> {
        use entities::signature_cache::Column;

        let now = OffsetDateTime::now_utc();
        let active = entities::signature_cache::ActiveModel {
            id: ActiveValue::NotSet,
            kind: ActiveValue::Set(kind.to_string()),
            tool_call_id: ActiveValue::Set(tool_call_id.to_string()),
            signature: ActiveValue::Set(signature.to_string()),
            thought_text: ActiveValue::Set(thought_text),
            saved_at: ActiveValue::Set(now),
            expires_at: ActiveValue::Set(expires_at),
        };

        entities::SignatureCacheRows::insert(active)
            .on_conflict(
                OnConflict::columns([Column::Kind, Column::ToolCallId])
                    .update_columns([
                        Column::Signature,
                        Column::ThoughtText,
                        Column::SavedAt,
                        Column::ExpiresAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn get_signature_cache(
        &self,
        kind: &str,
        tool_call_id: &str,
    ) -> StorageResult<Option<entities::signature_cache::Model>> {
        use entities::signature_cache::Column;

        let row = entities::SignatureCacheRows::find()
            .filter(Column::Kind.eq(kind))
            .filter(Column::ToolCallId.eq(tool_call_id))
            .one(&self.db)
            .await?;
        Ok(row)
    }

    pub async fn prune_signature_cache(&self, now: OffsetDateTime) -> StorageResult<u64> {
        use entities::signature_cache::Column;

        let result = entities::SignatureCacheRows::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// §4.2: attempt-log retention is a periodic delete, not a DB-level TTL.
    pub async fn prune_request_attempt_logs(&self, older_than: OffsetDateTime) -> StorageResult<u64> {
        use entities::request_attempt_logs::Column;

        let result = entities::RequestAttemptLogs::delete_many()
            .filter(Column::CreatedAt.lt(older_than))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn upsert_credential_disallow(
        &self,
        credential_id: i64,
        scope_kind: &str,
        scope_value: &str,
        level: &str,
        until_at: Option<OffsetDateTime>,
        reason: Option<&str>,
    ) -> StorageResult<()> {
        use entities::credential_disallow::Column;

        let now = OffsetDateTime::now_utc();
        let active = entities::credential_disallow::ActiveModel {
            id: ActiveValue::NotSet,
            credential_id: ActiveValue::Set(credential_id),
            scope_kind: ActiveValue::Set(scope_kind.to_string()),
            scope_value: ActiveValue::Set(Some(scope_value.to_string())),
            level: ActiveValue::Set(level.to_string()),
            until_at: ActiveValue::Set(until_at),
            reason: ActiveValue::Set(reason.map(str::to_string)),
            updated_at: ActiveValue::Set(now),
        };

        entities::CredentialDisallow::insert(active)
            .on_conflict(
                OnConflict::columns([Column::CredentialId, Column::ScopeKind, Column::ScopeValue])
                    .update_columns([Column::Level, Column::UntilAt, Column::Reason, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn list_credential_disallow(
        &self,
        credential_id: i64,
    ) -> StorageResult<Vec<entities::credential_disallow::Model>> {
        use entities::credential_disallow::Column;

        let rows = entities::CredentialDisallow::find()
            .filter(Column::CredentialId.eq(credential_id))
            .all(&self.db)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Providers)
            .register(entities::Credentials)
            .register(entities::Users)
            .register(entities::UserKeys)
            .register(entities::DownstreamRequests)
            .register(entities::UpstreamRequests)
            .register(entities::UpstreamUsages)
            .register(entities::AccountModelQuotas)
            .register(entities::CredentialDisallow)
            .register(entities::RequestAttemptLogs)
            .register(entities::SignatureCacheRows)
            .sync(&self.db)
            .await?;
        self.ensure_performance_indexes().await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        use entities::global_config::Column;

        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let config: GlobalConfig = serde_json::from_value(row.config_json)?;
        Ok(Some(GlobalConfigRow {
            id: row.id,
            config,
            updated_at: row.updated_at,
        }))
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()> {
        use entities::global_config::ActiveModel as GlobalActive;
        use entities::global_config::Column;

        let now = OffsetDateTime::now_utc();
        let id = 1_i64;
        let config_json = serde_json::to_value(config)?;
        let existing = entities::GlobalConfig::find_by_id(id).one(&self.db).await?;

        match existing {
            Some(model) => {
                let mut active: GlobalActive = model.into();
                active.config_json = ActiveValue::Set(config_json);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = GlobalActive {
                    id: ActiveValue::Set(id),
                    config_json: ActiveValue::Set(config_json),
                    updated_at: ActiveValue::Set(now),
                };
                entities::GlobalConfig::insert(active)
                    .on_conflict(
                        OnConflict::column(Column::Id)
                            .update_columns([Column::ConfigJson, Column::UpdatedAt])
                            .to_owned(),
                    )
                    .exec(&self.db)
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let global_config = self.load_global_config().await?;

        let providers = entities::Providers::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ProviderRow {
                id: m.id,
                name: m.name,
                config_json: m.config_json,
                enabled: m.enabled,
                updated_at: m.updated_at,
            })
            .collect();

        let credentials = entities::Credentials::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| CredentialRow {
                id: m.id,
                provider_id: m.provider_id,
                name: m.name,
                settings_json: m.settings.unwrap_or_else(|| serde_json::json!({})),
                secret_json: m.secret,
                enabled: m.enabled,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        let users = entities::Users::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| UserRow {
                id: m.id,
                name: m.name,
                enabled: m.enabled,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        let user_keys = entities::UserKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| UserKeyRow {
                id: m.id,
                user_id: m.user_id,
                api_key: m.api_key,
                label: m.label,
                enabled: m.enabled,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        Ok(StorageSnapshot {
            global_config,
            providers,
            credentials,
            users,
            user_keys,
        })
    }

    async fn provider_names(&self) -> StorageResult<Vec<String>> {
        let rows = entities::Providers::find().all(&self.db).await?;
        Ok(rows.into_iter().map(|m| m.name).collect())
    }

    async fn upsert_provider(
        &self,
        name: &str,
        config_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        use entities::providers::{ActiveModel as ProviderActive, Column};

        let now = OffsetDateTime::now_utc();
        let existing = entities::Providers::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;

        let id = match existing {
            Some(model) => {
                let mut active: ProviderActive = model.into();
                active.config_json = ActiveValue::Set(config_json.clone());
                active.enabled = ActiveValue::Set(enabled);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?.id
            }
            None => {
                let active = ProviderActive {
                    id: ActiveValue::NotSet,
                    name: ActiveValue::Set(name.to_string()),
                    config_json: ActiveValue::Set(config_json.clone()),
                    enabled: ActiveValue::Set(enabled),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Providers::insert(active)
                    .exec(&self.db)
                    .await?
                    .last_insert_id
            }
        };
        Ok(id)
    }

    async fn delete_provider(&self, name: &str) -> StorageResult<()> {
        use entities::providers::Column;

        let provider = entities::Providers::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;
        let Some(provider) = provider else {
            return Ok(());
        };
        entities::Providers::delete_by_id(provider.id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_credential(
        &self,
        provider_name: &str,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        use entities::credentials::ActiveModel as CredentialActive;
        use entities::providers::Column as ProviderColumn;

        let provider = entities::Providers::find()
            .filter(ProviderColumn::Name.eq(provider_name))
            .one(&self.db)
            .await?;
        let Some(provider) = provider else {
            return Err(StorageError::Db(sea_orm::DbErr::RecordNotFound(format!(
                "provider not found: {provider_name}"
            ))));
        };

        let now = OffsetDateTime::now_utc();
        let active = CredentialActive {
            id: ActiveValue::NotSet,
            provider_id: ActiveValue::Set(provider.id),
            name: ActiveValue::Set(name.map(str::to_string)),
            settings: ActiveValue::Set(Some(settings_json.clone())),
            secret: ActiveValue::Set(secret_json.clone()),
            enabled: ActiveValue::Set(enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = entities::Credentials::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn update_credential(
        &self,
        credential_id: i64,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::credentials::ActiveModel as CredentialActive;

        let Some(model) = entities::Credentials::find_by_id(credential_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };

        let now = OffsetDateTime::now_utc();
        let mut active: CredentialActive = model.into();
        active.name = ActiveValue::Set(name.map(str::to_string));
        active.settings = ActiveValue::Set(Some(settings_json.clone()));
        active.secret = ActiveValue::Set(secret_json.clone());
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_credential_enabled(&self, credential_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::credentials::ActiveModel as CredentialActive;

        let Some(model) = entities::Credentials::find_by_id(credential_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: CredentialActive = model.into();
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_credential(&self, credential_id: i64) -> StorageResult<()> {
        entities::Credentials::delete_by_id(credential_id)
            .exec(&self.db)
            .await?;
        self.clear_request_attempt_log_credential(credential_id)
            .await?;
        Ok(())
    }

    async fn upsert_user_by_id(&self, user_id: i64, name: &str, enabled: bool) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let now = OffsetDateTime::now_utc();
        let existing = entities::Users::find_by_id(user_id).one(&self.db).await?;

        match existing {
            Some(model) => {
                let mut active: UserActive = model.into();
                active.name = ActiveValue::Set(name.to_string());
                active.enabled = ActiveValue::Set(enabled);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = UserActive {
                    id: ActiveValue::Set(user_id),
                    name: ActiveValue::Set(name.to_string()),
                    enabled: ActiveValue::Set(enabled),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Users::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn set_user_enabled(&self, user_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let Some(model) = entities::Users::find_by_id(user_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: UserActive = model.into();
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> StorageResult<()> {
        entities::Users::delete_by_id(user_id).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_user_key(
        &self,
        user_id: i64,
        api_key: &str,
        label: Option<&str>,
        enabled: bool,
    ) -> StorageResult<i64> {
        use entities::user_keys::ActiveModel as UserKeyActive;

        let now = OffsetDateTime::now_utc();
        let active = UserKeyActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            api_key: ActiveValue::Set(api_key.to_string()),
            label: ActiveValue::Set(label.map(str::to_string)),
            enabled: ActiveValue::Set(enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = entities::UserKeys::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn set_user_key_enabled(&self, user_key_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::user_keys::ActiveModel as UserKeyActive;

        let Some(model) = entities::UserKeys::find_by_id(user_key_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: UserKeyActive = model.into();
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn update_user_key_label(
        &self,
        user_key_id: i64,
        label: Option<&str>,
    ) -> StorageResult<()> {
        use entities::user_keys::ActiveModel as UserKeyActive;

        let Some(model) = entities::UserKeys::find_by_id(user_key_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: UserKeyActive = model.into();
        active.label = ActiveValue::Set(label.map(str::to_string));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_user_key(&self, user_key_id: i64) -> StorageResult<()> {
        entities::UserKeys::delete_by_id(user_key_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn append_event(&self, event: &Event) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        match event {
            Event::Downstream(ev) => {
                use entities::downstream_requests::ActiveModel as DownstreamActive;

                let active = DownstreamActive {
                    id: ActiveValue::NotSet,
                    trace_id: ActiveValue::Set(ev.trace_id.clone()),
                    at: ActiveValue::Set(system_time_to_offset(ev.at)),
                    user_id: ActiveValue::Set(ev.user_id),
                    user_key_id: ActiveValue::Set(ev.user_key_id),
                    request_method: ActiveValue::Set(ev.request_method.clone()),
                    request_headers_json: ActiveValue::Set(serde_json::to_value(
                        &ev.request_headers,
                    )?),
                    request_path: ActiveValue::Set(ev.request_path.clone()),
                    request_query: ActiveValue::Set(ev.request_query.clone()),
                    request_body: ActiveValue::Set(ev.request_body.clone()),
                    response_status: ActiveValue::Set(ev.response_status.map(i32::from)),
                    response_headers_json: ActiveValue::Set(serde_json::to_value(
                        &ev.response_headers,
                    )?),
                    response_body: ActiveValue::Set(ev.response_body.clone()),
                    created_at: ActiveValue::Set(now),
                };
                entities::DownstreamRequests::insert(active)
                    .exec(&self.db)
                    .await?;
            }
            Event::Upstream(ev) => {
                use entities::upstream_requests::ActiveModel as UpstreamActive;
                use entities::upstream_usages::ActiveModel as UpstreamUsageActive;

                let active = UpstreamActive {
                    id: ActiveValue::NotSet,
                    trace_id: ActiveValue::Set(ev.trace_id.clone()),
                    at: ActiveValue::Set(system_time_to_offset(ev.at)),
                    user_id: ActiveValue::Set(ev.user_id),
                    user_key_id: ActiveValue::Set(ev.user_key_id),
                    provider: ActiveValue::Set(ev.provider.clone()),
                    credential_id: ActiveValue::Set(ev.credential_id),
                    internal: ActiveValue::Set(ev.internal),
                    attempt_no: ActiveValue::Set(i32::try_from(ev.attempt_no).unwrap_or(i32::MAX)),
                    operation: ActiveValue::Set(ev.operation.clone()),
                    request_method: ActiveValue::Set(ev.request_method.clone()),
                    request_headers_json: ActiveValue::Set(serde_json::to_value(
                        &ev.request_headers,
                    )?),
                    request_path: ActiveValue::Set(ev.request_path.clone()),
                    request_query: ActiveValue::Set(ev.request_query.clone()),
                    request_body: ActiveValue::Set(ev.request_body.clone()),
                    response_status: ActiveValue::Set(ev.response_status.map(i32::from)),
                    response_headers_json: ActiveValue::Set(serde_json::to_value(
                        &ev.response_headers,
                    )?),
                    response_body: ActiveValue::Set(ev.response_body.clone()),
                    error_kind: ActiveValue::Set(ev.error_kind.clone()),
                    error_message: ActiveValue::Set(ev.error_message.clone()),
                    transport_kind: ActiveValue::Set(ev.transport_kind.map(|k| format!("{k:?}"))),
                    created_at: ActiveValue::Set(now),
                };
                let inserted = entities::UpstreamRequests::insert(active)
                    .exec(&self.db)
                    .await?;

                if let Some(usage) = &ev.usage {
                    let model = extract_model_for_usage(
                        &ev.request_path,
                        ev.request_body.as_deref(),
                    );
                    let usage_active = UpstreamUsageActive {
                        id: ActiveValue::NotSet,
                        upstream_request_id: ActiveValue::Set(inserted.last_insert_id),
                        trace_id: ActiveValue::Set(ev.trace_id.clone()),
                        at: ActiveValue::Set(system_time_to_offset(ev.at)),
                        user_id: ActiveValue::Set(ev.user_id),
                        user_key_id: ActiveValue::Set(ev.user_key_id),
                        provider: ActiveValue::Set(ev.provider.clone()),
                        credential_id: ActiveValue::Set(ev.credential_id),
                        internal: ActiveValue::Set(ev.internal),
                        attempt_no: ActiveValue::Set(
                            i32::try_from(ev.attempt_no).unwrap_or(i32::MAX),
                        ),
                        operation: ActiveValue::Set(ev.operation.clone()),
                        model: ActiveValue::Set(model),
                        input_tokens: ActiveValue::Set(usage.input_tokens.map(i64::from)),
                        output_tokens: ActiveValue::Set(usage.output_tokens.map(i64::from)),
                        cache_read_input_tokens: ActiveValue::Set(
                            usage.cache_read_input_tokens.map(i64::from),
                        ),
                        cache_creation_input_tokens: ActiveValue::Set(
                            usage.cache_creation_input_tokens.map(i64::from),
                        ),
                        created_at: ActiveValue::Set(now),
                    };
                    entities::UpstreamUsages::insert(usage_active)
                        .exec(&self.db)
                        .await?;
                }
            }
            Event::Operational(ev) => {
                use entities::internal_events::ActiveModel as InternalEventActive;

                let event_type = match ev {
                    OperationalEvent::UnavailableStart(_) => "unavailable_start",
                    OperationalEvent::UnavailableEnd(_) => "unavailable_end",
                    OperationalEvent::ModelUnavailableStart(_) => "model_unavailable_start",
                    OperationalEvent::ModelUnavailableEnd(_) => "model_unavailable_end",
                };
                let active = InternalEventActive {
                    id: ActiveValue::NotSet,
                    event_type: ActiveValue::Set(event_type.to_string()),
                    payload_json: ActiveValue::Set(serde_json::to_value(ev)?),
                    at: ActiveValue::Set(system_time_to_offset(extract_operational_at(ev))),
                    created_at: ActiveValue::Set(now),
                };
                entities::InternalEvents::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn aggregate_usage_tokens(
        &self,
        filter: UsageAggregateFilter,
    ) -> StorageResult<UsageAggregate> {
        use entities::upstream_usages::Column;

        let mut query = entities::UpstreamUsages::find()
            .select_only()
            .column_as(Column::Id.count(), "matched_rows")
            .column_as(Column::InputTokens.sum(), "input_tokens")
            .column_as(Column::OutputTokens.sum(), "output_tokens")
            .column_as(Column::CacheReadInputTokens.sum(), "cache_read_input_tokens")
            .column_as(
                Column::CacheCreationInputTokens.sum(),
                "cache_creation_input_tokens",
            )
            .filter(Column::At.gte(filter.from))
            .filter(Column::At.lte(filter.to));

        if let Some(provider) = filter.provider.as_deref() {
            query = query.filter(Column::Provider.eq(provider));
        }
        if let Some(credential_id) = filter.credential_id {
            query = query.filter(Column::CredentialId.eq(credential_id));
        }
        if let Some(model) = filter.model.as_deref() {
            query = query.filter(Column::Model.eq(model));
        }
        if let Some(model_contains) = filter.model_contains.as_deref() {
            query = query.filter(Column::Model.contains(model_contains));
        }

        let Some(row) = query
            .into_model::<UsageAggregateRow>()
            .one(&self.db)
            .await?
        else {
            return Ok(UsageAggregate::default());
        };

        let input_tokens = row.input_tokens.unwrap_or(0);
        let output_tokens = row.output_tokens.unwrap_or(0);
        let cache_read_input_tokens = row.cache_read_input_tokens.unwrap_or(0);
        let cache_creation_input_tokens = row.cache_creation_input_tokens.unwrap_or(0);

        Ok(UsageAggregate {
            matched_rows: row.matched_rows.unwrap_or(0),
            input_tokens,
            output_tokens,
            cache_read_input_tokens,
            cache_creation_input_tokens,
            total_tokens: input_tokens + output_tokens + cache_read_input_tokens
                + cache_creation_input_tokens,
        })
    }

    async fn query_logs(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult> {
        if filter.limit == 0 {
            return Ok(LogQueryResult {
                rows: Vec::new(),
                has_more: false,
            });
        }

        let query_upstream = filter.kind != Some(LogRecordKind::Downstream);
        let query_downstream = match filter.kind {
            Some(LogRecordKind::Upstream) => false,
            Some(LogRecordKind::Downstream) => true,
            None => {
                filter.provider.is_none()
                    && filter.credential_id.is_none()
                    && filter.operation.is_none()
            }
        };

        let mut rows: Vec<LogRecord> = Vec::new();

        if query_upstream {
            use entities::upstream_requests::Column;

            let mut q = entities::UpstreamRequests::find()
                .filter(Column::At.gte(filter.from))
                .filter(Column::At.lte(filter.to));
            if let Some(provider) = filter.provider.as_deref() {
                q = q.filter(Column::Provider.eq(provider));
            }
            if let Some(credential_id) = filter.credential_id {
                q = q.filter(Column::CredentialId.eq(credential_id));
            }
            if let Some(user_id) = filter.user_id {
                q = q.filter(Column::UserId.eq(user_id));
            }
            if let Some(user_key_id) = filter.user_key_id {
                q = q.filter(Column::UserKeyId.eq(user_key_id));
            }
            if let Some(trace_id) = filter.trace_id.as_deref() {
                q = q.filter(Column::TraceId.eq(trace_id));
            }
            if let Some(operation) = filter.operation.as_deref() {
                q = q.filter(Column::Operation.eq(operation));
            }
            if let Some(path) = filter.request_path_contains.as_deref() {
                q = q.filter(Column::RequestPath.contains(path));
            }
            if let Some(min) = filter.status_min {
                q = q.filter(Column::ResponseStatus.gte(min));
            }
            if let Some(max) = filter.status_max {
                q = q.filter(Column::ResponseStatus.lte(max));
            }

            let found = q.order_by_desc(Column::At).order_by_desc(Column::Id).all(&self.db).await?;
            rows.extend(found.into_iter().map(|row| LogRecord {
                id: row.id,
                kind: LogRecordKind::Upstream,
                at: row.at,
                trace_id: row.trace_id,
                provider: Some(row.provider),
                credential_id: row.credential_id,
                user_id: row.user_id,
                user_key_id: row.user_key_id,
                attempt_no: Some(row.attempt_no),
                operation: Some(row.operation),
                request_method: row.request_method,
                request_path: row.request_path,
                response_status: row.response_status,
                error_kind: row.error_kind,
                error_message: row.error_message,
            }));
        }

        if query_downstream {
            use entities::downstream_requests::Column;

            let mut q = entities::DownstreamRequests::find()
                .filter(Column::At.gte(filter.from))
                .filter(Column::At.lte(filter.to));
            if let Some(user_id) = filter.user_id {
                q = q.filter(Column::UserId.eq(user_id));
            }
            if let Some(user_key_id) = filter.user_key_id {
                q = q.filter(Column::UserKeyId.eq(user_key_id));
            }
            if let Some(trace_id) = filter.trace_id.as_deref() {
                q = q.filter(Column::TraceId.eq(trace_id));
            }
            if let Some(path) = filter.request_path_contains.as_deref() {
                q = q.filter(Column::RequestPath.contains(path));
            }
            if let Some(min) = filter.status_min {
                q = q.filter(Column::ResponseStatus.gte(min));
            }
            if let Some(max) = filter.status_max {
                q = q.filter(Column::ResponseStatus.lte(max));
            }

            let found = q.order_by_desc(Column::At).order_by_desc(Column::Id).all(&self.db).await?;
            rows.extend(found.into_iter().map(|row| {
                let (provider, operation) =
                    derive_downstream_observability(&row.request_method, &row.request_path);
                LogRecord {
                    id: row.id,
                    kind: LogRecordKind::Downstream,
                    at: row.at,
                    trace_id: row.trace_id,
                    provider,
                    credential_id: None,
                    user_id: row.user_id,
                    user_key_id: row.user_key_id,
                    attempt_no: Some(0),
                    operation,
                    request_method: row.request_method,
                    request_path: row.request_path,
                    response_status: row.response_status,
                    error_kind: None,
                    error_message: None,
                }
            }));
        }

        rows.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| b.id.cmp(&a.id)));
        let has_more = rows.len() > filter.offset + filter.limit;
        let rows = rows.into_iter().skip(filter.offset).take(filter.limit).collect();

        Ok(LogQueryResult { rows, has_more })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_request_attempt_log(
        &self,
        request_id: &str,
        credential_id: Option<i64>,
        model: &str,
        attempt_no: i32,
        account_attempt: i32,
        same_retry: bool,
        status: &str,
        latency_ms: i64,
        error_message: Option<String>,
        started_at: OffsetDateTime,
    ) -> StorageResult<()> {
        let active = entities::request_attempt_logs::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(request_id.to_string()),
            credential_id: ActiveValue::Set(credential_id),
            model: ActiveValue::Set(model.to_string()),
            attempt_no: ActiveValue::Set(attempt_no),
            account_attempt: ActiveValue::Set(account_attempt),
            same_retry: ActiveValue::Set(same_retry),
            status: ActiveValue::Set(status.to_string()),
            latency_ms: ActiveValue::Set(latency_ms),
            error_message: ActiveValue::Set(error_message),
            started_at: ActiveValue::Set(started_at),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::RequestAttemptLogs::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

fn system_time_to_offset(at: SystemTime) -> OffsetDateTime {
    match at.duration_since(std::time::UNIX_EPOCH) {
        Ok(dur) => OffsetDateTime::from_unix_timestamp_nanos(dur.as_nanos() as i128)
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        Err(_) => OffsetDateTime::now_utc(),
    }
}

fn extract_operational_at(event: &OperationalEvent) -> SystemTime {
    match event {
        OperationalEvent::UnavailableStart(e) => e.at,
        OperationalEvent::UnavailableEnd(e) => e.at,
        OperationalEvent::ModelUnavailableStart(e) => e.at,
        OperationalEvent::ModelUnavailableEnd(e) => e.at,
    }
}

fn extract_model_for_usage(request_path: &str, request_body: Option<&[u8]>) -> Option<String> {
    if let Some(body) = request_body
        && let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
    {
        let model = model.trim();
        if !model.is_empty() {
            return Some(model.to_string());
        }
    }

    if let Some(idx) = request_path.find("/models/") {
        let rest = &request_path[(idx + "/models/".len())..];
        let rest = rest.split(['?', '#']).next().unwrap_or(rest);
        let rest = rest.rsplit_once(':').map(|(model, _)| model).unwrap_or(rest);
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
    }

    None
}

/// Downstream rows carry no provider/credential/operation columns (unlike upstream
/// ones) since the downstream leg is provider-agnostic; this derives display-only
/// labels from the request path's `/<provider>/v1[beta]/...` prefix convention.
fn derive_downstream_observability(
    request_method: &str,
    request_path: &str,
) -> (Option<String>, Option<String>) {
    let normalized = if request_path.starts_with('/') {
        request_path.to_string()
    } else {
        format!("/{request_path}")
    };
    let parts: Vec<&str> = normalized
        .trim_start_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    let (provider, route_path) = if parts.len() >= 2 && (parts[1] == "v1" || parts[1] == "v1beta") {
        (Some(parts[0].to_string()), format!("/{}", parts[1..].join("/")))
    } else {
        (None, normalized)
    };

    let operation = match (request_method.to_ascii_uppercase().as_str(), route_path.as_str()) {
        ("POST", "/v1/messages") | ("POST", "/v1/chat/completions") | ("POST", "/v1/responses") => {
            Some("GenerateContent".to_string())
        }
        ("POST", "/v1/messages/count_tokens") => Some("CountTokens".to_string()),
        ("GET", "/v1/models") | ("GET", "/v1beta/models") => Some("ModelList".to_string()),
        _ if route_path.starts_with("/v1/models/") || route_path.starts_with("/v1beta/models/") => {
            Some("ModelGet".to_string())
        }
        _ => None,
    };

    (provider, operation)
}
