pub mod entities;
pub mod event_sink;
pub mod snapshot;
pub mod storage;

pub use event_sink::DbEventSink;
pub use snapshot::{
    CredentialRow, GlobalConfigRow, ProviderRow, StorageSnapshot, UserKeyRow, UserRow,
};
pub use storage::{
    LogQueryFilter, LogQueryResult, LogRecord, LogRecordKind, SeaOrmStorage, Storage, StorageError,
    StorageResult, UsageAggregate, UsageAggregateFilter,
};
