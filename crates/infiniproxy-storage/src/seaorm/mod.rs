use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, Index};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseBackend, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Schema, TransactionTrait,
};
use time::OffsetDateTime;
use tracing::warn;

use infiniproxy_provider_core::{
    BackendService, BackendStore, BackendSummary, CallerDirectory, CallerIdentity, RegistryError,
    UsageRecord, UsageSink, generate_api_key, hash_api_key,
};

use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("backend {short_name} is still referenced by {references} api key(s)")]
    BackendInUse { short_name: String, references: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Fields an administrator sets on a backend.
#[derive(Clone)]
pub struct BackendInput {
    pub short_name: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub default_model: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
}

impl BackendInput {
    fn validate(&self) -> StorageResult<()> {
        let short_name = self.short_name.trim();
        if short_name.is_empty() || short_name.contains('/') {
            return Err(StorageError::InvalidInput(format!(
                "backend short name must be non-empty and contain no '/': {short_name:?}"
            )));
        }
        if self.base_url.trim().is_empty() {
            return Err(StorageError::InvalidInput("backend base_url is empty".to_string()));
        }
        Ok(())
    }
}

/// A freshly issued caller key. The plaintext is only ever available here.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub id: i64,
    pub api_key: String,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let mut options = ConnectOptions::new(dsn.to_string());
        options.sqlx_logging(false);
        // Every pooled connection to an in-memory sqlite database is a new database.
        if dsn.contains(":memory:") {
            options.max_connections(1).min_connections(1);
        }
        let db = Database::connect(options).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::BackendServices)
            .register(entities::ApiKeys)
            .register(entities::UsageRecords)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::api_keys::Column as ApiKeyColumn;
        use entities::usage_records::Column as UsageColumn;

        let statements = vec![
            Index::create()
                .name("idx_api_keys_backend_id")
                .table(entities::api_keys::Entity)
                .col(ApiKeyColumn::BackendId)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_usage_records_api_key_at")
                .table(entities::usage_records::Entity)
                .col(UsageColumn::ApiKeyId)
                .col(UsageColumn::At)
                .if_not_exists()
                .to_owned(),
        ];
        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    pub async fn create_backend(&self, input: BackendInput) -> StorageResult<BackendService> {
        use entities::backend_services::ActiveModel as BackendActive;

        input.validate()?;
        let now = OffsetDateTime::now_utc();
        let txn = self.db.begin().await?;
        if input.is_default {
            clear_default_flags(&txn, None).await?;
        }
        let active = BackendActive {
            id: ActiveValue::NotSet,
            short_name: ActiveValue::Set(input.short_name.trim().to_string()),
            name: ActiveValue::Set(input.name),
            base_url: ActiveValue::Set(input.base_url.trim().to_string()),
            api_key: ActiveValue::Set(input.api_key),
            default_model: ActiveValue::Set(normalize_optional(input.default_model)),
            is_active: ActiveValue::Set(input.is_active),
            is_default: ActiveValue::Set(input.is_default),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let model = active.insert(&txn).await?;
        txn.commit().await?;
        Ok(backend_from_model(model))
    }

    pub async fn update_backend(&self, id: i64, input: BackendInput) -> StorageResult<BackendService> {
        use entities::backend_services::ActiveModel as BackendActive;

        input.validate()?;
        let txn = self.db.begin().await?;
        let existing = entities::BackendServices::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("backend {id}")))?;
        if input.is_default {
            clear_default_flags(&txn, Some(id)).await?;
        }

        let mut active: BackendActive = existing.into();
        active.short_name = ActiveValue::Set(input.short_name.trim().to_string());
        active.name = ActiveValue::Set(input.name);
        active.base_url = ActiveValue::Set(input.base_url.trim().to_string());
        active.api_key = ActiveValue::Set(input.api_key);
        active.default_model = ActiveValue::Set(normalize_optional(input.default_model));
        active.is_active = ActiveValue::Set(input.is_active);
        active.is_default = ActiveValue::Set(input.is_default);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        let model = active.update(&txn).await?;
        txn.commit().await?;
        Ok(backend_from_model(model))
    }

    /// Refused while any api key still prefers this backend.
    pub async fn delete_backend(&self, id: i64) -> StorageResult<()> {
        use entities::api_keys::Column as ApiKeyColumn;

        let txn = self.db.begin().await?;
        let backend = entities::BackendServices::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("backend {id}")))?;
        let references = entities::ApiKeys::find()
            .filter(ApiKeyColumn::BackendId.eq(id))
            .count(&txn)
            .await?;
        if references > 0 {
            return Err(StorageError::BackendInUse {
                short_name: backend.short_name,
                references,
            });
        }
        entities::BackendServices::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn list_backend_summaries(
        &self,
        active_only: bool,
    ) -> StorageResult<Vec<BackendSummary>> {
        let rows = self.query_backends(active_only).await?;
        Ok(rows
            .into_iter()
            .map(|row| backend_from_model(row).summary())
            .collect())
    }

    pub async fn create_user(&self, name: &str) -> StorageResult<i64> {
        use entities::users::ActiveModel as UserActive;

        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidInput("user name is empty".to_string()));
        }
        let now = OffsetDateTime::now_utc();
        let active = UserActive {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(name.to_string()),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::Users::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    /// Issue a new key for `user_id`; only its hash is stored.
    pub async fn create_api_key(
        &self,
        user_id: i64,
        label: Option<&str>,
    ) -> StorageResult<IssuedApiKey> {
        use entities::api_keys::ActiveModel as ApiKeyActive;

        if entities::Users::find_by_id(user_id)
            .one(&self.db)
            .await?
            .is_none()
        {
            return Err(StorageError::NotFound(format!("user {user_id}")));
        }

        let api_key = generate_api_key();
        let now = OffsetDateTime::now_utc();
        let active = ApiKeyActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            key_hash: ActiveValue::Set(hash_api_key(&api_key)),
            label: ActiveValue::Set(normalize_optional(label.map(str::to_string))),
            backend_id: ActiveValue::Set(None),
            model_name: ActiveValue::Set(None),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::ApiKeys::insert(active).exec(&self.db).await?;
        Ok(IssuedApiKey {
            id: inserted.last_insert_id,
            api_key,
        })
    }

    pub async fn set_caller_backend(
        &self,
        api_key_id: i64,
        backend_id: Option<i64>,
    ) -> StorageResult<()> {
        if let Some(backend_id) = backend_id
            && entities::BackendServices::find_by_id(backend_id)
                .one(&self.db)
                .await?
                .is_none()
        {
            return Err(StorageError::NotFound(format!("backend {backend_id}")));
        }
        let mut active = self.api_key_active(api_key_id).await?;
        active.backend_id = ActiveValue::Set(backend_id);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_caller_model(
        &self,
        api_key_id: i64,
        model: Option<&str>,
    ) -> StorageResult<()> {
        let mut active = self.api_key_active(api_key_id).await?;
        active.model_name = ActiveValue::Set(normalize_optional(model.map(str::to_string)));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_api_key_enabled(&self, api_key_id: i64, enabled: bool) -> StorageResult<()> {
        let mut active = self.api_key_active(api_key_id).await?;
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn count_api_keys(&self) -> StorageResult<u64> {
        Ok(entities::ApiKeys::find().count(&self.db).await?)
    }

    pub async fn list_usage(&self, api_key_id: i64) -> StorageResult<Vec<UsageRecord>> {
        use entities::usage_records::Column;

        let rows = entities::UsageRecords::find()
            .filter(Column::ApiKeyId.eq(api_key_id))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| UsageRecord {
                caller_id: row.api_key_id,
                user_id: row.user_id,
                endpoint: row.endpoint,
                tokens_in: u64::try_from(row.tokens_in).unwrap_or_default(),
                tokens_out: u64::try_from(row.tokens_out).unwrap_or_default(),
                model_used: row.model_used,
                backend_used: row.backend_used,
            })
            .collect())
    }

    async fn api_key_active(
        &self,
        api_key_id: i64,
    ) -> StorageResult<entities::api_keys::ActiveModel> {
        let model = entities::ApiKeys::find_by_id(api_key_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("api key {api_key_id}")))?;
        Ok(model.into())
    }

    async fn query_backends(
        &self,
        active_only: bool,
    ) -> Result<Vec<entities::backend_services::Model>, sea_orm::DbErr> {
        use entities::backend_services::Column;

        let mut query = entities::BackendServices::find();
        if active_only {
            query = query.filter(Column::IsActive.eq(true));
        }
        query
            .order_by_desc(Column::IsDefault)
            .order_by_asc(Column::ShortName)
            .all(&self.db)
            .await
    }

    async fn insert_usage(&self, record: &UsageRecord) -> StorageResult<()> {
        use entities::usage_records::ActiveModel as UsageActive;

        let active = UsageActive {
            id: ActiveValue::NotSet,
            api_key_id: ActiveValue::Set(record.caller_id),
            user_id: ActiveValue::Set(record.user_id),
            endpoint: ActiveValue::Set(record.endpoint.clone()),
            tokens_in: ActiveValue::Set(i64::try_from(record.tokens_in).unwrap_or(i64::MAX)),
            tokens_out: ActiveValue::Set(i64::try_from(record.tokens_out).unwrap_or(i64::MAX)),
            model_used: ActiveValue::Set(record.model_used.clone()),
            backend_used: ActiveValue::Set(record.backend_used.clone()),
            at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::UsageRecords::insert(active).exec(&self.db).await?;
        Ok(())
    }
}

async fn clear_default_flags<C>(conn: &C, except: Option<i64>) -> Result<(), sea_orm::DbErr>
where
    C: ConnectionTrait,
{
    use entities::backend_services::Column;

    let mut update = entities::BackendServices::update_many()
        .col_expr(Column::IsDefault, Expr::value(false))
        .filter(Column::IsDefault.eq(true));
    if let Some(id) = except {
        update = update.filter(Column::Id.ne(id));
    }
    update.exec(conn).await?;
    Ok(())
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn backend_from_model(model: entities::backend_services::Model) -> BackendService {
    BackendService {
        id: model.id,
        short_name: model.short_name,
        name: model.name,
        base_url: model.base_url,
        api_key: model.api_key,
        default_model: model.default_model,
        is_active: model.is_active,
        is_default: model.is_default,
    }
}

fn registry_error(err: sea_orm::DbErr) -> RegistryError {
    RegistryError::Unavailable(err.to_string())
}

#[async_trait]
impl BackendStore for SeaOrmStorage {
    async fn list_backends(
        &self,
        active_only: bool,
    ) -> Result<Vec<BackendService>, RegistryError> {
        let rows = self.query_backends(active_only).await.map_err(registry_error)?;
        Ok(rows.into_iter().map(backend_from_model).collect())
    }

    async fn get_backend(&self, id: i64) -> Result<Option<BackendService>, RegistryError> {
        let row = entities::BackendServices::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(registry_error)?;
        Ok(row.map(backend_from_model))
    }

    async fn get_backend_by_short_name(
        &self,
        short_name: &str,
    ) -> Result<Option<BackendService>, RegistryError> {
        use entities::backend_services::Column;

        let row = entities::BackendServices::find()
            .filter(Column::ShortName.eq(short_name))
            .filter(Column::IsActive.eq(true))
            .one(&self.db)
            .await
            .map_err(registry_error)?;
        Ok(row.map(backend_from_model))
    }

    async fn get_default_backend(&self) -> Result<Option<BackendService>, RegistryError> {
        use entities::backend_services::Column;

        let flagged = entities::BackendServices::find()
            .filter(Column::IsActive.eq(true))
            .filter(Column::IsDefault.eq(true))
            .one(&self.db)
            .await
            .map_err(registry_error)?;
        if let Some(row) = flagged {
            return Ok(Some(backend_from_model(row)));
        }

        let first = entities::BackendServices::find()
            .filter(Column::IsActive.eq(true))
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await
            .map_err(registry_error)?;
        Ok(first.map(backend_from_model))
    }
}

#[async_trait]
impl CallerDirectory for SeaOrmStorage {
    async fn lookup_caller(
        &self,
        key_hash: &str,
    ) -> Result<Option<CallerIdentity>, RegistryError> {
        use entities::api_keys::Column;

        let row = entities::ApiKeys::find()
            .filter(Column::KeyHash.eq(key_hash))
            .filter(Column::Enabled.eq(true))
            .one(&self.db)
            .await
            .map_err(registry_error)?;
        Ok(row.map(|row| CallerIdentity {
            caller_id: row.id,
            user_id: row.user_id,
            preferred_backend_id: row.backend_id,
            preferred_model: row.model_name,
        }))
    }
}

impl UsageSink for SeaOrmStorage {
    fn record<'a>(&'a self, record: &'a UsageRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(err) = self.insert_usage(record).await {
                warn!(
                    event = "usage_record_failed",
                    caller_id = record.caller_id,
                    error = %err
                );
            }
        })
    }
}
