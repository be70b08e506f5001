//! Metadata Store collaborator: the `files` catalog.
//!
//! `SqliteMetadataStore` keeps records in SQLite through an `sqlx` pool. The
//! schema lives in `migrations/0001_init.sql` and is applied by
//! [`SqliteMetadataStore::migrate`].

use crate::models::file_record::{FileRecord, FileRecordUpdate, NewFileRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const INIT_SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str =
    "id, bucket, object_key, original_name, url, size_bytes, mime_type, is_deleted, created_at";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file record `{0}` not found")]
    NotFound(i64),
    #[error("object `{key}` already recorded in bucket `{bucket}`")]
    Duplicate { bucket: String, key: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a record and return it with its assigned identity.
    async fn create(&self, record: NewFileRecord) -> MetadataResult<FileRecord>;

    async fn update(&self, id: i64, fields: FileRecordUpdate) -> MetadataResult<()>;

    async fn find(&self, id: i64) -> MetadataResult<FileRecord>;

    /// Non-deleted records of a bucket, newest first.
    async fn list_by_bucket(&self, bucket: &str) -> MetadataResult<Vec<FileRecord>>;

    /// Physically remove a record.
    async fn delete(&self, id: i64) -> MetadataResult<()>;

    async fn ping(&self) -> MetadataResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema, one statement at a time.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create(&self, record: NewFileRecord) -> MetadataResult<FileRecord> {
        let sql = format!(
            "INSERT INTO files (bucket, object_key, original_name, url, size_bytes, mime_type, is_deleted, created_at)
             VALUES (?, ?, ?, '', ?, ?, 0, ?)
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(&record.bucket)
            .bind(&record.object_key)
            .bind(&record.original_name)
            .bind(record.size_bytes)
            .bind(&record.mime_type)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MetadataError::Duplicate {
                        bucket: record.bucket.clone(),
                        key: record.object_key.clone(),
                    }
                } else {
                    MetadataError::Sqlx(err)
                }
            })
    }

    async fn update(&self, id: i64, fields: FileRecordUpdate) -> MetadataResult<()> {
        if fields.url.is_none() && fields.is_deleted.is_none() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE files SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(url) = fields.url {
                set.push("url = ");
                set.push_bind_unseparated(url);
            }
            if let Some(is_deleted) = fields.is_deleted {
                set.push("is_deleted = ");
                set.push_bind_unseparated(is_deleted);
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&*self.db).await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(id));
        }
        Ok(())
    }

    async fn find(&self, id: i64) -> MetadataResult<FileRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => MetadataError::NotFound(id),
                other => MetadataError::Sqlx(other),
            })
    }

    async fn list_by_bucket(&self, bucket: &str) -> MetadataResult<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE bucket = ? AND is_deleted = 0 ORDER BY id DESC"
        );
        Ok(sqlx::query_as::<_, FileRecord>(&sql)
            .bind(bucket)
            .fetch_all(&*self.db)
            .await?)
    }

    async fn delete(&self, id: i64) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(id));
        }
        Ok(())
    }

    async fn ping(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
