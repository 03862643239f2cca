use anyhow::Context;
use tokio::sync::broadcast;
use tokio_postgres::{Client, NoTls, Statement};

use crate::document_store::{
    last_segment, parent_of, validate_path, Document, DocumentStore, StoreError,
    TransactionOutcome, UpdateFn, CHANGE_FEED_CAPACITY,
};

/// Compare-and-swap attempts before a transaction gives up with `Conflict`
const MAX_TRANSACTION_ATTEMPTS: usize = 16;

pub struct PostgresDocumentStore {
    client: Client,
    changes: broadcast::Sender<String>,
}

pub struct PostgresDocumentStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl PostgresDocumentStore {
    pub async fn init(config: PostgresDocumentStoreConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        tracing::info!(hostname = %config.hostname, "Connecting to postgres");
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Postgres connection error: {}", e);
            }
        });

        client
            .batch_execute(
                "
        CREATE SEQUENCE IF NOT EXISTS document_versions;
        CREATE TABLE IF NOT EXISTS documents (
            path            TEXT PRIMARY KEY,
            parent          TEXT NOT NULL,
            value           JSONB NOT NULL,
            version         BIGINT NOT NULL DEFAULT nextval('document_versions')
            );
        ALTER TABLE documents ALTER COLUMN version SET DEFAULT nextval('document_versions');
        CREATE INDEX IF NOT EXISTS documents_parent_idx ON documents (parent);
        ",
            )
            .await
            .context("Failed to setup tables")?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { client, changes })
    }

    // Only writes made through this process are announced
    fn notify(&self, path: &str) {
        let _ = self.changes.send(path.to_string());
    }

    /// Single compare-and-swap attempt, false when another writer got there
    /// first. Versions come from one sequence, so a path that was deleted and
    /// written again never matches a version read before the delete.
    async fn try_commit(
        &self,
        path: &str,
        version: Option<i64>,
        next: Option<&Document>,
    ) -> Result<bool, StoreError> {
        let affected = match (version, next) {
            (None, None) => return Ok(true),
            (None, Some(value)) => {
                let stmt: Statement = self
                    .client
                    .prepare(
                        "INSERT INTO documents (path, parent, value) VALUES ($1, $2, $3)
                         ON CONFLICT (path) DO NOTHING",
                    )
                    .await?;
                self.client
                    .execute(&stmt, &[&path, &parent_of(path), value])
                    .await?
            }
            (Some(version), Some(value)) => {
                let stmt: Statement = self
                    .client
                    .prepare(
                        "UPDATE documents SET value = $2, version = nextval('document_versions')
                         WHERE path = $1 AND version = $3",
                    )
                    .await?;
                self.client
                    .execute(&stmt, &[&path, value, &version])
                    .await?
            }
            (Some(version), None) => {
                let stmt: Statement = self
                    .client
                    .prepare("DELETE FROM documents WHERE path = $1 AND version = $2")
                    .await?;
                self.client.execute(&stmt, &[&path, &version]).await?
            }
        };
        Ok(affected == 1)
    }
}

#[async_trait::async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        validate_path(path)?;
        let stmt: Statement = self
            .client
            .prepare("SELECT value FROM documents WHERE path = $1")
            .await?;

        let row = self.client.query_opt(&stmt, &[&path]).await?;
        Ok(row.map(|row| row.try_get(0)).transpose()?)
    }

    async fn set(&self, path: &str, value: Document) -> Result<(), StoreError> {
        validate_path(path)?;
        let stmt: Statement = self
            .client
            .prepare(
                "INSERT INTO documents (path, parent, value) VALUES ($1, $2, $3)
                 ON CONFLICT (path) DO UPDATE
                 SET value = EXCLUDED.value, version = nextval('document_versions')",
            )
            .await?;

        self.client
            .execute(&stmt, &[&path, &parent_of(path), &value])
            .await?;
        self.notify(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        let stmt: Statement = self
            .client
            .prepare("DELETE FROM documents WHERE path = $1")
            .await?;

        if self.client.execute(&stmt, &[&path]).await? > 0 {
            self.notify(path);
        }
        Ok(())
    }

    async fn children(&self, parent: &str) -> Result<Vec<(String, Document)>, StoreError> {
        validate_path(parent)?;
        let stmt: Statement = self
            .client
            .prepare("SELECT path, value FROM documents WHERE parent = $1 ORDER BY path")
            .await?;

        let rows = self.client.query(&stmt, &[&parent]).await?;
        rows.iter()
            .map(|row| {
                let path: String = row.try_get(0)?;
                let value: Document = row.try_get(1)?;
                Ok((last_segment(&path).to_string(), value))
            })
            .collect()
    }

    async fn child_keys(&self, parent: &str) -> Result<Vec<String>, StoreError> {
        validate_path(parent)?;
        let prefix = format!("{parent}/");
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT DISTINCT split_part(substr(path, $2), '/', 1) AS key
                 FROM documents WHERE starts_with(path, $1) ORDER BY key",
            )
            .await?;

        let skip = prefix.chars().count() as i32 + 1;
        let rows = self.client.query(&stmt, &[&prefix, &skip]).await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<_, String>(0)?))
            .collect()
    }

    async fn transaction(
        &self,
        path: &str,
        update: &UpdateFn<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        validate_path(path)?;
        let select: Statement = self
            .client
            .prepare("SELECT value, version FROM documents WHERE path = $1")
            .await?;

        for attempt in 0..MAX_TRANSACTION_ATTEMPTS {
            let (previous, version) = match self.client.query_opt(&select, &[&path]).await? {
                Some(row) => (
                    Some(row.try_get::<_, Document>(0)?),
                    Some(row.try_get::<_, i64>(1)?),
                ),
                None => (None, None),
            };

            let current = update(previous.as_ref())?;
            if self.try_commit(path, version, current.as_ref()).await? {
                if previous != current {
                    self.notify(path);
                }
                return Ok(TransactionOutcome { previous, current });
            }
            tracing::debug!(path, attempt, "Concurrent write detected, retrying transaction");
        }
        Err(StoreError::Conflict(path.to_string()))
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
