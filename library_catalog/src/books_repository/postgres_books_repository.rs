use anyhow::Context;
use serde_json::json;
use tokio_postgres::{Client, NoTls, Statement};

use crate::api::{BookId, BookMeta, BookMetaPatch, BookTitleAndId};
use crate::books_repository::{BookRepository, BookRepositoryError};

pub struct PostgresBooksRepository {
    client: Client,
}

pub struct PostgresBooksRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl PostgresBooksRepository {
    pub async fn init(config: PostgresBooksRepositoryConfig) -> anyhow::Result<Self> {
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

        // `livros` holds books imported before the catalog moved to `books`
        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS books (
            id              TEXT PRIMARY KEY,
            params          JSONB NOT NULL
            );
        CREATE TABLE IF NOT EXISTS livros (
            id              TEXT PRIMARY KEY,
            params          JSONB NOT NULL
            );
        ",
            )
            .await
            .context("Failed to setup tables")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl BookRepository for PostgresBooksRepository {
    async fn add_book(&self, meta: BookMeta) -> Result<BookId, BookRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO books (id, params) VALUES ($1, $2) RETURNING id")
            .await?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let rows = self.client.query(&stmt, &[&id, &json!(meta)]).await?;

        let book_id: BookId = rows
            .first()
            .ok_or_else(|| BookRepositoryError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(book_id)
    }

    async fn update_book(
        &self,
        book_id: &str,
        patch: BookMetaPatch,
    ) -> Result<bool, BookRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("UPDATE books SET params = params || ($1)::JSONB WHERE id = ($2) RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&json!(patch), &book_id]).await?;
        Ok(!rows.is_empty())
    }

    async fn get_book(&self, book_id: &str) -> Result<BookMeta, BookRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT params FROM books WHERE id = ($1)
                 UNION ALL
                 SELECT params FROM livros WHERE id = ($1) AND NOT EXISTS (SELECT 1 FROM books WHERE id = ($1))",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&book_id]).await?;

        let params: serde_json::Value = rows
            .first()
            .ok_or_else(|| BookRepositoryError::NotFound(book_id.to_string()))?
            .try_get(0)?;

        Ok(serde_json::from_value(params)?)
    }

    async fn list_books(&self) -> Result<Vec<BookTitleAndId>, BookRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT id, params FROM books
                 UNION ALL
                 SELECT id, params FROM livros WHERE id NOT IN (SELECT id FROM books)",
            )
            .await?;

        let rows = self.client.query(&stmt, &[]).await?;

        rows.iter()
            .map(|row| {
                let book_id: BookId = row.try_get(0)?;
                let params: serde_json::Value = row.try_get(1)?;
                let meta: BookMeta = serde_json::from_value(params)?;

                Ok(BookTitleAndId {
                    book_id,
                    title: meta.title,
                })
            })
            .collect()
    }
}
