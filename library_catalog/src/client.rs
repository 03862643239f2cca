use anyhow::{bail, Context};
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use reqwest_tracing::TracingMiddleware;

use crate::api::{BookId, BookMeta, BookMetaPatch, BookTitleAndId, GetAllBooksResponse};

const MAX_RETRIES: u32 = 3;

pub struct LibraryCatalogClient {
    url: String,
    client: ClientWithMiddleware,
}

impl LibraryCatalogClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(reqwest_client)
            // Insert the tracing middleware
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Calls POST /api/book endpoint
    /// Returns id of the added book taken from the location header
    pub async fn add_book(&self, meta: BookMeta) -> anyhow::Result<BookId> {
        let response = self
            .client
            .post(format!("{}/api/book", self.url))
            .json(&meta)
            .send()
            .await?;

        if !response.status().is_success() {
            let error = response.text().await.unwrap_or_default();
            bail!("Failed to add book {}", error)
        }

        let location_header = response
            .headers()
            .get(LOCATION)
            .context("No location header")?;

        Ok(location_header
            .to_str()
            .context("Failed to convert header to str")?
            .strip_prefix("/api/book/")
            .context("Invalid location header")?
            .to_string())
    }

    /// Calls GET /api/book/{book_id} endpoint
    /// Returns None if the book is not in the catalog
    pub async fn get_book(&self, book_id: &str) -> anyhow::Result<Option<BookMeta>> {
        let response = self
            .client
            .get(format!("{}/api/book/{}", self.url, book_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            let error = response.text().await.unwrap_or_default();
            bail!("Failed to get book {}", error)
        }
    }

    /// Calls PATCH /api/book/{book_id} endpoint
    /// Returns false if the book was not found
    pub async fn update_book(&self, book_id: &str, patch: BookMetaPatch) -> anyhow::Result<bool> {
        let response = self
            .client
            .patch(format!("{}/api/book/{}", self.url, book_id))
            .json(&patch)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else if response.status().is_success() {
            Ok(true)
        } else {
            let error = response.text().await.unwrap_or_default();
            bail!("Failed to update book {}", error)
        }
    }

    /// Calls GET /api/books endpoint
    pub async fn list_books(&self) -> anyhow::Result<Vec<BookTitleAndId>> {
        let response = self
            .client
            .get(format!("{}/api/books", self.url))
            .send()
            .await?;
        if response.status().is_success() {
            let body: GetAllBooksResponse = response.json().await?;
            Ok(body.books)
        } else {
            let error = response.text().await.unwrap_or_default();
            bail!("Failed to list books {}", error)
        }
    }
}
