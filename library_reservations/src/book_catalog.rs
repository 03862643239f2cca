use std::collections::HashMap;

use parking_lot::RwLock;

use crate::api::{BookId, BookMeta};

/// Read-only view of the book catalog
#[async_trait::async_trait]
pub trait BookCatalog: Send + Sync {
    /// None when the catalog has no such book
    async fn book_meta(&self, book_id: &str) -> anyhow::Result<Option<BookMeta>>;
}

pub use http_book_catalog::HttpBookCatalog;

mod http_book_catalog {
    use library_catalog::client::LibraryCatalogClient;

    use super::*;

    /// Catalog reached over HTTP through the catalog service client
    pub struct HttpBookCatalog {
        client: LibraryCatalogClient,
    }

    impl HttpBookCatalog {
        pub fn new(catalog_url: &str) -> anyhow::Result<Self> {
            Ok(Self {
                client: LibraryCatalogClient::new(catalog_url)?,
            })
        }
    }

    #[async_trait::async_trait]
    impl BookCatalog for HttpBookCatalog {
        async fn book_meta(&self, book_id: &str) -> anyhow::Result<Option<BookMeta>> {
            self.client.get_book(book_id).await
        }
    }
}

/// Fixed set of books, for tests and for running without a catalog service
#[derive(Default)]
pub struct InMemoryBookCatalog {
    books: RwLock<HashMap<BookId, BookMeta>>,
}

impl InMemoryBookCatalog {
    pub fn insert_book(&self, book_id: impl Into<BookId>, meta: BookMeta) {
        self.books.write().insert(book_id.into(), meta);
    }
}

#[async_trait::async_trait]
impl BookCatalog for InMemoryBookCatalog {
    async fn book_meta(&self, book_id: &str) -> anyhow::Result<Option<BookMeta>> {
        Ok(self.books.read().get(book_id).cloned())
    }
}
