pub use in_memory_books_repository::InMemoryBookRepository;
pub use postgres_books_repository::{PostgresBooksRepository, PostgresBooksRepositoryConfig};

use crate::api::{BookId, BookMeta, BookMetaPatch, BookTitleAndId};

mod in_memory_books_repository;
mod postgres_books_repository;

#[derive(thiserror::Error, Debug)]
pub enum BookRepositoryError {
    #[error("Book {0} not found")]
    NotFound(BookId),

    #[error("Stored book metadata is malformed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Catalog database failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait BookRepository {
    /// Adds book to repository, returns an id assigned to the book
    async fn add_book(&self, meta: BookMeta) -> Result<BookId, BookRepositoryError>;
    /// Updates book in the repository, returns true if book was updated and false if it was not found
    async fn update_book(
        &self,
        book_id: &str,
        patch: BookMetaPatch,
    ) -> Result<bool, BookRepositoryError>;
    /// Retrieves metadata of the book, canonical collection first, legacy one second
    async fn get_book(&self, book_id: &str) -> Result<BookMeta, BookRepositoryError>;
    /// Lists all books in the repository
    async fn list_books(&self) -> Result<Vec<BookTitleAndId>, BookRepositoryError>;
}
