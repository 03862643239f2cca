use std::collections::HashMap;

use serde_json::json;

use crate::api::{BookId, BookMeta, BookMetaPatch, BookTitleAndId};
use crate::books_repository::{BookRepository, BookRepositoryError};

#[derive(Default)]
pub struct InMemoryBookRepository {
    books: parking_lot::RwLock<HashMap<BookId, BookMeta>>,
}

impl InMemoryBookRepository {
    /// Seeds a book under a known id, the way imported catalog entries arrive
    pub fn insert_book(&self, book_id: impl Into<BookId>, meta: BookMeta) {
        self.books.write().insert(book_id.into(), meta);
    }
}

#[async_trait::async_trait]
impl BookRepository for InMemoryBookRepository {
    async fn add_book(&self, meta: BookMeta) -> Result<BookId, BookRepositoryError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.books.write().insert(id.clone(), meta);
        Ok(id)
    }

    async fn update_book(
        &self,
        book_id: &str,
        patch: BookMetaPatch,
    ) -> Result<bool, BookRepositoryError> {
        let mut locked_books = self.books.write();
        if let Some(book) = locked_books.get_mut(book_id) {
            let mut result_book = json!(book);
            json_patch::merge(&mut result_book, &json!(patch));
            *book = serde_json::from_value(result_book)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get_book(&self, book_id: &str) -> Result<BookMeta, BookRepositoryError> {
        self.books
            .read()
            .get(book_id)
            .cloned()
            .ok_or_else(|| BookRepositoryError::NotFound(book_id.to_string()))
    }

    async fn list_books(&self) -> Result<Vec<BookTitleAndId>, BookRepositoryError> {
        Ok(self
            .books
            .read()
            .iter()
            .map(|(book_id, meta)| BookTitleAndId {
                book_id: book_id.clone(),
                title: meta.title.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod in_memory_book_repository_tests {
    use crate::api::{BookMeta, BookMetaPatch, BookTitleAndId};
    use crate::books_repository::{BookRepository, BookRepositoryError, InMemoryBookRepository};

    fn sample_meta(title: &str) -> BookMeta {
        BookMeta {
            title: title.to_string(),
            author: "Clarice Lispector".to_string(),
            cover: "".to_string(),
            pages: Some(180),
            description: "".to_string(),
        }
    }

    #[tokio::test]
    /// Tests if add_book and get_book work correctly
    async fn test_add_book_and_get_it() {
        let repo = InMemoryBookRepository::default();

        let book_not_found = repo.get_book("missing").await;
        assert!(matches!(
            book_not_found,
            Err(BookRepositoryError::NotFound(..))
        ));

        let meta = sample_meta("A hora da estrela");
        let id = repo
            .add_book(meta.clone())
            .await
            .expect("Failed to add book");

        assert_eq!(repo.get_book(&id).await.expect("Failed to get book"), meta);
    }

    #[tokio::test]
    /// Tests if list_books returns seeded and added books
    async fn test_add_books_and_list_them() {
        let repo = InMemoryBookRepository::default();
        assert_eq!(repo.list_books().await.expect("Failed to list books"), vec![]);

        repo.insert_book("seeded", sample_meta("title1"));
        let id_2 = repo
            .add_book(sample_meta("title2"))
            .await
            .expect("Failed to add book");

        let mut list = repo.list_books().await.expect("Failed to list books");
        list.sort_by(|a, b| a.title.cmp(&b.title));

        assert_eq!(
            list,
            vec![
                BookTitleAndId {
                    book_id: "seeded".to_string(),
                    title: "title1".to_string(),
                },
                BookTitleAndId {
                    book_id: id_2,
                    title: "title2".to_string(),
                }
            ]
        );
    }

    #[tokio::test]
    /// Patching only touches the fields present in the patch
    async fn test_add_book_patch_and_get_it() {
        let repo = InMemoryBookRepository::default();
        let result = repo
            .update_book("missing", BookMetaPatch::default())
            .await
            .expect("Failed to update");
        // false means nothing to update
        assert!(!result);

        let meta = sample_meta("xx");
        let id = repo.add_book(meta.clone()).await.expect("Failed to add book");

        let patch_result = repo
            .update_book(
                &id,
                BookMetaPatch {
                    title: Some("patchedTitle".to_string()),
                    pages: Some(200),
                    ..BookMetaPatch::default()
                },
            )
            .await
            .expect("Failed to patch");
        assert!(patch_result);

        assert_eq!(
            repo.get_book(&id).await.unwrap(),
            BookMeta {
                title: "patchedTitle".to_string(),
                pages: Some(200),
                ..meta
            }
        );
    }
}
