//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::Duration;

use crate::api::{BookMeta, ReservationId, Timestamp};
use crate::book_catalog::InMemoryBookCatalog;
use crate::clock::ManualClock;
use crate::document_store::testing::FlakyDocumentStore;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;
use crate::reservations_repository::ReservationsRepository;
use crate::retry::RetryPolicy;

// 2024-03-15T12:00:00Z
pub const START: Timestamp = 1_710_504_000_000;

pub struct Harness {
    pub store: Arc<FlakyDocumentStore>,
    pub catalog: Arc<InMemoryBookCatalog>,
    pub clock: Arc<ManualClock>,
    pub service: Arc<ReservationService>,
}

pub fn book(title: &str, pages: Option<u32>) -> BookMeta {
    BookMeta {
        title: title.to_string(),
        author: "Cecília Meireles".to_string(),
        cover: format!("https://covers.example/{}.jpg", title.len()),
        pages,
        description: "".to_string(),
    }
}

pub fn harness() -> Harness {
    harness_with_legacy(false)
}

pub fn harness_with_legacy(legacy_collections: bool) -> Harness {
    let store = Arc::new(FlakyDocumentStore::default());
    let catalog = Arc::new(InMemoryBookCatalog::default());
    let clock = Arc::new(ManualClock::at_millis(START));
    let repository = Arc::new(
        ReservationsRepository::new(store.clone()).with_legacy_collections(legacy_collections),
    );
    let service = Arc::new(ReservationService::new(
        repository,
        catalog.clone(),
        clock.clone(),
        RetryPolicy::immediate(2),
    ));
    Harness {
        store,
        catalog,
        clock,
        service,
    }
}

impl Harness {
    /// Reserves one second after the previous call so creation order is strict
    pub async fn reserve(&self, user_id: &str, book_id: &str) -> ReservationId {
        self.clock.advance(Duration::seconds(1));
        self.service
            .reserve(&Caller::user(user_id), book_id)
            .await
            .expect("reserve failed")
    }

    pub async fn queue_count(&self, book_id: &str) -> u32 {
        self.service
            .get_book_status(book_id)
            .await
            .expect("book status")
            .queue_count
    }

    pub async fn queue_len(&self, book_id: &str) -> usize {
        self.service
            .repository()
            .queue_entries(book_id)
            .await
            .expect("queue entries")
            .len()
    }
}
