//! Background repair of everything a saga can leave behind: journals of
//! requests that died half way, queue entries without a queued ledger record
//! (and the reverse), markers pointing nowhere, drifted counters and rating
//! summaries. Journals of any operation are finished the same way, by
//! realigning the reservation's views with its ledger record.
//!
//! Journals younger than the grace period belong to requests that may still
//! be running. Their reservations and books are left alone for this pass.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    BookId, QueueEntry, RatingSummary, ReconciliationReport, ReservationId, SagaOperation,
    Timestamp,
};
use crate::error::ReservationError;
use crate::lifecycle::{Recount, ReservationService};
use crate::ratings::average;

pub struct Reconciler {
    service: Arc<ReservationService>,
    /// Milliseconds a journal may stay open before it counts as abandoned
    grace: Timestamp,
    /// Held for a whole pass, the admin endpoint and the periodic task share it
    pass: tokio::sync::Mutex<()>,
}

/// Reservations and books touched by sagas that may still be running
#[derive(Default)]
struct InFlight {
    reservations: HashSet<ReservationId>,
    books: HashSet<BookId>,
}

impl Reconciler {
    pub fn new(service: Arc<ReservationService>, grace: Duration) -> Self {
        Self {
            service,
            grace: grace.as_millis().try_into().unwrap_or(Timestamp::MAX),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    /// One full pass. Runs alongside user requests: books with a live journal
    /// are skipped and counters are only written by compare-and-swap, so a
    /// busy book is corrected on a later pass. Passes of one reconciler run
    /// one at a time.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ReservationError> {
        let _pass = self.pass.lock().await;
        let mut report = ReconciliationReport::default();

        let in_flight = self.finish_journals(&mut report).await?;
        self.repair_queues(&in_flight, &mut report).await?;
        self.remove_stale_markers(&in_flight, &mut report).await?;
        self.recount_books(&in_flight, &mut report).await?;
        self.recompute_rating_summaries(&mut report).await?;

        tracing::info!(
            resumed = report.resumed_operations,
            rolled_back = report.rolled_back_operations,
            orphans = report.removed_orphan_entries,
            restored = report.restored_entries,
            stale_markers = report.removed_stale_markers,
            corrected_books = report.corrected_books.len(),
            corrected_ratings = report.corrected_rating_summaries.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Runs `reconcile` every `interval` until the task is dropped
    pub async fn run_periodically(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.reconcile().await {
                tracing::error!("Reconciliation pass failed: {}", err);
            }
        }
    }

    async fn finish_journals(
        &self,
        report: &mut ReconciliationReport,
    ) -> Result<InFlight, ReservationError> {
        let repository = &self.service.repository;
        let live_after = self.live_after();
        let journals = self
            .service
            .step("reconcile.journals", || repository.pending_operations())
            .await?;

        let mut in_flight = InFlight::default();
        for journal in journals {
            if journal.started_at >= live_after {
                in_flight.reservations.insert(journal.reservation_id.clone());
                in_flight.books.insert(journal.book_id.clone());
                continue;
            }

            match self.service.settle(&journal, live_after).await {
                Ok(None) if journal.operation == SagaOperation::Reserve => {
                    tracing::info!(
                        reservation_id = %journal.reservation_id,
                        "Rolled interrupted reserve back"
                    );
                    report.rolled_back_operations += 1;
                }
                Ok(_) => {
                    tracing::info!(
                        reservation_id = %journal.reservation_id,
                        operation = ?journal.operation,
                        "Finished interrupted operation"
                    );
                    report.resumed_operations += 1;
                }
                Err(err) => {
                    tracing::error!(
                        reservation_id = %journal.reservation_id,
                        "Could not finish interrupted operation: {}",
                        err
                    );
                    in_flight.reservations.insert(journal.reservation_id.clone());
                    in_flight.books.insert(journal.book_id.clone());
                }
            }
        }
        Ok(in_flight)
    }

    /// Journals started at or after this instant may belong to live requests
    fn live_after(&self) -> Timestamp {
        self.service.clock.now_millis().saturating_sub(self.grace)
    }

    /// A journal opened after the pass took its snapshot
    async fn journal_opened(&self, reservation_id: &str) -> Result<bool, ReservationError> {
        let repository = &self.service.repository;
        Ok(self
            .service
            .step("reconcile.journal", || repository.pending_operation(reservation_id))
            .await?
            .is_some())
    }

    /// Drops entries whose reservation is gone or no longer queued and
    /// restores entries of queued reservations that lost theirs
    async fn repair_queues(
        &self,
        in_flight: &InFlight,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReservationError> {
        let repository = &self.service.repository;

        let books = self
            .service
            .step("reconcile.queued_books", || repository.queued_books())
            .await?;
        for book_id in books.iter().filter(|book| !in_flight.books.contains(*book)) {
            let entries = self
                .service
                .step("reconcile.queue", || repository.queue_entries(book_id))
                .await?;
            for entry in entries {
                if in_flight.reservations.contains(&entry.reservation_id) {
                    continue;
                }
                let reservation = self
                    .service
                    .step("reconcile.ledger", || {
                        repository.get_reservation(&entry.reservation_id)
                    })
                    .await?;
                let live = reservation.is_some_and(|reservation| {
                    reservation.status.is_queued() && reservation.book_id == *book_id
                });
                if !live && !self.journal_opened(&entry.reservation_id).await? {
                    self.service
                        .step("reconcile.remove_entry", || {
                            repository.remove_queue_entry(book_id, &entry.reservation_id)
                        })
                        .await?;
                    tracing::info!(%book_id, reservation_id = %entry.reservation_id, "Removed orphan queue entry");
                    report.removed_orphan_entries += 1;
                }
            }
        }

        let reservations = self
            .service
            .step("reconcile.ledger_scan", || repository.all_reservations())
            .await?;
        for reservation in reservations.iter().filter(|reservation| {
            reservation.status.is_queued()
                && !in_flight.reservations.contains(&reservation.id)
                && !in_flight.books.contains(&reservation.book_id)
        }) {
            let entries = self
                .service
                .step("reconcile.queue", || {
                    repository.queue_entries(&reservation.book_id)
                })
                .await?;
            if entries
                .iter()
                .any(|entry| entry.reservation_id == reservation.id)
            {
                continue;
            }
            // the scan is not a snapshot, the record may have moved on since
            let current = self
                .service
                .step("reconcile.ledger", || {
                    repository.get_reservation(&reservation.id)
                })
                .await?;
            if !current.is_some_and(|current| current.status.is_queued())
                || self.journal_opened(&reservation.id).await?
            {
                continue;
            }
            let entry = QueueEntry::for_reservation(reservation);
            self.service
                .step("reconcile.restore_entry", || {
                    repository.put_queue_entry(&reservation.book_id, &entry)
                })
                .await?;
            tracing::info!(reservation_id = %reservation.id, "Restored missing queue entry");
            report.restored_entries += 1;
        }
        Ok(())
    }

    async fn remove_stale_markers(
        &self,
        in_flight: &InFlight,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReservationError> {
        let repository = &self.service.repository;
        let markers = self
            .service
            .step("reconcile.markers", || repository.all_book_markers())
            .await?;

        for (user_id, book_id, reservation_id) in markers {
            if in_flight.reservations.contains(&reservation_id) {
                continue;
            }
            let reservation = self
                .service
                .step("reconcile.ledger", || repository.get_reservation(&reservation_id))
                .await?;
            let live = reservation.is_some_and(|reservation| {
                reservation.status.is_active()
                    && reservation.user_id == user_id
                    && reservation.book_id == book_id
            });
            if !live && !self.journal_opened(&reservation_id).await? {
                self.service
                    .step("reconcile.release_marker", || {
                        repository.release_book_marker(&user_id, &book_id, &reservation_id)
                    })
                    .await?;
                tracing::info!(%user_id, %book_id, %reservation_id, "Removed stale marker");
                report.removed_stale_markers += 1;
            }
        }
        Ok(())
    }

    async fn recount_books(
        &self,
        in_flight: &InFlight,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReservationError> {
        let repository = &self.service.repository;
        let mut books: BTreeSet<BookId> = self
            .service
            .step("reconcile.queued_books", || repository.queued_books())
            .await?
            .into_iter()
            .collect();
        books.extend(
            self.service
                .step("reconcile.status_books", || repository.books_with_status())
                .await?,
        );

        let live_after = self.live_after();
        for book_id in books.iter().filter(|book| !in_flight.books.contains(*book)) {
            match self.service.recount_queue(book_id, live_after).await? {
                Recount::Corrected => {
                    tracing::warn!(%book_id, "Corrected drifted queue count");
                    report.corrected_books.push(book_id.clone());
                }
                Recount::Busy => {
                    tracing::debug!(%book_id, "Book busy, recount left for a later pass")
                }
                Recount::Unchanged => {}
            }
        }
        Ok(())
    }

    /// Rebuilds every summary from the individual ratings
    async fn recompute_rating_summaries(
        &self,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReservationError> {
        let repository = &self.service.repository;
        let books = self
            .service
            .step("reconcile.rated_books", || repository.rated_books())
            .await?;

        for book_id in books {
            let ratings = self
                .service
                .step("reconcile.ratings", || repository.book_ratings(&book_id))
                .await?;
            let total = ratings.len() as u32;
            let sum = ratings
                .iter()
                .map(|(_, rating)| u32::from(rating.rating))
                .sum();
            let summary = RatingSummary {
                total,
                sum,
                average: average(sum, total),
            };
            let changed = self
                .service
                .step("reconcile.rating_summary", || {
                    repository.set_rating_summary(&book_id, &summary)
                })
                .await?;
            if changed {
                tracing::warn!(%book_id, "Corrected rating summary");
                report.corrected_rating_summaries.push(book_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::api::{BookRating, ReservationStatus};
    use crate::document_store::DocumentStore;
    use crate::identity::Caller;
    use crate::testing::{harness, Harness, START};

    const GRACE: Duration = Duration::from_secs(60);

    fn reconciler(harness: &Harness) -> Reconciler {
        Reconciler::new(harness.service.clone(), GRACE)
    }

    fn past_grace(harness: &Harness) {
        harness.clock.advance(ChronoDuration::seconds(61));
    }

    #[tokio::test]
    /// A healthy store needs no repairs
    async fn test_nothing_to_do() {
        let harness = harness();
        harness.reserve("u", "b1").await;
        harness.reserve("v", "b1").await;
        harness
            .service
            .rate_book(&Caller::user("u"), "b1", 4)
            .await
            .unwrap();

        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report, ReconciliationReport::default());
    }

    #[tokio::test]
    /// A reserve that died after the ledger write is rolled forward
    async fn test_interrupted_reserve_rolls_forward() {
        let harness = harness();
        harness.store.fail_writes("bookQueues/", 10);
        assert!(harness
            .service
            .reserve(&Caller::user("u"), "b1")
            .await
            .is_err());
        harness.store.heal();

        // still inside the grace period
        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report, ReconciliationReport::default());
        assert_eq!(harness.queue_len("b1").await, 0);

        past_grace(&harness);
        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.resumed_operations, 1);
        assert_eq!(harness.queue_len("b1").await, 1);
        assert_eq!(harness.queue_count("b1").await, 1);
        assert!(harness
            .service
            .repository()
            .pending_operations()
            .await
            .unwrap()
            .is_empty());

        let reservation_id = harness
            .service
            .list_reservations("u", &[])
            .await
            .unwrap()
            .remove(0)
            .id;
        assert_eq!(
            harness
                .service
                .compute_queue_position("b1", &reservation_id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    /// A reserve that never reached the ledger is rolled back, freeing the book
    async fn test_interrupted_reserve_rolls_back() {
        let harness = harness();
        harness
            .store
            .set(
                "pendingOperations/lost",
                json!({"operation": "reserve", "userId": "u", "bookId": "b1",
                       "createdAt": START, "startedAt": START}),
            )
            .await
            .unwrap();
        harness
            .store
            .set("userBookReservations/u/b1", json!("lost"))
            .await
            .unwrap();
        assert!(harness
            .service
            .reserve(&Caller::user("u"), "b1")
            .await
            .is_err());

        past_grace(&harness);
        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.rolled_back_operations, 1);
        assert_eq!(
            harness.service.repository().book_marker("u", "b1").await.unwrap(),
            None
        );
        harness.reserve("u", "b1").await;
    }

    #[tokio::test]
    /// An interrupted cancel is finished and the counter recounted
    async fn test_interrupted_cancel_is_finished() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.reserve("v", "b1").await;
        harness.store.fail_writes("bookStatus/", 10);
        assert!(harness.service.cancel(&Caller::user("u"), &u).await.is_err());
        harness.store.heal();

        past_grace(&harness);
        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.resumed_operations, 1);
        assert_eq!(harness.queue_count("b1").await, 1);
        assert!(matches!(
            harness.service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::NotFound(_))
        ));
    }

    #[tokio::test]
    /// An approval that died before the aggregate was updated gets its loan
    async fn test_interrupted_approve_rolls_forward() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.store.fail_writes("bookStatus/", 10);
        assert!(matches!(
            harness.service.approve(&u, START + 86_400_000).await,
            Err(ReservationError::PartialWriteFailure { .. })
        ));
        harness.store.heal();
        assert_eq!(harness.queue_count("b1").await, 1);

        past_grace(&harness);
        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.resumed_operations, 1);
        let status = harness.service.get_book_status("b1").await.unwrap();
        assert!(!status.available);
        assert_eq!(status.queue_count, 0);
        assert_eq!(status.current_reservation_id.as_deref(), Some(u.as_str()));
        assert_eq!(
            status.current_loan.map(|loan| loan.expected_return),
            Some(START + 86_400_000)
        );
        assert_eq!(harness.queue_len("b1").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Passes running during reserves and cancels never leave the counter off
    async fn test_reconcile_alongside_traffic() {
        let harness = harness();
        let reconciler = Arc::new(reconciler(&harness));
        let background = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                for _ in 0..30 {
                    reconciler.reconcile().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let tasks: Vec<_> = (0..24)
            .map(|i| {
                let service = harness.service.clone();
                tokio::spawn(async move {
                    let caller = Caller::user(format!("user-{i}"));
                    let reservation_id = service.reserve(&caller, "b1").await.unwrap();
                    if i % 3 == 0 {
                        service.cancel(&caller, &reservation_id).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        background.await.unwrap();

        assert_eq!(harness.queue_len("b1").await, 16);
        assert_eq!(harness.queue_count("b1").await, 16);
    }

    #[tokio::test]
    /// Orphan entries, missing entries, stale markers and a drifted counter
    async fn test_repairs_drift() {
        let harness = harness();
        let kept = harness.reserve("u", "b1").await;
        let lost_entry = harness.reserve("v", "b1").await;
        let repository = harness.service.repository();

        repository.remove_queue_entry("b1", &lost_entry).await.unwrap();
        harness
            .store
            .set(
                "bookQueues/b1/ghost",
                json!({"userId": "w", "createdAt": START, "status": "pending"}),
            )
            .await
            .unwrap();
        harness
            .store
            .set("userBookReservations/w/b2", json!("ghost"))
            .await
            .unwrap();
        repository
            .update_book_status("b1", |status| status.queue_count = 7)
            .await
            .unwrap();

        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.removed_orphan_entries, 1);
        assert_eq!(report.restored_entries, 1);
        assert_eq!(report.removed_stale_markers, 1);
        assert_eq!(report.corrected_books, vec!["b1".to_string()]);

        assert_eq!(harness.queue_count("b1").await, 2);
        assert_eq!(
            harness.service.compute_queue_position("b1", &kept).await.unwrap(),
            1
        );
        assert_eq!(
            harness
                .service
                .compute_queue_position("b1", &lost_entry)
                .await
                .unwrap(),
            2
        );

        let second = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(second, ReconciliationReport::default());
    }

    #[tokio::test]
    /// Queue entries of approved reservations are orphans
    async fn test_entry_of_approved_reservation_is_removed() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness
            .service
            .approve(&u, START + 86_400_000)
            .await
            .unwrap();
        let repository = harness.service.repository();
        let mut reservation = repository.get_reservation(&u).await.unwrap().unwrap();
        reservation.status = ReservationStatus::Pending;
        repository
            .put_queue_entry("b1", &QueueEntry::for_reservation(&reservation))
            .await
            .unwrap();

        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.removed_orphan_entries, 1);
        assert_eq!(harness.queue_count("b1").await, 0);
    }

    #[tokio::test]
    /// A summary that missed an update is rebuilt from the ratings
    async fn test_rating_summary_is_recomputed() {
        let harness = harness();
        harness
            .service
            .rate_book(&Caller::user("u"), "b1", 5)
            .await
            .unwrap();
        harness
            .service
            .repository()
            .swap_rating(
                "b1",
                "v",
                &BookRating {
                    rating: 2,
                    created_at: START,
                },
            )
            .await
            .unwrap();

        let report = reconciler(&harness).reconcile().await.unwrap();
        assert_eq!(report.corrected_rating_summaries, vec!["b1".to_string()]);
        let summary = harness.service.rating_summary("b1").await.unwrap();
        assert_eq!((summary.total, summary.sum), (2, 7));
        assert_eq!(summary.average, 3.5);
    }
}
