//! Reservation lifecycle: reserve, cancel and the read models built on the
//! four denormalized views of a reservation (ledger, per-book queue, book
//! aggregate, user index).
//!
//! No store transaction spans more than one path, so reserve and cancel run
//! as short sagas. A journal record under `pendingOperations/` is written
//! before the ledger is touched and removed after the last step. Every step
//! is idempotent and retried with backoff; whatever still fails is finished
//! by the reconciler from the journal.
//!
//! Cancel removes the ledger record first, in a transaction that only
//! succeeds while the record is active. Of two concurrent cancels only the
//! one that removed it unlinks the views and moves the counter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;

use crate::api::{
    BookId, BookMeta, BookStatus, CurrentLoan, NotificationKind, OverdueLoan, PendingOperation,
    QueueEntry, Reservation, ReservationId, ReservationOverview, ReservationStatus,
    SagaOperation, Timestamp, UserId,
};
use crate::availability::{
    derive_availability_text, derive_status_text, reservation_status_text,
};
use crate::book_catalog::BookCatalog;
use crate::clock::Clock;
use crate::document_store::{join_path, StoreError};
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::overdue::overdue_loan;
use crate::queue::{next_in_line, queue_position};
use crate::reservations_repository::{Collection, LedgerChange, ReservationsRepository};
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct ReservationService {
    pub(crate) repository: Arc<ReservationsRepository>,
    pub(crate) catalog: Arc<dyn BookCatalog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retry: RetryPolicy,
    /// Milliseconds before a user's repeated cancel takes over a journal
    pub(crate) resume_after: Timestamp,
}

/// What a recount did to `queueCount`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recount {
    Unchanged,
    Corrected,
    /// Another operation has the book open, nothing was written
    Busy,
}

/// A cancel finds an orphaned cancel journal resumable after this long
const DEFAULT_RESUME_AFTER: Timestamp = 60_000;

/// Maps a failed step after the ledger write to `PartialWriteFailure`
pub(crate) fn partial(
    reservation_id: &str,
    step: &'static str,
) -> impl FnOnce(StoreError) -> ReservationError {
    let reservation_id = reservation_id.to_string();
    move |source| ReservationError::PartialWriteFailure {
        reservation_id,
        step,
        source,
    }
}

impl ReservationService {
    pub fn new(
        repository: Arc<ReservationsRepository>,
        catalog: Arc<dyn BookCatalog>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            catalog,
            clock,
            retry,
            resume_after: DEFAULT_RESUME_AFTER,
        }
    }

    /// How long a cancel journal must be idle before a repeated cancel of
    /// the same reservation finishes it
    pub fn with_resume_after(mut self, resume_after: Duration) -> Self {
        self.resume_after = resume_after.as_millis().try_into().unwrap_or(Timestamp::MAX);
        self
    }

    pub fn repository(&self) -> &Arc<ReservationsRepository> {
        &self.repository
    }

    /// One store step, retried while the failure is transient
    pub(crate) async fn step<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_with_backoff(&self.retry, name, operation).await
    }

    /// Creates a pending reservation of `book_id` for the caller
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        caller: &Caller,
        book_id: &str,
    ) -> Result<ReservationId, ReservationError> {
        let user_id = caller.user_id()?;
        join_path(&[book_id])?;

        let existing = self
            .step("reserve.scan_index", || {
                self.repository.user_reservations(user_id)
            })
            .await?;
        if existing
            .iter()
            .any(|reservation| reservation.book_id == book_id && reservation.status.is_active())
        {
            return Err(ReservationError::DuplicateActiveReservation(
                book_id.to_string(),
            ));
        }

        let stale_marker = self.stale_marker(user_id, book_id).await?;

        let now = self.clock.now_millis();
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            status: ReservationStatus::Pending,
            created_at: now,
            approved_at: None,
            returned_at: None,
        };
        let reservation_id = reservation.id.as_str();

        // a marker only ever points at a ledger record or a journal
        let journal = PendingOperation {
            operation: SagaOperation::Reserve,
            reservation_id: reservation.id.clone(),
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            created_at: now,
            started_at: now,
            expected_return: None,
        };
        self.step("reserve.journal", || {
            self.repository.put_pending_operation(&journal)
        })
        .await?;

        let claimed = self
            .step("reserve.claim_marker", || {
                self.repository.claim_book_marker(
                    user_id,
                    book_id,
                    reservation_id,
                    stale_marker.as_deref(),
                )
            })
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(user_id, book_id, "Lost the marker race to another reservation");
                self.close_journal(reservation_id).await;
                return Err(ReservationError::DuplicateActiveReservation(
                    book_id.to_string(),
                ));
            }
            Err(err) => {
                self.abandon_reservation(&reservation).await;
                return Err(err.into());
            }
        }

        if let Err(err) = self
            .step("reserve.ledger", || {
                self.repository.put_reservation(&reservation)
            })
            .await
        {
            self.abandon_reservation(&reservation).await;
            return Err(err.into());
        }

        self.step("reserve.user_index", || {
            self.repository.add_user_reservation(user_id, reservation_id)
        })
        .await
        .map_err(partial(reservation_id, "user_index"))?;

        let entry = QueueEntry::for_reservation(&reservation);
        self.step("reserve.queue_entry", || {
            self.repository.put_queue_entry(book_id, &entry)
        })
        .await
        .map_err(partial(reservation_id, "queue_entry"))?;

        let status = self
            .step("reserve.queue_count", || {
                self.repository
                    .update_book_status(book_id, |status| status.queue_count += 1)
            })
            .await
            .map_err(partial(reservation_id, "queue_count"))?;

        self.close_journal(reservation_id).await;
        tracing::info!(
            reservation_id,
            user_id,
            book_id,
            queue_count = status.queue_count,
            "Reservation created"
        );
        self.emit(NotificationKind::ReservationCreated, &reservation)
            .await;
        Ok(reservation.id)
    }

    /// The marker value a new reservation may take over: a reservation id
    /// whose ledger record is gone or no longer active, with no saga in flight
    async fn stale_marker(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<ReservationId>, ReservationError> {
        let Some(marked) = self
            .step("reserve.read_marker", || {
                self.repository.book_marker(user_id, book_id)
            })
            .await?
        else {
            return Ok(None);
        };

        let reservation = self
            .step("reserve.read_marked", || {
                self.repository.get_reservation(&marked)
            })
            .await?;
        if let Some(reservation) = reservation {
            if reservation.status.is_active() {
                return Err(ReservationError::DuplicateActiveReservation(
                    book_id.to_string(),
                ));
            }
        } else if self
            .step("reserve.read_marked_journal", || {
                self.repository.pending_operation(&marked)
            })
            .await?
            .is_some()
        {
            // another device is half way through reserving this book
            return Err(ReservationError::DuplicateActiveReservation(
                book_id.to_string(),
            ));
        }

        tracing::warn!(user_id, book_id, stale = %marked, "Taking over stale reservation marker");
        Ok(Some(marked))
    }

    /// Compensation when the reservation never made it into the ledger
    async fn abandon_reservation(&self, reservation: &Reservation) {
        let cleanup = async {
            self.repository
                .remove_reservation(Collection::Canonical, &reservation.id)
                .await?;
            self.repository
                .release_book_marker(&reservation.user_id, &reservation.book_id, &reservation.id)
                .await?;
            self.repository
                .remove_pending_operation(&reservation.id)
                .await
        };
        if let Err(err) = cleanup.await {
            tracing::error!(
                reservation_id = %reservation.id,
                "Compensation failed, left for reconciliation: {}",
                err
            );
        }
    }

    pub(crate) async fn close_journal(&self, reservation_id: &str) {
        if let Err(err) = self
            .step("journal.close", || {
                self.repository.remove_pending_operation(reservation_id)
            })
            .await
        {
            tracing::warn!(reservation_id, "Failed to close journal: {}", err);
        }
    }

    /// Cancels an active reservation of the caller. Repeating a cancel that
    /// was interrupted finishes it; repeating a completed one is `NotFound`.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(
        &self,
        caller: &Caller,
        reservation_id: &str,
    ) -> Result<(), ReservationError> {
        let user_id = caller.user_id()?;

        let found = self
            .step("cancel.read_ledger", || {
                self.repository.find_reservation(reservation_id)
            })
            .await?;
        let Some((collection, reservation)) = found else {
            return self.resume_cancel(user_id, reservation_id).await;
        };

        if reservation.user_id != user_id {
            return Err(ReservationError::Forbidden(reservation_id.to_string()));
        }
        if !reservation.status.is_active() {
            return Err(ReservationError::InvalidTransition {
                id: reservation.id,
                from: reservation.status,
            });
        }

        let journal = PendingOperation {
            operation: SagaOperation::Cancel,
            reservation_id: reservation.id.clone(),
            user_id: reservation.user_id.clone(),
            book_id: reservation.book_id.clone(),
            created_at: reservation.created_at,
            started_at: self.clock.now_millis(),
            expected_return: None,
        };
        let owned = self
            .step("cancel.journal", || {
                self.repository.open_pending_operation(&journal)
            })
            .await?;

        // the ledger delete decides which of two concurrent cancels goes on
        let change = match self
            .step("cancel.ledger", || {
                self.repository.take_reservation(collection, reservation_id)
            })
            .await
        {
            Ok(change) => change,
            Err(err) => {
                if owned {
                    self.close_journal(reservation_id).await;
                }
                return Err(err.into());
            }
        };
        let removed = match change {
            LedgerChange::Applied(removed) => removed,
            LedgerChange::Missing => {
                if owned {
                    self.close_journal(reservation_id).await;
                }
                return Err(ReservationError::NotFound(format!(
                    "Reservation {reservation_id}"
                )));
            }
            LedgerChange::Refused(from) => {
                if owned {
                    self.close_journal(reservation_id).await;
                }
                return Err(ReservationError::InvalidTransition {
                    id: reservation_id.to_string(),
                    from,
                });
            }
        };

        self.unlink_reservation(&journal)
            .await
            .map_err(|(step, err)| partial(reservation_id, step)(err))?;

        let book_id = removed.book_id.as_str();
        let status = if removed.status.is_queued() {
            self.step("cancel.queue_count", || {
                self.repository.update_book_status(book_id, |status| {
                    status.queue_count = status.queue_count.saturating_sub(1)
                })
            })
            .await
        } else {
            self.step("cancel.release_loan", || {
                self.repository.update_book_status(book_id, |status| {
                    release_loan_hold(status, reservation_id)
                })
            })
            .await
        }
        .map_err(partial(reservation_id, "book_status"))?;

        if owned {
            self.close_journal(reservation_id).await;
        }
        tracing::info!(
            reservation_id,
            user_id,
            book_id,
            queue_count = status.queue_count,
            "Reservation cancelled"
        );
        self.emit(NotificationKind::ReservationCancelled, &removed)
            .await;
        Ok(())
    }

    /// A cancel of a reservation with no ledger record. Only a journal the
    /// original request has stopped tending is finished here; a younger one
    /// belongs to a cancel that is still running.
    async fn resume_cancel(
        &self,
        user_id: &str,
        reservation_id: &str,
    ) -> Result<(), ReservationError> {
        let not_found = || ReservationError::NotFound(format!("Reservation {reservation_id}"));
        let Some(journal) = self
            .step("cancel.read_journal", || {
                self.repository.pending_operation(reservation_id)
            })
            .await?
        else {
            return Err(not_found());
        };
        if journal.operation != SagaOperation::Cancel {
            return Err(not_found());
        }
        if journal.user_id != user_id {
            return Err(ReservationError::Forbidden(reservation_id.to_string()));
        }

        let live_after = self.clock.now_millis().saturating_sub(self.resume_after);
        if journal.started_at >= live_after {
            tracing::info!(reservation_id, "Cancel still in flight");
            return Err(not_found());
        }
        tracing::info!(reservation_id, "Resuming interrupted cancel");
        self.settle(&journal, live_after).await?;
        Ok(())
    }

    /// Index, queue entry and marker deletes of a cancelled reservation
    async fn unlink_reservation(
        &self,
        journal: &PendingOperation,
    ) -> Result<(), (&'static str, StoreError)> {
        let (user_id, book_id, reservation_id) = (
            journal.user_id.as_str(),
            journal.book_id.as_str(),
            journal.reservation_id.as_str(),
        );
        self.step("cancel.user_index", || {
            self.repository
                .remove_user_reservation(user_id, reservation_id)
        })
        .await
        .map_err(|err| ("user_index", err))?;
        self.step("cancel.queue_entry", || {
            self.repository.remove_queue_entry(book_id, reservation_id)
        })
        .await
        .map_err(|err| ("queue_entry", err))?;
        self.step("cancel.marker", || {
            self.repository
                .release_book_marker(user_id, book_id, reservation_id)
        })
        .await
        .map_err(|err| ("marker", err))
    }

    /// Brings the user index, queue entry, marker and loan of an abandoned
    /// operation in line with the ledger record, whatever state the
    /// operation died in, then recounts the book and closes the journal.
    /// Journals that started before `live_after` count as abandoned. While
    /// a live one touches the book the recount is skipped and the journal
    /// stays open for a later pass.
    ///
    /// Returns the ledger record, `None` when the reservation is gone.
    pub(crate) async fn settle(
        &self,
        journal: &PendingOperation,
        live_after: Timestamp,
    ) -> Result<Option<Reservation>, ReservationError> {
        let (user_id, book_id, reservation_id) = (
            journal.user_id.as_str(),
            journal.book_id.as_str(),
            journal.reservation_id.as_str(),
        );
        let reservation = self
            .step("settle.ledger", || self.repository.get_reservation(reservation_id))
            .await?;

        match &reservation {
            Some(reservation) => {
                self.step("settle.user_index", || {
                    self.repository.add_user_reservation(user_id, reservation_id)
                })
                .await?;
                if reservation.status.is_queued() {
                    let entry = QueueEntry::for_reservation(reservation);
                    self.step("settle.queue_entry", || {
                        self.repository.put_queue_entry(book_id, &entry)
                    })
                    .await?;
                } else {
                    self.step("settle.queue_entry", || {
                        self.repository.remove_queue_entry(book_id, reservation_id)
                    })
                    .await?;
                }
                if reservation.status.is_active() {
                    let claimed = self
                        .step("settle.marker", || {
                            self.repository
                                .claim_book_marker(user_id, book_id, reservation_id, None)
                        })
                        .await?;
                    if !claimed {
                        tracing::warn!(reservation_id, "Marker held by another reservation");
                    }
                } else {
                    self.step("settle.marker", || {
                        self.repository
                            .release_book_marker(user_id, book_id, reservation_id)
                    })
                    .await?;
                }
                match (reservation.status, journal.expected_return) {
                    (ReservationStatus::Approved, Some(expected_return)) => {
                        let loan = CurrentLoan {
                            user_id: user_id.to_string(),
                            borrowed_at: reservation.approved_at.unwrap_or(journal.started_at),
                            expected_return,
                        };
                        self.step("settle.loan", || {
                            self.repository.update_book_status(book_id, |status| {
                                if status.current_reservation_id.is_none() {
                                    status.available = false;
                                    status.current_reservation_id =
                                        Some(reservation_id.to_string());
                                    status.current_loan = Some(loan.clone());
                                }
                            })
                        })
                        .await?;
                    }
                    (ReservationStatus::Approved, None) => {}
                    _ => {
                        self.release_loan(book_id, reservation_id).await?;
                    }
                }
            }
            None => {
                self.unlink_reservation(journal)
                    .await
                    .map_err(|(_, err)| err)?;
                self.release_loan(book_id, reservation_id).await?;
            }
        }

        if self.recount_queue(book_id, live_after).await? == Recount::Busy {
            tracing::info!(reservation_id, book_id, "Book busy, journal left for a later pass");
            return Ok(reservation);
        }
        self.step("settle.close_journal", || {
            self.repository.remove_pending_operation(reservation_id)
        })
        .await?;
        Ok(reservation)
    }

    async fn release_loan(&self, book_id: &str, reservation_id: &str) -> Result<(), StoreError> {
        self.step("settle.release_loan", || {
            self.repository.update_book_status(book_id, |status| {
                release_loan_hold(status, reservation_id)
            })
        })
        .await?;
        Ok(())
    }

    /// Sets `queueCount` to the number of live queue entries. Nothing is
    /// written while an operation started at or after `live_after` has the
    /// book open, or when the counter moves during the count.
    pub(crate) async fn recount_queue(
        &self,
        book_id: &str,
        live_after: Timestamp,
    ) -> Result<Recount, StoreError> {
        if self.book_busy(book_id, live_after).await? {
            return Ok(Recount::Busy);
        }
        let seen = self
            .step("recount.book_status", || self.repository.book_status(book_id))
            .await?
            .map(|status| status.queue_count)
            .unwrap_or(0);
        let entries = self
            .step("recount.queue_entries", || {
                self.repository.queue_entries(book_id)
            })
            .await?;
        let count = entries
            .iter()
            .filter(|entry| entry.status.is_queued())
            .count() as u32;
        if count == seen {
            return Ok(Recount::Unchanged);
        }
        if self.book_busy(book_id, live_after).await? {
            return Ok(Recount::Busy);
        }
        let swapped = self
            .step("recount.queue_count", || {
                self.repository.set_queue_count(book_id, seen, count)
            })
            .await?;
        Ok(if swapped {
            Recount::Corrected
        } else {
            Recount::Busy
        })
    }

    async fn book_busy(&self, book_id: &str, live_after: Timestamp) -> Result<bool, StoreError> {
        let journals = self
            .step("recount.journals", || {
                self.repository.book_pending_operations(book_id)
            })
            .await?;
        Ok(journals
            .iter()
            .any(|journal| journal.started_at >= live_after))
    }

    /// 1-based position of the reservation in the book's queue, 0 when it is
    /// not waiting
    pub async fn compute_queue_position(
        &self,
        book_id: &str,
        reservation_id: &str,
    ) -> Result<u32, ReservationError> {
        let entries = self
            .step("queue_position", || self.repository.queue_entries(book_id))
            .await?;
        Ok(queue_position(entries, reservation_id))
    }

    /// The reservation that would be served when a copy frees up
    pub async fn next_in_line(&self, book_id: &str) -> Result<Option<QueueEntry>, ReservationError> {
        let entries = self
            .step("next_in_line", || self.repository.queue_entries(book_id))
            .await?;
        Ok(next_in_line(entries))
    }

    /// Approved reservations of the user, one per book, most recent first
    pub async fn get_user_books(&self, user_id: &str) -> Result<Vec<Reservation>, ReservationError> {
        Ok(self
            .list_reservations(user_id, &[ReservationStatus::Approved])
            .await?
            .into_iter()
            .unique_by(|reservation| reservation.book_id.clone())
            .collect())
    }

    /// The user's reservations with one of `statuses` (any when empty), most
    /// recent first
    pub async fn list_reservations(
        &self,
        user_id: &str,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<Reservation>, ReservationError> {
        let reservations = self
            .step("list_reservations", || {
                self.repository.user_reservations(user_id)
            })
            .await?;
        Ok(reservations
            .into_iter()
            .filter(|reservation| statuses.is_empty() || statuses.contains(&reservation.status))
            .sorted_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .collect())
    }

    pub async fn get_book_meta(&self, book_id: &str) -> Result<BookMeta, ReservationError> {
        match self.catalog.book_meta(book_id).await {
            Ok(Some(meta)) => Ok(meta),
            Ok(None) => Err(ReservationError::NotFound(format!("Book {book_id}"))),
            Err(err) => {
                tracing::error!(book_id, "Catalog lookup failed: {:#}", err);
                Err(ReservationError::CatalogUnavailable(err.to_string()))
            }
        }
    }

    /// Missing aggregates read as an available book with an empty queue
    pub async fn get_book_status(&self, book_id: &str) -> Result<BookStatus, ReservationError> {
        Ok(self
            .step("book_status", || self.repository.book_status(book_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn is_book_reserved_by_user(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<bool, ReservationError> {
        Ok(self
            .step("book_marker", || self.repository.book_marker(user_id, book_id))
            .await?
            .is_some())
    }

    /// Rows of the "my reservations" screen. Missing catalog data leaves the
    /// title and cover empty instead of failing the whole list.
    pub async fn reservation_overview(
        &self,
        user_id: &str,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<ReservationOverview>, ReservationError> {
        let mut rows = Vec::new();
        for reservation in self.list_reservations(user_id, statuses).await? {
            let meta = self
                .get_book_meta(&reservation.book_id)
                .await
                .map_err(|err| {
                    tracing::warn!(book_id = %reservation.book_id, "No catalog data: {}", err);
                })
                .ok();
            let status = self.get_book_status(&reservation.book_id).await?;
            let queue_position = if reservation.status.is_queued() {
                self.compute_queue_position(&reservation.book_id, &reservation.id)
                    .await?
            } else {
                0
            };
            rows.push(ReservationOverview {
                title: meta.as_ref().map(|meta| meta.title.clone()),
                cover: meta
                    .map(|meta| meta.cover)
                    .filter(|cover| !cover.is_empty()),
                status_text: reservation_status_text(reservation.status).to_string(),
                availability_text: derive_availability_text(&status, reservation.status, user_id)
                    .to_string(),
                book_status_text: derive_status_text(&status).to_string(),
                queue_position,
                reservation_status: reservation.status,
                reservation_id: reservation.id,
                book_id: reservation.book_id,
                created_at: reservation.created_at,
            });
        }
        Ok(rows)
    }

    /// Loans of the caller past their expected return, recomputed every call
    pub async fn overdue_loans(&self, caller: &Caller) -> Result<Vec<OverdueLoan>, ReservationError> {
        let user_id = caller.user_id()?;
        let now = self.clock.now_millis();
        let mut overdue = Vec::new();
        for reservation in self.get_user_books(user_id).await? {
            let status = self.get_book_status(&reservation.book_id).await?;
            overdue.extend(overdue_loan(&reservation, &status, user_id, now));
        }
        Ok(overdue)
    }

    /// Books of the user that are approved for them and not finished yet
    pub async fn currently_reading(&self, user_id: &str) -> Result<Vec<BookId>, ReservationError> {
        let progress = self
            .step("user_progress", || self.repository.user_progress(user_id))
            .await?;
        let finished: Vec<&BookId> = progress
            .iter()
            .filter(|(_, progress)| progress.finished)
            .map(|(book_id, _)| book_id)
            .collect();
        Ok(self
            .get_user_books(user_id)
            .await?
            .into_iter()
            .map(|reservation| reservation.book_id)
            .filter(|book_id| !finished.contains(&book_id))
            .collect())
    }

    pub(crate) fn owner_check(
        caller_id: &str,
        owner: &UserId,
        resource_id: &str,
    ) -> Result<(), ReservationError> {
        if caller_id == owner {
            Ok(())
        } else {
            Err(ReservationError::Forbidden(resource_id.to_string()))
        }
    }
}

/// Clears the aggregate's loan if it belongs to `reservation_id`
pub(crate) fn release_loan_hold(status: &mut BookStatus, reservation_id: &str) {
    if status.current_reservation_id.as_deref() == Some(reservation_id) {
        status.current_reservation_id = None;
        status.current_loan = None;
        status.available = true;
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::api::{BookStatusResponse, NotificationStatus};
    use crate::document_store::DocumentStore;
    use crate::testing::{book, harness, harness_with_legacy, START};

    const DAY: i64 = 86_400_000;

    #[tokio::test]
    /// U reserves, V reserves, U cancels: counter and positions follow
    async fn test_reserve_reserve_cancel_scenario() {
        let harness = harness();
        let service = &harness.service;

        let u = harness.reserve("u", "b1").await;
        assert_eq!(harness.queue_count("b1").await, 1);
        assert_eq!(service.compute_queue_position("b1", &u).await.unwrap(), 1);
        assert_eq!(
            service.repository().get_reservation(&u).await.unwrap().unwrap().status,
            ReservationStatus::Pending
        );

        let v = harness.reserve("v", "b1").await;
        assert_eq!(harness.queue_count("b1").await, 2);
        assert_eq!(service.compute_queue_position("b1", &v).await.unwrap(), 2);

        service.cancel(&Caller::user("u"), &u).await.unwrap();
        assert_eq!(harness.queue_count("b1").await, 1);
        assert_eq!(service.compute_queue_position("b1", &v).await.unwrap(), 1);
        assert_eq!(service.compute_queue_position("b1", &u).await.unwrap(), 0);
        assert_eq!(harness.queue_len("b1").await, 1);
        assert!(!service.is_book_reserved_by_user("u", "b1").await.unwrap());
        assert!(service.is_book_reserved_by_user("v", "b1").await.unwrap());
        assert!(harness.service.repository().pending_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    /// A second reserve of the same book fails before writing anything
    async fn test_duplicate_reservation_writes_nothing() {
        let harness = harness();
        harness.reserve("u", "b1").await;
        let before = harness.store.dump();

        let result = harness.service.reserve(&Caller::user("u"), "b1").await;
        assert!(matches!(
            result,
            Err(ReservationError::DuplicateActiveReservation(book_id)) if book_id == "b1"
        ));
        assert_eq!(harness.store.dump(), before);
        assert_eq!(harness.queue_count("b1").await, 1);

        // other books and other users are unaffected
        harness.reserve("u", "b2").await;
        harness.reserve("v", "b1").await;
    }

    #[tokio::test]
    /// Cancelling somebody else's reservation is forbidden and changes nothing
    async fn test_cancel_by_other_user_is_forbidden() {
        let harness = harness();
        let reservation_id = harness.reserve("u", "b1").await;
        let before = harness.store.dump();

        assert!(matches!(
            harness.service.cancel(&Caller::user("v"), &reservation_id).await,
            Err(ReservationError::Forbidden(_))
        ));
        assert_eq!(harness.store.dump(), before);
    }

    #[tokio::test]
    /// The second cancel is NotFound and the counter moved exactly once
    async fn test_cancel_twice_decrements_once() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.reserve("v", "b1").await;

        harness.service.cancel(&Caller::user("u"), &u).await.unwrap();
        let after_first = harness.store.dump();
        assert!(matches!(
            harness.service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::NotFound(_))
        ));
        assert_eq!(harness.store.dump(), after_first);
        assert_eq!(harness.queue_count("b1").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Two devices cancelling the same reservation at once: one wins, the
    /// counter moves once
    async fn test_concurrent_cancels_decrement_once() {
        let harness = harness();
        for round in 0..20 {
            let book_id = format!("b{round}");
            let u = harness.reserve("u", &book_id).await;
            harness.reserve("v", &book_id).await;

            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let service = harness.service.clone();
                    let u = u.clone();
                    tokio::spawn(async move { service.cancel(&Caller::user("u"), &u).await })
                })
                .collect();
            let mut cancelled = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(()) => cancelled += 1,
                    Err(ReservationError::NotFound(_)) => {}
                    Err(err) => panic!("unexpected error {err}"),
                }
            }

            assert_eq!(cancelled, 1);
            assert_eq!(harness.queue_count(&book_id).await, 1);
            assert_eq!(harness.queue_len(&book_id).await, 1);
        }
        assert!(harness.service.repository().pending_operations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// A cancel racing an approval never leaves a loan or a queue slot behind
    async fn test_cancel_racing_approve() {
        let harness = harness();
        for round in 0..20 {
            let book_id = format!("b{round}");
            let u = harness.reserve("u", &book_id).await;
            harness.reserve("v", &book_id).await;

            let cancel = {
                let service = harness.service.clone();
                let u = u.clone();
                tokio::spawn(async move { service.cancel(&Caller::user("u"), &u).await })
            };
            let approve = {
                let service = harness.service.clone();
                let u = u.clone();
                tokio::spawn(async move { service.approve(&u, START + 14 * DAY).await })
            };
            cancel.await.unwrap().unwrap();
            match approve.await.unwrap() {
                Ok(()) | Err(ReservationError::NotFound(_)) => {}
                Err(err) => panic!("unexpected error {err}"),
            }

            assert_eq!(harness.service.repository().get_reservation(&u).await.unwrap(), None);
            let status = harness.service.get_book_status(&book_id).await.unwrap();
            assert!(status.available);
            assert_eq!(status.current_reservation_id, None);
            assert_eq!(status.queue_count, 1);
            assert_eq!(harness.queue_len(&book_id).await, 1);
        }
    }

    #[tokio::test]
    /// Approving or rejecting a record that is gone writes nothing back
    async fn test_transition_of_cancelled_reservation() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        let repository = harness.service.repository();
        repository
            .take_reservation(Collection::Canonical, &u)
            .await
            .unwrap();
        let before = harness.store.dump();

        let change = repository
            .transition_reservation(Collection::Canonical, &u, ReservationStatus::is_queued, |r| {
                r.status = ReservationStatus::Approved
            })
            .await
            .unwrap();
        assert_eq!(change, LedgerChange::Missing);
        assert!(matches!(
            harness.service.approve(&u, START + DAY).await,
            Err(ReservationError::NotFound(_))
        ));
        assert!(matches!(
            harness.service.reject(&u).await,
            Err(ReservationError::NotFound(_))
        ));
        assert_eq!(harness.store.dump(), before);
    }

    #[tokio::test]
    /// The recount holds off while another operation has the book open
    async fn test_recount_skips_book_with_live_operation() {
        let harness = harness();
        harness.reserve("u", "b1").await;
        let repository = harness.service.repository();
        repository
            .update_book_status("b1", |status| status.queue_count = 5)
            .await
            .unwrap();
        harness
            .store
            .set(
                "pendingOperations/live",
                json!({"operation": "reserve", "userId": "v", "bookId": "b1",
                       "createdAt": START, "startedAt": START}),
            )
            .await
            .unwrap();

        let now = harness.clock.now_millis();
        assert_eq!(
            harness.service.recount_queue("b1", now - 60_000).await.unwrap(),
            Recount::Busy
        );
        assert_eq!(harness.queue_count("b1").await, 5);

        // an older journal counts as abandoned
        assert_eq!(
            harness.service.recount_queue("b1", START + 1).await.unwrap(),
            Recount::Corrected
        );
        assert_eq!(harness.queue_count("b1").await, 1);
        assert_eq!(
            harness.service.recount_queue("b1", START + 1).await.unwrap(),
            Recount::Unchanged
        );
    }

    #[tokio::test]
    /// Earlier reservations always rank before later ones
    async fn test_queue_position_follows_creation_order() {
        let harness = harness();
        let ids = [
            harness.reserve("a", "b1").await,
            harness.reserve("b", "b1").await,
            harness.reserve("c", "b1").await,
        ];
        for (index, id) in ids.iter().enumerate() {
            assert_eq!(
                harness.service.compute_queue_position("b1", id).await.unwrap(),
                index as u32 + 1
            );
        }
        assert_eq!(
            harness.service.next_in_line("b1").await.unwrap().unwrap().reservation_id,
            ids[0]
        );
        assert_eq!(
            harness.service.compute_queue_position("b1", "unknown").await.unwrap(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Racing reserves of one user for one book leave exactly one active reservation
    async fn test_concurrent_reserves_of_same_user() {
        let harness = harness();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let service = harness.service.clone();
                tokio::spawn(async move { service.reserve(&Caller::user("u"), "b1").await })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(ReservationError::DuplicateActiveReservation(_)) => {}
                Err(err) => panic!("unexpected error {err}"),
            }
        }
        assert_eq!(created, 1);
        let active = harness
            .service
            .list_reservations("u", &ReservationStatus::ACTIVE)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(harness.queue_count("b1").await, 1);
        assert_eq!(harness.queue_len("b1").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Counter matches the live queue after concurrent reserves and cancels
    async fn test_queue_count_matches_entries() {
        let harness = harness();
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

        assert_eq!(harness.queue_len("b1").await, 16);
        assert_eq!(harness.queue_count("b1").await, 16);
    }

    #[tokio::test]
    async fn test_anonymous_caller_is_rejected_before_io() {
        let harness = harness();
        assert!(matches!(
            harness.service.reserve(&Caller::Anonymous, "b1").await,
            Err(ReservationError::Unauthenticated)
        ));
        assert!(matches!(
            harness.service.cancel(&Caller::Anonymous, "r1").await,
            Err(ReservationError::Unauthenticated)
        ));
        assert!(matches!(
            harness.service.reserve(&Caller::user("u"), "b1/evil").await,
            Err(ReservationError::InvalidRequest(_))
        ));
        assert!(harness.store.dump().is_empty());
    }

    #[tokio::test]
    /// A single transient failure is absorbed by the retry policy
    async fn test_transient_failure_is_retried() {
        let harness = harness();
        harness.store.fail_writes("bookQueues/", 1);
        harness.store.fail_writes("bookStatus/", 2);
        let reservation_id = harness.reserve("u", "b1").await;

        assert_eq!(harness.queue_count("b1").await, 1);
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
    /// Failing to write the ledger undoes the marker and the journal
    async fn test_ledger_failure_is_compensated() {
        let harness = harness();
        harness.store.fail_writes("reservations/", 3);

        let result = harness.service.reserve(&Caller::user("u"), "b1").await;
        assert!(matches!(result, Err(ReservationError::TransientStoreError(_))));
        assert!(harness.store.dump().is_empty());

        harness.store.heal();
        harness.reserve("u", "b1").await;
        assert_eq!(harness.queue_count("b1").await, 1);
    }

    #[tokio::test]
    /// Failing after the ledger write leaves the journal for roll forward
    async fn test_failure_after_ledger_is_partial() {
        let harness = harness();
        harness.store.fail_writes("bookQueues/", 10);

        let result = harness.service.reserve(&Caller::user("u"), "b1").await;
        let (reservation_id, step) = match result {
            Err(ReservationError::PartialWriteFailure {
                reservation_id,
                step,
                ..
            }) => (reservation_id, step),
            other => panic!("expected a partial write failure, got {other:?}"),
        };
        assert_eq!(step, "queue_entry");
        assert!(harness
            .service
            .repository()
            .pending_operation(&reservation_id)
            .await
            .unwrap()
            .is_some());

        // the reservation exists, so asking again is a duplicate rather than a second copy
        harness.store.heal();
        assert!(matches!(
            harness.service.reserve(&Caller::user("u"), "b1").await,
            Err(ReservationError::DuplicateActiveReservation(_))
        ));
    }

    #[tokio::test]
    /// A cancel interrupted after the ledger delete is finished by calling it again
    async fn test_interrupted_cancel_resumes() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.reserve("v", "b1").await;

        harness.store.fail_writes("bookStatus/", 10);
        assert!(matches!(
            harness.service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::PartialWriteFailure { .. })
        ));
        assert_eq!(harness.service.repository().get_reservation(&u).await.unwrap(), None);
        assert_eq!(harness.queue_count("b1").await, 2);

        harness.store.heal();
        assert!(matches!(
            harness.service.cancel(&Caller::user("v"), &u).await,
            Err(ReservationError::Forbidden(_))
        ));
        // until the journal goes idle it may belong to a cancel still running
        assert!(matches!(
            harness.service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::NotFound(_))
        ));
        assert_eq!(harness.queue_count("b1").await, 2);

        harness.clock.advance(Duration::seconds(61));
        harness.service.cancel(&Caller::user("u"), &u).await.unwrap();
        assert_eq!(harness.queue_count("b1").await, 1);
        assert!(matches!(
            harness.service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::NotFound(_))
        ));
        assert_eq!(harness.queue_count("b1").await, 1);
    }

    #[tokio::test]
    /// Approve, read the loan back, return, and reserve again
    async fn test_loan_lifecycle() {
        let harness = harness();
        let service = &harness.service;
        harness.catalog.insert_book("b1", book("Capitães da Areia", Some(280)));
        let u = harness.reserve("u", "b1").await;
        let v = harness.reserve("v", "b1").await;

        service.approve(&u, START + 14 * DAY).await.unwrap();
        let status = service.get_book_status("b1").await.unwrap();
        assert!(!status.available);
        assert_eq!(status.queue_count, 1);
        assert_eq!(status.current_reservation_id.as_deref(), Some(u.as_str()));
        assert_eq!(service.compute_queue_position("b1", &v).await.unwrap(), 1);
        assert!(matches!(
            service.approve(&u, START + 14 * DAY).await,
            Err(ReservationError::InvalidTransition { .. })
        ));

        let books = service.get_user_books("u").await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].id, u);

        let overview = service.reservation_overview("u", &[]).await.unwrap();
        assert_eq!(overview[0].title.as_deref(), Some("Capitães da Areia"));
        assert_eq!(overview[0].availability_text, "In your possession, return by 2024-03-29");
        let overview = service.reservation_overview("v", &[]).await.unwrap();
        assert_eq!(overview[0].queue_position, 1);
        assert_eq!(overview[0].availability_text, "Available on 2024-03-29");
        assert_eq!(overview[0].status_text, "Awaiting approval");
        assert_eq!(overview[0].book_status_text, "Loaned out");
        assert_eq!(BookStatusResponse::from(status).status_text, "Loaned out");

        service.mark_returned(&u).await.unwrap();
        let status = service.get_book_status("b1").await.unwrap();
        assert!(status.available);
        assert_eq!(status.current_loan, None);
        assert!(service.get_user_books("u").await.unwrap().is_empty());
        assert!(matches!(
            service.cancel(&Caller::user("u"), &u).await,
            Err(ReservationError::InvalidTransition {
                from: ReservationStatus::Returned,
                ..
            })
        ));

        harness.reserve("u", "b1").await;
        assert_eq!(harness.queue_count("b1").await, 2);
    }

    #[tokio::test]
    /// Rejection frees the marker and the queue slot
    async fn test_reject() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.service.reject(&u).await.unwrap();

        assert_eq!(harness.queue_count("b1").await, 0);
        assert_eq!(harness.queue_len("b1").await, 0);
        assert!(!harness.service.is_book_reserved_by_user("u", "b1").await.unwrap());
        assert!(matches!(
            harness.service.reject(&u).await,
            Err(ReservationError::InvalidTransition { .. })
        ));
        harness.reserve("u", "b1").await;
    }

    #[tokio::test]
    /// Cancelling an approved reservation gives the copy back
    async fn test_cancel_approved_releases_loan() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.service.approve(&u, START + DAY).await.unwrap();

        harness.service.cancel(&Caller::user("u"), &u).await.unwrap();
        let status = harness.service.get_book_status("b1").await.unwrap();
        assert_eq!(status, BookStatus::default());
    }

    #[tokio::test]
    /// Late loans are reported with started days rounded up
    async fn test_overdue_loans() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.reserve("u", "b2").await;
        harness.service.approve(&u, START + 2 * DAY).await.unwrap();
        let caller = Caller::user("u");

        assert!(harness.service.overdue_loans(&caller).await.unwrap().is_empty());
        harness.clock.advance(Duration::milliseconds(3 * DAY + DAY / 2));
        let overdue = harness.service.overdue_loans(&caller).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].reservation_id, u);
        assert_eq!(overdue[0].days_late, 2);
        assert!(harness
            .service
            .overdue_loans(&Caller::user("v"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    /// Reservations list newest first and filters by status
    async fn test_list_reservations_and_currently_reading() {
        let harness = harness();
        let first = harness.reserve("u", "b1").await;
        let second = harness.reserve("u", "b2").await;
        let third = harness.reserve("u", "b3").await;
        harness.service.approve(&first, START + DAY).await.unwrap();
        harness.service.approve(&third, START + DAY).await.unwrap();

        let all: Vec<ReservationId> = harness
            .service
            .list_reservations("u", &[])
            .await
            .unwrap()
            .into_iter()
            .map(|reservation| reservation.id)
            .collect();
        assert_eq!(all, vec![third.clone(), second.clone(), first.clone()]);

        let pending = harness
            .service
            .list_reservations("u", &[ReservationStatus::Pending])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        harness
            .service
            .repository()
            .update_reading_progress("u", "b3", |progress| progress.finished = true)
            .await
            .unwrap();
        assert_eq!(
            harness.service.currently_reading("u").await.unwrap(),
            vec!["b1".to_string()]
        );
    }

    #[tokio::test]
    /// A marker left behind by a vanished reservation is taken over, one
    /// belonging to a reserve still in flight is not
    async fn test_stale_marker_takeover() {
        let harness = harness();
        harness
            .store
            .set("userBookReservations/u/b1", json!("ghost"))
            .await
            .unwrap();
        let reservation_id = harness.reserve("u", "b1").await;
        assert_eq!(
            harness.service.repository().book_marker("u", "b1").await.unwrap(),
            Some(reservation_id)
        );

        harness
            .store
            .set("userBookReservations/u/b2", json!("in-flight"))
            .await
            .unwrap();
        harness
            .store
            .set(
                "pendingOperations/in-flight",
                json!({"operation": "reserve", "userId": "u", "bookId": "b2",
                       "createdAt": START, "startedAt": START}),
            )
            .await
            .unwrap();
        assert!(matches!(
            harness.service.reserve(&Caller::user("u"), "b2").await,
            Err(ReservationError::DuplicateActiveReservation(_))
        ));
    }

    #[tokio::test]
    /// Legacy records count for duplicates and are cancelled where they live
    async fn test_legacy_records() {
        let harness = harness_with_legacy(true);
        harness
            .store
            .set(
                "reservas/old-1",
                json!({"userId": "u", "livroId": "b1", "status": "pendente", "createdAt": START}),
            )
            .await
            .unwrap();
        harness
            .store
            .set("bookQueues/b1/old-1", json!({"userId": "u", "createdAt": START, "status": "pendente"}))
            .await
            .unwrap();
        harness
            .store
            .set("bookStatus/b1", json!({"available": true, "queueCount": 1}))
            .await
            .unwrap();

        assert!(matches!(
            harness.service.reserve(&Caller::user("u"), "b1").await,
            Err(ReservationError::DuplicateActiveReservation(_))
        ));
        assert_eq!(
            harness.service.compute_queue_position("b1", "old-1").await.unwrap(),
            1
        );

        harness.service.cancel(&Caller::user("u"), "old-1").await.unwrap();
        assert_eq!(harness.store.get("reservas/old-1").await.unwrap(), None);
        assert_eq!(harness.queue_count("b1").await, 0);
        harness.reserve("u", "b1").await;
    }

    #[tokio::test]
    /// Every transition leaves an unread notification for the owner
    async fn test_notifications() {
        let harness = harness();
        let u = harness.reserve("u", "b1").await;
        harness.service.cancel(&Caller::user("u"), &u).await.unwrap();

        let notifications = harness.service.notifications(&Caller::user("u")).await.unwrap();
        assert_eq!(notifications.len(), 2);
        assert!(notifications
            .iter()
            .all(|(_, notification)| notification.status == NotificationStatus::Unread));

        let (notification_id, _) = &notifications[0];
        assert!(matches!(
            harness
                .service
                .mark_notification_read(&Caller::user("v"), notification_id)
                .await,
            Err(ReservationError::Forbidden(_))
        ));
        harness
            .service
            .mark_notification_read(&Caller::user("u"), notification_id)
            .await
            .unwrap();
        assert!(matches!(
            harness
                .service
                .mark_notification_read(&Caller::user("u"), "missing")
                .await,
            Err(ReservationError::NotFound(_))
        ));
    }

    #[tokio::test]
    /// Unknown books are NotFound, a missing aggregate reads as available
    async fn test_book_meta_and_status() {
        let harness = harness();
        harness.catalog.insert_book("b1", book("Memórias Póstumas", Some(208)));
        assert_eq!(
            harness.service.get_book_meta("b1").await.unwrap().title,
            "Memórias Póstumas"
        );
        assert!(matches!(
            harness.service.get_book_meta("b2").await,
            Err(ReservationError::NotFound(_))
        ));
        assert_eq!(
            harness.service.get_book_status("b2").await.unwrap(),
            BookStatus::default()
        );
    }
}
