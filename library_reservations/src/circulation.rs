//! Librarian side transitions: approval, rejection and return. Each ledger
//! change is a transaction that requires the status it starts from, so a
//! record cancelled in the meantime is never written back. Approval and
//! rejection move the queue counter and run under a journal like reserve and
//! cancel do.

use crate::api::{
    CurrentLoan, NotificationKind, PendingOperation, Reservation, ReservationStatus,
    SagaOperation, Timestamp,
};
use crate::error::ReservationError;
use crate::lifecycle::{partial, release_loan_hold, ReservationService};
use crate::reservations_repository::{Collection, LedgerChange};

impl ReservationService {
    async fn load_for_transition(
        &self,
        reservation_id: &str,
        allowed: impl Fn(ReservationStatus) -> bool,
    ) -> Result<(Collection, Reservation), ReservationError> {
        let (collection, reservation) = self
            .step("circulation.read_ledger", || {
                self.repository.find_reservation(reservation_id)
            })
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("Reservation {reservation_id}")))?;
        if !allowed(reservation.status) {
            return Err(ReservationError::InvalidTransition {
                id: reservation.id,
                from: reservation.status,
            });
        }
        Ok((collection, reservation))
    }

    /// Opens a journal for a librarian transition. Returns whether this call
    /// owns it; an operation already in flight keeps its own.
    async fn open_transition_journal(
        &self,
        operation: SagaOperation,
        reservation: &Reservation,
        expected_return: Option<Timestamp>,
    ) -> Result<bool, ReservationError> {
        let journal = PendingOperation {
            operation,
            reservation_id: reservation.id.clone(),
            user_id: reservation.user_id.clone(),
            book_id: reservation.book_id.clone(),
            created_at: reservation.created_at,
            started_at: self.clock.now_millis(),
            expected_return,
        };
        Ok(self
            .step("circulation.journal", || {
                self.repository.open_pending_operation(&journal)
            })
            .await?)
    }

    /// Writes the transition, turning a lost race into the error the caller
    /// would have seen had it come second
    async fn commit_transition<F>(
        &self,
        collection: Collection,
        reservation_id: &str,
        from: impl Fn(ReservationStatus) -> bool + Send + Sync + Copy,
        apply: F,
    ) -> Result<Reservation, ReservationError>
    where
        F: Fn(&mut Reservation) + Send + Sync + Copy,
    {
        let change = self
            .step("circulation.ledger", || {
                self.repository
                    .transition_reservation(collection, reservation_id, from, apply)
            })
            .await?;
        match change {
            LedgerChange::Applied(reservation) => Ok(reservation),
            LedgerChange::Missing => Err(ReservationError::NotFound(format!(
                "Reservation {reservation_id}"
            ))),
            LedgerChange::Refused(status) => Err(ReservationError::InvalidTransition {
                id: reservation_id.to_string(),
                from: status,
            }),
        }
    }

    /// Hands the book to the reservation's owner until `expected_return`
    #[tracing::instrument(skip(self))]
    pub async fn approve(
        &self,
        reservation_id: &str,
        expected_return: Timestamp,
    ) -> Result<(), ReservationError> {
        let (collection, reservation) = self
            .load_for_transition(reservation_id, ReservationStatus::is_queued)
            .await?;
        let now = self.clock.now_millis();
        if expected_return <= now {
            return Err(ReservationError::InvalidRequest(
                "Expected return must be in the future".to_string(),
            ));
        }

        let owned = self
            .open_transition_journal(
                SagaOperation::Approve,
                &reservation,
                Some(expected_return),
            )
            .await?;
        let reservation = match self
            .commit_transition(collection, reservation_id, ReservationStatus::is_queued, |r| {
                r.status = ReservationStatus::Approved;
                r.approved_at = Some(now);
            })
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => {
                if owned {
                    self.close_journal(reservation_id).await;
                }
                return Err(err);
            }
        };

        let book_id = reservation.book_id.as_str();
        self.step("approve.queue_entry", || {
            self.repository.remove_queue_entry(book_id, reservation_id)
        })
        .await
        .map_err(partial(reservation_id, "queue_entry"))?;

        let loan = CurrentLoan {
            user_id: reservation.user_id.clone(),
            borrowed_at: now,
            expected_return,
        };
        self.step("approve.book_status", || {
            self.repository.update_book_status(book_id, |status| {
                status.queue_count = status.queue_count.saturating_sub(1);
                status.available = false;
                status.current_reservation_id = Some(reservation_id.to_string());
                status.current_loan = Some(loan.clone());
            })
        })
        .await
        .map_err(partial(reservation_id, "book_status"))?;

        // a cancel that removed the approved record before the loan was set
        // found no hold to release
        let still_approved = self
            .step("approve.recheck", || {
                self.repository.get_reservation(reservation_id)
            })
            .await
            .map_err(partial(reservation_id, "recheck"))?
            .is_some_and(|current| current.status == ReservationStatus::Approved);
        if !still_approved {
            tracing::warn!(reservation_id, book_id, "Reservation left while being approved");
            self.step("approve.release_loan", || {
                self.repository.update_book_status(book_id, |status| {
                    release_loan_hold(status, reservation_id)
                })
            })
            .await
            .map_err(partial(reservation_id, "book_status"))?;
        }

        if owned {
            self.close_journal(reservation_id).await;
        }
        self.emit(NotificationKind::ReservationApproved, &reservation)
            .await;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, reservation_id: &str) -> Result<(), ReservationError> {
        let (collection, reservation) = self
            .load_for_transition(reservation_id, ReservationStatus::is_queued)
            .await?;

        let owned = self
            .open_transition_journal(SagaOperation::Reject, &reservation, None)
            .await?;
        let reservation = match self
            .commit_transition(collection, reservation_id, ReservationStatus::is_queued, |r| {
                r.status = ReservationStatus::Rejected
            })
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => {
                if owned {
                    self.close_journal(reservation_id).await;
                }
                return Err(err);
            }
        };

        let (user_id, book_id) = (reservation.user_id.as_str(), reservation.book_id.as_str());
        let unlink = async {
            self.step("reject.queue_entry", || {
                self.repository.remove_queue_entry(book_id, reservation_id)
            })
            .await?;
            self.step("reject.marker", || {
                self.repository
                    .release_book_marker(user_id, book_id, reservation_id)
            })
            .await?;
            self.step("reject.queue_count", || {
                self.repository.update_book_status(book_id, |status| {
                    status.queue_count = status.queue_count.saturating_sub(1)
                })
            })
            .await
        };
        unlink.await.map_err(partial(reservation_id, "reject"))?;

        if owned {
            self.close_journal(reservation_id).await;
        }
        self.emit(NotificationKind::ReservationRejected, &reservation)
            .await;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_returned(&self, reservation_id: &str) -> Result<(), ReservationError> {
        let (collection, _) = self
            .load_for_transition(reservation_id, is_approved)
            .await?;

        let now = self.clock.now_millis();
        let reservation = self
            .commit_transition(collection, reservation_id, is_approved, |r| {
                r.status = ReservationStatus::Returned;
                r.returned_at = Some(now);
            })
            .await?;

        let (user_id, book_id) = (reservation.user_id.as_str(), reservation.book_id.as_str());
        let unlink = async {
            self.step("return.marker", || {
                self.repository
                    .release_book_marker(user_id, book_id, reservation_id)
            })
            .await?;
            self.step("return.book_status", || {
                self.repository.update_book_status(book_id, |status| {
                    release_loan_hold(status, reservation_id)
                })
            })
            .await
        };
        unlink.await.map_err(partial(reservation_id, "return"))?;

        self.emit(NotificationKind::ReservationReturned, &reservation)
            .await;
        Ok(())
    }
}

fn is_approved(status: ReservationStatus) -> bool {
    status == ReservationStatus::Approved
}
