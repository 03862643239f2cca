//! Typed views over the document store. Every path the reservation core
//! touches is built here, and this is the only place where documents are
//! decoded, so both status vocabularies and the legacy `reservas` collection
//! are handled in one spot.

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::api::{
    BookId, BookRating, BookStatus, Notification, NotificationStatus, PendingOperation,
    QueueEntry, RatingSummary, ReadingProgress, Reservation, ReservationId, ReservationStatus,
    UserId,
};
use crate::document_store::{join_path, Document, DocumentStore, StoreError};

const RESERVATIONS: &str = "reservations";
const LEGACY_RESERVATIONS: &str = "reservas";
const BOOK_QUEUES: &str = "bookQueues";
const BOOK_STATUS: &str = "bookStatus";
const USER_RESERVATIONS: &str = "userReservations";
const USER_BOOK_RESERVATIONS: &str = "userBookReservations";
const BOOK_RATINGS: &str = "bookRatings";
const BOOK_RATINGS_SUMMARY: &str = "bookRatingsSummary";
const USER_BOOK_PROGRESS: &str = "userBookProgress";
const PENDING_OPERATIONS: &str = "pendingOperations";
const NOTIFICATIONS: &str = "notifications";

/// Collection a ledger record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Canonical,
    Legacy,
}

impl Collection {
    fn root(self) -> &'static str {
        match self {
            Collection::Canonical => RESERVATIONS,
            Collection::Legacy => LEGACY_RESERVATIONS,
        }
    }
}

/// Result of a conditional ledger write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerChange {
    /// The record as written, or as it was before removal
    Applied(Reservation),
    Missing,
    /// The record was there but in a status the change does not accept
    Refused(ReservationStatus),
}

/// Which top-level collection a changed path belongs to
pub fn collection_of(path: &str) -> &str {
    path.split('/').next().unwrap_or_default()
}

pub struct ReservationsRepository {
    store: Arc<dyn DocumentStore>,
    legacy_collections: bool,
}

fn decode<T: DeserializeOwned>(value: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Decodes children, skipping documents that no longer parse
fn decode_children<T: DeserializeOwned>(
    parent: &str,
    children: Vec<(String, Document)>,
) -> Vec<(String, T)> {
    children
        .into_iter()
        .filter_map(|(key, value)| match decode(value) {
            Ok(decoded) => Some((key, decoded)),
            Err(err) => {
                tracing::warn!(parent, key, "Skipping malformed document: {}", err);
                None
            }
        })
        .collect()
}

impl ReservationsRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            legacy_collections: false,
        }
    }

    /// Also reads ledger records from the legacy `reservas` collection
    pub fn with_legacy_collections(mut self, enabled: bool) -> Self {
        self.legacy_collections = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Read-modify-write of one typed document, missing documents start from
    /// `T::default()`. Returns the value before and after.
    async fn update_typed<T, F>(&self, path: &str, update: F) -> Result<(Option<T>, T), StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: Fn(&mut T) + Send + Sync,
    {
        let outcome = self
            .store
            .transaction(path, &|current| {
                let mut value = current
                    .cloned()
                    .map(serde_json::from_value::<T>)
                    .transpose()?
                    .unwrap_or_default();
                update(&mut value);
                Ok(Some(serde_json::to_value(&value)?))
            })
            .await?;

        let previous = outcome.previous.map(decode::<T>).transpose()?;
        let current = outcome.current.map(decode::<T>).transpose()?.unwrap_or_default();
        Ok((previous, current))
    }

    // ---- ledger ----

    /// Canonical record first, legacy one second
    pub async fn find_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<(Collection, Reservation)>, StoreError> {
        let mut collections = vec![Collection::Canonical];
        if self.legacy_collections {
            collections.push(Collection::Legacy);
        }

        for collection in collections {
            let path = join_path(&[collection.root(), reservation_id])?;
            if let Some(value) = self.store.get(&path).await? {
                let mut reservation: Reservation = decode(value)?;
                reservation.id = reservation_id.to_string();
                return Ok(Some((collection, reservation)));
            }
        }
        Ok(None)
    }

    pub async fn get_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self
            .find_reservation(reservation_id)
            .await?
            .map(|(_, reservation)| reservation))
    }

    /// New records always go to the canonical collection
    pub async fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let path = join_path(&[Collection::Canonical.root(), &reservation.id])?;
        self.store.set(&path, encode(reservation)?).await
    }

    pub async fn remove_reservation(
        &self,
        collection: Collection,
        reservation_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .remove(&join_path(&[collection.root(), reservation_id])?)
            .await
    }

    /// Applies `apply` to the record in one transaction, only while its
    /// status passes `allowed`
    pub async fn transition_reservation<A, F>(
        &self,
        collection: Collection,
        reservation_id: &str,
        allowed: A,
        apply: F,
    ) -> Result<LedgerChange, StoreError>
    where
        A: Fn(ReservationStatus) -> bool + Send + Sync,
        F: Fn(&mut Reservation) + Send + Sync,
    {
        let path = join_path(&[collection.root(), reservation_id])?;
        let result = self
            .store
            .transaction(&path, &|current| {
                let Some(value) = current else {
                    return Err(StoreError::PreconditionFailed(path.clone()));
                };
                let mut reservation: Reservation = serde_json::from_value(value.clone())?;
                if !allowed(reservation.status) {
                    return Err(StoreError::PreconditionFailed(path.clone()));
                }
                apply(&mut reservation);
                Ok(Some(serde_json::to_value(&reservation)?))
            })
            .await;

        match result {
            Ok(outcome) => self.applied(reservation_id, outcome.current),
            Err(StoreError::PreconditionFailed(_)) => {
                self.refusal(collection, reservation_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes the record in one transaction, only while it is active.
    /// Of two concurrent callers exactly one gets `Applied`.
    pub async fn take_reservation(
        &self,
        collection: Collection,
        reservation_id: &str,
    ) -> Result<LedgerChange, StoreError> {
        let path = join_path(&[collection.root(), reservation_id])?;
        let result = self
            .store
            .transaction(&path, &|current| {
                let Some(value) = current else {
                    return Err(StoreError::PreconditionFailed(path.clone()));
                };
                let reservation: Reservation = serde_json::from_value(value.clone())?;
                if reservation.status.is_active() {
                    Ok(None)
                } else {
                    Err(StoreError::PreconditionFailed(path.clone()))
                }
            })
            .await;

        match result {
            Ok(outcome) => self.applied(reservation_id, outcome.previous),
            Err(StoreError::PreconditionFailed(_)) => {
                self.refusal(collection, reservation_id).await
            }
            Err(err) => Err(err),
        }
    }

    fn applied(
        &self,
        reservation_id: &str,
        value: Option<Document>,
    ) -> Result<LedgerChange, StoreError> {
        Ok(match value.map(decode::<Reservation>).transpose()? {
            Some(mut reservation) => {
                reservation.id = reservation_id.to_string();
                LedgerChange::Applied(reservation)
            }
            None => LedgerChange::Missing,
        })
    }

    async fn refusal(
        &self,
        collection: Collection,
        reservation_id: &str,
    ) -> Result<LedgerChange, StoreError> {
        let path = join_path(&[collection.root(), reservation_id])?;
        Ok(match self.store.get(&path).await?.map(decode::<Reservation>) {
            Some(reservation) => LedgerChange::Refused(reservation?.status),
            None => LedgerChange::Missing,
        })
    }

    /// Every ledger record, canonical ones shadowing legacy ones with the same id
    pub async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let mut reservations = self.collection_reservations(Collection::Canonical).await?;
        if self.legacy_collections {
            let known: HashSet<ReservationId> =
                reservations.iter().map(|r| r.id.clone()).collect();
            reservations.extend(
                self.collection_reservations(Collection::Legacy)
                    .await?
                    .into_iter()
                    .filter(|r| !known.contains(&r.id)),
            );
        }
        Ok(reservations)
    }

    async fn collection_reservations(
        &self,
        collection: Collection,
    ) -> Result<Vec<Reservation>, StoreError> {
        let children = self.store.children(collection.root()).await?;
        Ok(decode_children::<Reservation>(collection.root(), children)
            .into_iter()
            .map(|(id, mut reservation)| {
                reservation.id = id;
                reservation
            })
            .collect())
    }

    /// Reservations reachable from the user's index, plus legacy records of
    /// the user when the legacy bridge is on
    pub async fn user_reservations(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError> {
        let mut reservations = Vec::new();
        for reservation_id in self.user_reservation_ids(user_id).await? {
            match self.get_reservation(&reservation_id).await {
                Ok(Some(reservation)) if reservation.user_id == user_id => {
                    reservations.push(reservation)
                }
                Ok(_) => {}
                Err(StoreError::DeserializationError(err)) => {
                    tracing::warn!(%reservation_id, "Skipping malformed reservation: {}", err)
                }
                Err(err) => return Err(err),
            }
        }

        if self.legacy_collections {
            let known: HashSet<ReservationId> =
                reservations.iter().map(|r| r.id.clone()).collect();
            let legacy = self
                .collection_reservations(Collection::Legacy)
                .await?
                .into_iter()
                .filter(|r| r.user_id == user_id && !known.contains(&r.id));
            for reservation in legacy {
                // a canonical record with the same id takes precedence
                if let Some(canonical) = self.get_reservation(&reservation.id).await? {
                    if canonical.user_id == user_id {
                        reservations.push(canonical);
                    }
                } else {
                    reservations.push(reservation);
                }
            }
        }
        Ok(reservations)
    }

    // ---- user index ----

    pub async fn user_reservation_ids(
        &self,
        user_id: &str,
    ) -> Result<Vec<ReservationId>, StoreError> {
        Ok(self
            .store
            .children(&join_path(&[USER_RESERVATIONS, user_id])?)
            .await?
            .into_iter()
            .map(|(reservation_id, _)| reservation_id)
            .collect())
    }

    pub async fn add_user_reservation(
        &self,
        user_id: &str,
        reservation_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set(
                &join_path(&[USER_RESERVATIONS, user_id, reservation_id])?,
                json!(true),
            )
            .await
    }

    pub async fn remove_user_reservation(
        &self,
        user_id: &str,
        reservation_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .remove(&join_path(&[USER_RESERVATIONS, user_id, reservation_id])?)
            .await
    }

    // ---- per (user, book) marker ----

    pub async fn book_marker(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<ReservationId>, StoreError> {
        Ok(self
            .store
            .get(&join_path(&[USER_BOOK_RESERVATIONS, user_id, book_id])?)
            .await?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// Points the marker at `reservation_id` if it is still absent, or still
    /// holds `expected` (a stale reservation id being taken over).
    /// Returns false when somebody else claimed it first.
    pub async fn claim_book_marker(
        &self,
        user_id: &str,
        book_id: &str,
        reservation_id: &str,
        expected: Option<&str>,
    ) -> Result<bool, StoreError> {
        let path = join_path(&[USER_BOOK_RESERVATIONS, user_id, book_id])?;
        let result = self
            .store
            .transaction(&path, &|current| {
                let current = current.and_then(|value| value.as_str());
                if current == Some(reservation_id) || current == expected {
                    Ok(Some(json!(reservation_id)))
                } else {
                    Err(StoreError::PreconditionFailed(path.clone()))
                }
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(StoreError::PreconditionFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Removes the marker only while it still points at `reservation_id`
    pub async fn release_book_marker(
        &self,
        user_id: &str,
        book_id: &str,
        reservation_id: &str,
    ) -> Result<(), StoreError> {
        let path = join_path(&[USER_BOOK_RESERVATIONS, user_id, book_id])?;
        self.store
            .transaction(&path, &|current| {
                Ok(match current {
                    Some(value) if value.as_str() == Some(reservation_id) => None,
                    other => other.cloned(),
                })
            })
            .await?;
        Ok(())
    }

    /// Every marker as (user, book, reservation)
    pub async fn all_book_markers(
        &self,
    ) -> Result<Vec<(UserId, BookId, ReservationId)>, StoreError> {
        let mut markers = Vec::new();
        for user_id in self.store.child_keys(USER_BOOK_RESERVATIONS).await? {
            let children = self
                .store
                .children(&join_path(&[USER_BOOK_RESERVATIONS, &user_id])?)
                .await?;
            markers.extend(children.into_iter().filter_map(|(book_id, value)| {
                value
                    .as_str()
                    .map(|reservation_id| (user_id.clone(), book_id, reservation_id.to_string()))
            }));
        }
        Ok(markers)
    }

    // ---- per book queue ----

    pub async fn queue_entries(&self, book_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let parent = join_path(&[BOOK_QUEUES, book_id])?;
        let children = self.store.children(&parent).await?;
        Ok(decode_children::<QueueEntry>(&parent, children)
            .into_iter()
            .map(|(reservation_id, mut entry)| {
                entry.reservation_id = reservation_id;
                entry
            })
            .collect())
    }

    pub async fn put_queue_entry(&self, book_id: &str, entry: &QueueEntry) -> Result<(), StoreError> {
        self.store
            .set(
                &join_path(&[BOOK_QUEUES, book_id, &entry.reservation_id])?,
                encode(entry)?,
            )
            .await
    }

    pub async fn remove_queue_entry(
        &self,
        book_id: &str,
        reservation_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .remove(&join_path(&[BOOK_QUEUES, book_id, reservation_id])?)
            .await
    }

    /// Books with at least one queue entry
    pub async fn queued_books(&self) -> Result<Vec<BookId>, StoreError> {
        self.store.child_keys(BOOK_QUEUES).await
    }

    // ---- availability aggregate ----

    pub async fn book_status(&self, book_id: &str) -> Result<Option<BookStatus>, StoreError> {
        self.store
            .get(&join_path(&[BOOK_STATUS, book_id])?)
            .await?
            .map(decode)
            .transpose()
    }

    /// Atomic update of the aggregate, returns the committed value
    pub async fn update_book_status<F>(&self, book_id: &str, update: F) -> Result<BookStatus, StoreError>
    where
        F: Fn(&mut BookStatus) + Send + Sync,
    {
        let path = join_path(&[BOOK_STATUS, book_id])?;
        Ok(self.update_typed(&path, update).await?.1)
    }

    /// Compare-and-swap of `queueCount`: writes `count` only while the stored
    /// value is still `expected`. Returns false when it had moved.
    pub async fn set_queue_count(
        &self,
        book_id: &str,
        expected: u32,
        count: u32,
    ) -> Result<bool, StoreError> {
        let path = join_path(&[BOOK_STATUS, book_id])?;
        let result = self
            .store
            .transaction(&path, &|current| {
                let mut status = current
                    .cloned()
                    .map(serde_json::from_value::<BookStatus>)
                    .transpose()?
                    .unwrap_or_default();
                if status.queue_count != expected {
                    return Err(StoreError::PreconditionFailed(path.clone()));
                }
                status.queue_count = count;
                Ok(Some(serde_json::to_value(&status)?))
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(StoreError::PreconditionFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn books_with_status(&self) -> Result<Vec<BookId>, StoreError> {
        self.store.child_keys(BOOK_STATUS).await
    }

    // ---- ratings ----

    pub async fn user_rating(
        &self,
        book_id: &str,
        user_id: &str,
    ) -> Result<Option<BookRating>, StoreError> {
        self.store
            .get(&join_path(&[BOOK_RATINGS, book_id, user_id])?)
            .await?
            .map(decode)
            .transpose()
    }

    /// Replaces the user's rating and returns the one it replaced, in one
    /// transaction so two devices of the same user can't both count as new
    pub async fn swap_rating(
        &self,
        book_id: &str,
        user_id: &str,
        rating: &BookRating,
    ) -> Result<Option<BookRating>, StoreError> {
        let path = join_path(&[BOOK_RATINGS, book_id, user_id])?;
        let value = encode(rating)?;
        let outcome = self
            .store
            .transaction(&path, &|_| Ok(Some(value.clone())))
            .await?;
        outcome.previous.map(decode).transpose()
    }

    pub async fn rating_summary(&self, book_id: &str) -> Result<Option<RatingSummary>, StoreError> {
        self.store
            .get(&join_path(&[BOOK_RATINGS_SUMMARY, book_id])?)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn update_rating_summary<F>(
        &self,
        book_id: &str,
        update: F,
    ) -> Result<RatingSummary, StoreError>
    where
        F: Fn(&mut RatingSummary) + Send + Sync,
    {
        let path = join_path(&[BOOK_RATINGS_SUMMARY, book_id])?;
        Ok(self.update_typed(&path, update).await?.1)
    }

    /// Every rating of the book as (user, rating)
    pub async fn book_ratings(&self, book_id: &str) -> Result<Vec<(UserId, BookRating)>, StoreError> {
        let parent = join_path(&[BOOK_RATINGS, book_id])?;
        let children = self.store.children(&parent).await?;
        Ok(decode_children(&parent, children))
    }

    pub async fn rated_books(&self) -> Result<Vec<BookId>, StoreError> {
        self.store.child_keys(BOOK_RATINGS).await
    }

    /// Overwrites the summary, returns true when the stored one differed
    pub async fn set_rating_summary(
        &self,
        book_id: &str,
        summary: &RatingSummary,
    ) -> Result<bool, StoreError> {
        let path = join_path(&[BOOK_RATINGS_SUMMARY, book_id])?;
        let (previous, _) = self
            .update_typed(&path, |current: &mut RatingSummary| *current = summary.clone())
            .await?;
        Ok(previous.as_ref() != Some(summary))
    }

    // ---- reading progress ----

    pub async fn reading_progress(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<ReadingProgress>, StoreError> {
        self.store
            .get(&join_path(&[USER_BOOK_PROGRESS, user_id, book_id])?)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn update_reading_progress<F>(
        &self,
        user_id: &str,
        book_id: &str,
        update: F,
    ) -> Result<ReadingProgress, StoreError>
    where
        F: Fn(&mut ReadingProgress) + Send + Sync,
    {
        let path = join_path(&[USER_BOOK_PROGRESS, user_id, book_id])?;
        Ok(self.update_typed(&path, update).await?.1)
    }

    pub async fn user_progress(
        &self,
        user_id: &str,
    ) -> Result<Vec<(BookId, ReadingProgress)>, StoreError> {
        let parent = join_path(&[USER_BOOK_PROGRESS, user_id])?;
        let children = self.store.children(&parent).await?;
        Ok(decode_children(&parent, children))
    }

    // ---- saga journal ----

    pub async fn put_pending_operation(&self, operation: &PendingOperation) -> Result<(), StoreError> {
        self.store
            .set(
                &join_path(&[PENDING_OPERATIONS, &operation.reservation_id])?,
                encode(operation)?,
            )
            .await
    }

    /// Writes the journal only if none is open for the reservation. Returns
    /// false when another operation already holds it.
    pub async fn open_pending_operation(
        &self,
        operation: &PendingOperation,
    ) -> Result<bool, StoreError> {
        let path = join_path(&[PENDING_OPERATIONS, &operation.reservation_id])?;
        let value = encode(operation)?;
        let result = self
            .store
            .transaction(&path, &|current| match current {
                None => Ok(Some(value.clone())),
                Some(_) => Err(StoreError::PreconditionFailed(path.clone())),
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(StoreError::PreconditionFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Open journals touching the book
    pub async fn book_pending_operations(
        &self,
        book_id: &str,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        Ok(self
            .pending_operations()
            .await?
            .into_iter()
            .filter(|operation| operation.book_id == book_id)
            .collect())
    }

    pub async fn pending_operation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<PendingOperation>, StoreError> {
        let value = self
            .store
            .get(&join_path(&[PENDING_OPERATIONS, reservation_id])?)
            .await?;
        Ok(value
            .map(decode::<PendingOperation>)
            .transpose()?
            .map(|mut operation| {
                operation.reservation_id = reservation_id.to_string();
                operation
            }))
    }

    pub async fn remove_pending_operation(&self, reservation_id: &str) -> Result<(), StoreError> {
        self.store
            .remove(&join_path(&[PENDING_OPERATIONS, reservation_id])?)
            .await
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let children = self.store.children(PENDING_OPERATIONS).await?;
        Ok(decode_children::<PendingOperation>(PENDING_OPERATIONS, children)
            .into_iter()
            .map(|(reservation_id, mut operation)| {
                operation.reservation_id = reservation_id;
                operation
            })
            .collect())
    }

    // ---- notifications ----

    pub async fn add_notification(&self, notification: &Notification) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .set(&join_path(&[NOTIFICATIONS, &id])?, encode(notification)?)
            .await?;
        Ok(id)
    }

    pub async fn notification(&self, notification_id: &str) -> Result<Option<Notification>, StoreError> {
        self.store
            .get(&join_path(&[NOTIFICATIONS, notification_id])?)
            .await?
            .map(decode)
            .transpose()
    }

    /// Returns false when there is no such notification
    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<bool, StoreError> {
        let path = join_path(&[NOTIFICATIONS, notification_id])?;
        let outcome = self
            .store
            .transaction(&path, &|current| {
                current
                    .cloned()
                    .map(|value| -> Result<Document, StoreError> {
                        let mut notification: Notification = serde_json::from_value(value)?;
                        notification.status = NotificationStatus::Read;
                        Ok(serde_json::to_value(notification)?)
                    })
                    .transpose()
            })
            .await?;
        Ok(outcome.previous.is_some())
    }

    pub async fn user_notifications(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, Notification)>, StoreError> {
        let children = self.store.children(NOTIFICATIONS).await?;
        let mut notifications: Vec<(String, Notification)> =
            decode_children::<Notification>(NOTIFICATIONS, children)
                .into_iter()
                .filter(|(_, notification)| notification.user_id == user_id)
                .collect();
        notifications.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        Ok(notifications)
    }
}
