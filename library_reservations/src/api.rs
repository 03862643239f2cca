use std::fmt;
use std::str::FromStr;

use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};

pub use library_catalog::api::BookMeta;

pub type UserId = String;
pub type BookId = String;
pub type ReservationId = String;
/// Milliseconds since the unix epoch
pub type Timestamp = i64;

/// Canonical reservation status.
///
/// Documents written by older clients use the Portuguese vocabulary and the
/// loans table used `borrowed`/`emprestado` for what is an approved
/// reservation; all of those are folded into this enum when read.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Apiv2Schema,
)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    #[serde(alias = "pendente")]
    Pending,
    #[serde(alias = "aguardando")]
    Waiting,
    #[serde(alias = "aprovada", alias = "borrowed", alias = "emprestado")]
    Approved,
    #[serde(alias = "rejeitada")]
    Rejected,
    #[serde(alias = "devolvida")]
    Returned,
}

impl ReservationStatus {
    pub const ACTIVE: [ReservationStatus; 3] = [
        ReservationStatus::Pending,
        ReservationStatus::Waiting,
        ReservationStatus::Approved,
    ];

    /// Pending, waiting or approved: counts against the one-per-book rule
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// Still waiting for a copy, so it has a queue entry
    pub fn is_queued(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Waiting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Waiting => "waiting",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Returned => "returned",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
    }
}

/// Ledger record, `reservations/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Taken from the document key on read
    #[serde(default)]
    pub id: ReservationId,
    pub user_id: UserId,
    #[serde(alias = "livroId")]
    pub book_id: BookId,
    pub status: ReservationStatus,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<Timestamp>,
}

/// `bookQueues/{bookId}/{reservationId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Taken from the document key on read
    #[serde(default)]
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub created_at: Timestamp,
    pub status: ReservationStatus,
}

impl QueueEntry {
    pub fn for_reservation(reservation: &Reservation) -> Self {
        Self {
            reservation_id: reservation.id.clone(),
            user_id: reservation.user_id.clone(),
            created_at: reservation.created_at,
            status: reservation.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct CurrentLoan {
    pub user_id: UserId,
    pub borrowed_at: Timestamp,
    pub expected_return: Timestamp,
}

/// Per-book availability aggregate, `bookStatus/{bookId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookStatus {
    #[serde(default = "available_by_default")]
    pub available: bool,
    #[serde(default)]
    pub current_reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub queue_count: u32,
    #[serde(default)]
    pub current_loan: Option<CurrentLoan>,
}

fn available_by_default() -> bool {
    true
}

impl Default for BookStatus {
    fn default() -> Self {
        Self {
            available: true,
            current_reservation_id: None,
            queue_count: 0,
            current_loan: None,
        }
    }
}

/// `bookRatingsSummary/{bookId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub sum: u32,
    #[serde(default)]
    pub average: f64,
}

/// `bookRatings/{bookId}/{userId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookRating {
    pub rating: u8,
    pub created_at: Timestamp,
}

/// `userBookProgress/{userId}/{bookId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    #[serde(default)]
    pub pages_read: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SagaOperation {
    Reserve,
    Cancel,
    Approve,
    Reject,
}

/// Journal record kept at `pendingOperations/{reservationId}` while an
/// operation that touches more than one view of the reservation is in flight
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub operation: SagaOperation,
    #[serde(default)]
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub created_at: Timestamp,
    pub started_at: Timestamp,
    /// Loan due date of an approval, so it can be rolled forward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReservationCreated,
    ReservationCancelled,
    ReservationApproved,
    ReservationRejected,
    ReservationReturned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Read,
}

/// `notifications/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub reservation_id: ReservationId,
    pub book_id: BookId,
    pub user_id: UserId,
    pub status: NotificationStatus,
    pub created_at: Timestamp,
}

/// A notification together with the id it is marked read by
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    #[serde(flatten)]
    pub notification: Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct OverdueLoan {
    pub reservation_id: ReservationId,
    pub book_id: BookId,
    pub expected_return: Timestamp,
    pub days_late: i64,
}

/// One row of the "my reservations" screen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReservationOverview {
    pub reservation_id: ReservationId,
    pub book_id: BookId,
    pub title: Option<String>,
    pub cover: Option<String>,
    pub reservation_status: ReservationStatus,
    pub status_text: String,
    pub availability_text: String,
    /// Label of the book's aggregate, same as the status endpoint serves
    pub book_status_text: String,
    /// 0 when the reservation is not waiting in the queue
    pub queue_position: u32,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub resumed_operations: u32,
    pub rolled_back_operations: u32,
    pub removed_orphan_entries: u32,
    pub restored_entries: u32,
    pub removed_stale_markers: u32,
    pub corrected_books: Vec<BookId>,
    pub corrected_rating_summaries: Vec<BookId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub reservation_id: ReservationId,
}

/// The aggregate as served to clients, with its display label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookStatusResponse {
    pub available: bool,
    pub current_reservation_id: Option<ReservationId>,
    pub queue_count: u32,
    pub current_loan: Option<CurrentLoan>,
    /// "Available", "Loaned out", "Reserved" or "Unavailable"
    pub status_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct QueuePositionResponse {
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReservedByUserResponse {
    pub reserved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct RateBookRequest {
    pub rating: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct RecordProgressRequest {
    pub pages_read: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub expected_return: Timestamp,
}

/// Comma separated statuses, e.g. `?status=pending,waiting`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
pub struct StatusFilter {
    pub status: Option<String>,
}

impl StatusFilter {
    /// Empty result means "any status"
    pub fn statuses(&self) -> Result<Vec<ReservationStatus>, serde_json::Error> {
        self.status
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(ReservationStatus::from_str)
            .collect()
    }
}

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
