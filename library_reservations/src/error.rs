use crate::api::{BookId, ReservationId, ReservationStatus};
use crate::document_store::StoreError;
use crate::retry::Transient;

#[derive(thiserror::Error, Debug)]
pub enum ReservationError {
    #[error("No authenticated user")]
    Unauthenticated,

    #[error("User already holds an active reservation for book {0}")]
    DuplicateActiveReservation(BookId),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Reservation {0} belongs to a different user")]
    Forbidden(ReservationId),

    #[error("Reservation {id} cannot leave status {from}")]
    InvalidTransition {
        id: ReservationId,
        from: ReservationStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Reservation {reservation_id} stopped at step {step}: {source}")]
    PartialWriteFailure {
        reservation_id: ReservationId,
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    TransientStoreError(StoreError),

    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),
}

impl From<StoreError> for ReservationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(path) => {
                ReservationError::InvalidRequest(format!("Invalid identifier in {path}"))
            }
            other => ReservationError::TransientStoreError(other),
        }
    }
}

impl ReservationError {
    /// Stable machine readable code, sent along with `user_message`
    pub fn code(&self) -> &'static str {
        match self {
            ReservationError::Unauthenticated => "UNAUTHENTICATED",
            ReservationError::DuplicateActiveReservation(_) => "DUPLICATE_ACTIVE_RESERVATION",
            ReservationError::NotFound(_) => "NOT_FOUND",
            ReservationError::Forbidden(_) => "FORBIDDEN",
            ReservationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ReservationError::InvalidRequest(_) => "INVALID_REQUEST",
            ReservationError::PartialWriteFailure { .. } => "PARTIAL_WRITE_FAILURE",
            ReservationError::TransientStoreError(_) => "STORE_UNAVAILABLE",
            ReservationError::CatalogUnavailable(_) => "CATALOG_UNAVAILABLE",
        }
    }

    /// Message safe to show to a reader, never contains internal details
    pub fn user_message(&self) -> String {
        match self {
            ReservationError::Unauthenticated => "Please sign in to continue.".to_string(),
            ReservationError::DuplicateActiveReservation(_) => {
                "You already have an active reservation for this book.".to_string()
            }
            ReservationError::NotFound(_) => {
                "We could not find that reservation or book.".to_string()
            }
            ReservationError::Forbidden(_) => {
                "You can only manage your own reservations.".to_string()
            }
            ReservationError::InvalidTransition { from, .. } => {
                format!("This reservation is already {from} and can no longer be changed.")
            }
            ReservationError::InvalidRequest(reason) => reason.clone(),
            ReservationError::PartialWriteFailure { .. } => {
                "Your request could not be completed. Please try again.".to_string()
            }
            ReservationError::TransientStoreError(_) => {
                "The library is temporarily unavailable. Please try again in a moment.".to_string()
            }
            ReservationError::CatalogUnavailable(_) => {
                "Book details are temporarily unavailable. Please try again later.".to_string()
            }
        }
    }
}

impl Transient for ReservationError {
    fn is_transient(&self) -> bool {
        match self {
            ReservationError::TransientStoreError(err)
            | ReservationError::PartialWriteFailure { source: err, .. } => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        assert!(matches!(
            ReservationError::from(StoreError::InvalidPath("reservations/a/b".to_string())),
            ReservationError::InvalidRequest(_)
        ));
        let unavailable = ReservationError::from(StoreError::Unavailable("down".to_string()));
        assert!(unavailable.is_transient());
        assert_eq!(unavailable.code(), "STORE_UNAVAILABLE");
        assert!(!ReservationError::Forbidden("r1".to_string()).is_transient());
    }

    #[test]
    fn user_messages_hide_internal_details() {
        let err = ReservationError::PartialWriteFailure {
            reservation_id: "r1".to_string(),
            step: "queue_entry",
            source: StoreError::Other("connection reset by peer".to_string()),
        };
        assert!(!err.user_message().contains("connection"));
        assert!(err.to_string().contains("queue_entry"));
    }
}
