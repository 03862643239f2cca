//! Human readable availability and status lines derived from the aggregate.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::api::{BookStatus, BookStatusResponse, ReservationStatus, Timestamp};

/// `YYYY-MM-DD` in UTC
pub fn format_date(timestamp: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityText {
    InYourPossession { expected_return: Timestamp },
    /// Approved for the viewer while the aggregate shows no loan of theirs
    LoanDetailsUpdating,
    AvailableOn(Timestamp),
    AvailableNow,
    ComingSoon,
}

impl fmt::Display for AvailabilityText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityText::InYourPossession { expected_return } => write!(
                f,
                "In your possession, return by {}",
                format_date(*expected_return)
            ),
            AvailabilityText::LoanDetailsUpdating => {
                f.write_str("In your possession, loan details are being updated")
            }
            AvailabilityText::AvailableOn(date) => {
                write!(f, "Available on {}", format_date(*date))
            }
            AvailabilityText::AvailableNow => f.write_str("Available now"),
            AvailabilityText::ComingSoon => f.write_str("Coming soon"),
        }
    }
}

pub fn derive_availability_text(
    book_status: &BookStatus,
    reservation_status: ReservationStatus,
    viewer_id: &str,
) -> AvailabilityText {
    if reservation_status == ReservationStatus::Approved {
        return match &book_status.current_loan {
            Some(loan) if loan.user_id == viewer_id => AvailabilityText::InYourPossession {
                expected_return: loan.expected_return,
            },
            other => {
                tracing::warn!(
                    viewer_id,
                    loan_holder = other.as_ref().map(|loan| loan.user_id.as_str()),
                    "Approved reservation without a matching loan on the aggregate"
                );
                AvailabilityText::LoanDetailsUpdating
            }
        };
    }

    if let Some(loan) = &book_status.current_loan {
        AvailabilityText::AvailableOn(loan.expected_return)
    } else if book_status.available {
        AvailabilityText::AvailableNow
    } else {
        AvailabilityText::ComingSoon
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusText {
    Available,
    LoanedOut,
    Reserved,
    Unavailable,
}

impl fmt::Display for StatusText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatusText::Available => "Available",
            StatusText::LoanedOut => "Loaned out",
            StatusText::Reserved => "Reserved",
            StatusText::Unavailable => "Unavailable",
        })
    }
}

pub fn derive_status_text(book_status: &BookStatus) -> StatusText {
    if book_status.available {
        StatusText::Available
    } else if book_status.current_loan.is_some() {
        StatusText::LoanedOut
    } else if book_status.queue_count > 0 {
        StatusText::Reserved
    } else {
        StatusText::Unavailable
    }
}

impl From<BookStatus> for BookStatusResponse {
    fn from(status: BookStatus) -> Self {
        Self {
            status_text: derive_status_text(&status).to_string(),
            available: status.available,
            current_reservation_id: status.current_reservation_id,
            queue_count: status.queue_count,
            current_loan: status.current_loan,
        }
    }
}

/// Label of the reservation itself on the "my reservations" screen
pub fn reservation_status_text(status: ReservationStatus) -> &'static str {
    match status {
        ReservationStatus::Pending => "Awaiting approval",
        ReservationStatus::Waiting => "Waiting in line",
        ReservationStatus::Approved => "Approved",
        ReservationStatus::Rejected => "Rejected",
        ReservationStatus::Returned => "Returned",
    }
}

#[cfg(test)]
mod availability_tests {
    use super::*;
    use crate::api::CurrentLoan;

    // 2024-03-15T12:00:00Z
    const MARCH_15: Timestamp = 1_710_504_000_000;

    fn loaned_to(user_id: &str) -> BookStatus {
        BookStatus {
            available: false,
            current_reservation_id: Some("r1".to_string()),
            queue_count: 0,
            current_loan: Some(CurrentLoan {
                user_id: user_id.to_string(),
                borrowed_at: MARCH_15 - 86_400_000,
                expected_return: MARCH_15,
            }),
        }
    }

    #[test]
    fn availability_rules_apply_in_priority_order() {
        assert_eq!(
            derive_availability_text(&loaned_to("u1"), ReservationStatus::Approved, "u1"),
            AvailabilityText::InYourPossession {
                expected_return: MARCH_15
            }
        );
        assert_eq!(
            derive_availability_text(&loaned_to("u2"), ReservationStatus::Approved, "u1"),
            AvailabilityText::LoanDetailsUpdating
        );
        assert_eq!(
            derive_availability_text(&loaned_to("u2"), ReservationStatus::Pending, "u1"),
            AvailabilityText::AvailableOn(MARCH_15)
        );
        assert_eq!(
            derive_availability_text(&BookStatus::default(), ReservationStatus::Pending, "u1"),
            AvailabilityText::AvailableNow
        );
        let unavailable = BookStatus {
            available: false,
            ..BookStatus::default()
        };
        assert_eq!(
            derive_availability_text(&unavailable, ReservationStatus::Waiting, "u1"),
            AvailabilityText::ComingSoon
        );
    }

    #[test]
    fn availability_text_renders_dates() {
        assert_eq!(
            AvailabilityText::AvailableOn(MARCH_15).to_string(),
            "Available on 2024-03-15"
        );
        assert_eq!(
            AvailabilityText::InYourPossession {
                expected_return: MARCH_15
            }
            .to_string(),
            "In your possession, return by 2024-03-15"
        );
    }

    #[test]
    fn status_text_decision_table() {
        assert_eq!(derive_status_text(&BookStatus::default()), StatusText::Available);
        assert_eq!(derive_status_text(&loaned_to("u1")), StatusText::LoanedOut);
        let reserved = BookStatus {
            available: false,
            queue_count: 2,
            ..BookStatus::default()
        };
        assert_eq!(derive_status_text(&reserved), StatusText::Reserved);
        let unavailable = BookStatus {
            available: false,
            ..BookStatus::default()
        };
        assert_eq!(derive_status_text(&unavailable).to_string(), "Unavailable");
    }
}
