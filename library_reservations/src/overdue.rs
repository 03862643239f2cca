use crate::api::{BookStatus, OverdueLoan, Reservation, ReservationStatus, Timestamp};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Whole days past `expected_return`, any started day counts
pub fn days_late(now: Timestamp, expected_return: Timestamp) -> i64 {
    if now <= expected_return {
        0
    } else {
        (now - expected_return + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
    }
}

/// Some when the viewer holds the book's loan through this reservation and
/// the expected return date has passed
pub fn overdue_loan(
    reservation: &Reservation,
    book_status: &BookStatus,
    viewer_id: &str,
    now: Timestamp,
) -> Option<OverdueLoan> {
    if reservation.status != ReservationStatus::Approved || reservation.user_id != viewer_id {
        return None;
    }
    let loan = book_status.current_loan.as_ref()?;
    if loan.user_id != viewer_id {
        return None;
    }
    let days_late = days_late(now, loan.expected_return);
    (days_late > 0).then(|| OverdueLoan {
        reservation_id: reservation.id.clone(),
        book_id: reservation.book_id.clone(),
        expected_return: loan.expected_return,
        days_late,
    })
}

#[cfg(test)]
mod overdue_tests {
    use super::*;
    use crate::api::CurrentLoan;

    #[test]
    fn started_days_are_rounded_up() {
        assert_eq!(days_late(1_000, 1_000), 0);
        assert_eq!(days_late(999, 1_000), 0);
        assert_eq!(days_late(1_001, 1_000), 1);
        assert_eq!(days_late(MILLIS_PER_DAY, 0), 1);
        assert_eq!(days_late(MILLIS_PER_DAY + 1, 0), 2);
    }

    #[test]
    fn only_the_viewers_own_late_loan_is_reported() {
        let reservation = Reservation {
            id: "r1".to_string(),
            user_id: "u1".to_string(),
            book_id: "b1".to_string(),
            status: ReservationStatus::Approved,
            created_at: 0,
            approved_at: Some(0),
            returned_at: None,
        };
        let status = BookStatus {
            available: false,
            current_reservation_id: Some("r1".to_string()),
            queue_count: 0,
            current_loan: Some(CurrentLoan {
                user_id: "u1".to_string(),
                borrowed_at: 0,
                expected_return: MILLIS_PER_DAY,
            }),
        };

        let late = overdue_loan(&reservation, &status, "u1", 3 * MILLIS_PER_DAY).unwrap();
        assert_eq!(late.days_late, 2);
        assert_eq!(late.book_id, "b1");

        assert!(overdue_loan(&reservation, &status, "u1", MILLIS_PER_DAY).is_none());
        assert!(overdue_loan(&reservation, &status, "u2", 3 * MILLIS_PER_DAY).is_none());

        let returned = Reservation {
            status: ReservationStatus::Returned,
            ..reservation
        };
        assert!(overdue_loan(&returned, &status, "u1", 3 * MILLIS_PER_DAY).is_none());
    }
}
