use crate::api::{BookRating, RatingSummary};
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Folds one rating into the summary. A replaced rating only moves the sum.
pub(crate) fn apply_rating(summary: &mut RatingSummary, previous: Option<u8>, rating: u8) {
    match previous {
        Some(previous) => {
            summary.sum = (summary.sum + u32::from(rating)).saturating_sub(u32::from(previous));
        }
        None => {
            summary.total += 1;
            summary.sum += u32::from(rating);
        }
    }
    summary.average = average(summary.sum, summary.total);
}

pub(crate) fn average(sum: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(sum) / f64::from(total)
    }
}

impl ReservationService {
    /// Stores the caller's rating of the book and returns the updated summary
    #[tracing::instrument(skip(self))]
    pub async fn rate_book(
        &self,
        caller: &Caller,
        book_id: &str,
        rating: u8,
    ) -> Result<RatingSummary, ReservationError> {
        let user_id = caller.user_id()?;
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ReservationError::InvalidRequest(format!(
                "Rating must be between {MIN_RATING} and {MAX_RATING}"
            )));
        }

        let new_rating = BookRating {
            rating,
            created_at: self.clock.now_millis(),
        };
        let previous = self
            .step("rating.swap", || {
                self.repository.swap_rating(book_id, user_id, &new_rating)
            })
            .await?
            .map(|previous| previous.rating);

        let summary = self
            .step("rating.summary", || {
                self.repository.update_rating_summary(book_id, |summary| {
                    apply_rating(summary, previous, rating)
                })
            })
            .await?;

        tracing::info!(
            book_id,
            user_id,
            rating,
            average = summary.average,
            "Book rated"
        );
        Ok(summary)
    }

    /// Books nobody rated yet read as an empty summary
    pub async fn rating_summary(&self, book_id: &str) -> Result<RatingSummary, ReservationError> {
        Ok(self
            .step("rating.read_summary", || {
                self.repository.rating_summary(book_id)
            })
            .await?
            .unwrap_or_default())
    }

    pub async fn user_rating(
        &self,
        caller: &Caller,
        book_id: &str,
    ) -> Result<Option<BookRating>, ReservationError> {
        let user_id = caller.user_id()?;
        Ok(self
            .step("rating.read_user", || {
                self.repository.user_rating(book_id, user_id)
            })
            .await?)
    }
}
