use crate::api::ReadingProgress;
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;

/// Whole percent of the book read
pub(crate) fn percent_read(pages_read: u32, total_pages: u32) -> u32 {
    if total_pages == 0 {
        return 0;
    }
    (f64::from(pages_read) / f64::from(total_pages) * 100.0).round() as u32
}

impl ReservationService {
    /// Overwrites how far the caller got in the book. Finished books stay
    /// finished.
    #[tracing::instrument(skip(self))]
    pub async fn record_progress(
        &self,
        caller: &Caller,
        book_id: &str,
        pages_read: u32,
    ) -> Result<ReadingProgress, ReservationError> {
        let user_id = caller.user_id()?;
        let total_pages = self.get_book_meta(book_id).await?.pages.ok_or_else(|| {
            ReservationError::InvalidRequest("The book has no page count".to_string())
        })?;
        if pages_read > total_pages {
            return Err(ReservationError::InvalidRequest(format!(
                "Pages read must be between 0 and {total_pages}"
            )));
        }

        let now = self.clock.now_millis();
        let progress = percent_read(pages_read, total_pages);
        Ok(self
            .step("progress.record", || {
                self.repository
                    .update_reading_progress(user_id, book_id, |current| {
                        current.pages_read = pages_read;
                        current.progress = progress;
                        current.updated_at = now;
                    })
            })
            .await?)
    }

    /// Marks the book as finished, which takes it off the currently reading
    /// list but not off the loans
    #[tracing::instrument(skip(self))]
    pub async fn finish_reading(
        &self,
        caller: &Caller,
        book_id: &str,
    ) -> Result<ReadingProgress, ReservationError> {
        let user_id = caller.user_id()?;
        let total_pages = self
            .get_book_meta(book_id)
            .await
            .ok()
            .and_then(|meta| meta.pages);

        let now = self.clock.now_millis();
        Ok(self
            .step("progress.finish", || {
                self.repository
                    .update_reading_progress(user_id, book_id, |current| {
                        current.progress = match total_pages {
                            Some(total_pages) => percent_read(current.pages_read, total_pages),
                            None => 100,
                        };
                        if !current.finished {
                            current.finished = true;
                            current.finished_at = Some(now);
                        }
                        current.updated_at = now;
                    })
            })
            .await?)
    }

    pub async fn reading_progress(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<ReadingProgress, ReservationError> {
        Ok(self
            .step("progress.read", || {
                self.repository.reading_progress(user_id, book_id)
            })
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod progress_tests {
    use super::*;
    use crate::testing::{book, harness};

    #[test]
    fn percent_is_rounded() {
        assert_eq!(percent_read(0, 300), 0);
        assert_eq!(percent_read(1, 3), 33);
        assert_eq!(percent_read(2, 3), 67);
        assert_eq!(percent_read(300, 300), 100);
        assert_eq!(percent_read(5, 0), 0);
    }

    #[tokio::test]
    /// Progress is validated against the catalog page count and finishing is one way
    async fn test_progress_and_finish() {
        let harness = harness();
        let service = &harness.service;
        harness
            .catalog
            .insert_book("b1", book("Grande Sertão: Veredas", Some(200)));
        harness.catalog.insert_book("b2", book("Sem páginas", None));
        let reader = Caller::user("u1");

        let progress = service.record_progress(&reader, "b1", 50).await.unwrap();
        assert_eq!((progress.pages_read, progress.progress), (50, 25));
        assert!(!progress.finished);

        assert!(matches!(
            service.record_progress(&reader, "b1", 201).await,
            Err(ReservationError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.record_progress(&reader, "b2", 1).await,
            Err(ReservationError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.record_progress(&reader, "missing", 1).await,
            Err(ReservationError::NotFound(_))
        ));

        let finished = service.finish_reading(&reader, "b1").await.unwrap();
        assert!(finished.finished);
        assert_eq!(finished.pages_read, 50);
        let finished_at = finished.finished_at;

        let later = service.record_progress(&reader, "b1", 120).await.unwrap();
        assert!(later.finished);
        assert_eq!(later.progress, 60);
        assert_eq!(later.finished_at, finished_at);
        assert_eq!(service.reading_progress("u1", "b1").await.unwrap(), later);
    }
}
