use anyhow::{bail, Context};
use reqwest::{Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use reqwest_tracing::TracingMiddleware;
use serde::de::DeserializeOwned;

use crate::api::{
    ApproveRequest, BookId, BookStatusResponse, ErrorResponse, NotificationRecord,
    QueuePositionResponse, RateBookRequest, RatingSummary, ReadingProgress, ReconciliationReport,
    RecordProgressRequest, Reservation, ReservationId, ReservationOverview, ReservationStatus,
    ReserveResponse, ReservedByUserResponse, Timestamp,
};

const MAX_RETRIES: u32 = 3;

/// A refused duplicate is an outcome, not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(ReservationId),
    AlreadyReserved,
}

pub struct LibraryReservationsClient {
    url: String,
    client: ClientWithMiddleware,
}

async fn error_of(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(error) => format!("{} {}: {}", status, error.code, error.message),
        Err(_) => status.to_string(),
    }
}

async fn json_or_bail<T: DeserializeOwned>(response: Response, action: &str) -> anyhow::Result<T> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        bail!("Failed to {} {}", action, error_of(response).await)
    }
}

async fn empty_or_bail(response: Response, action: &str) -> anyhow::Result<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        bail!("Failed to {} {}", action, error_of(response).await)
    }
}

impl LibraryReservationsClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Calls POST /api/user/{user_id}/book/{book_id}
    pub async fn reserve_book(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> anyhow::Result<ReserveOutcome> {
        let response = self
            .client
            .post(format!("{}/api/user/{}/book/{}", self.url, user_id, book_id))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            Ok(ReserveOutcome::AlreadyReserved)
        } else {
            let created: ReserveResponse = json_or_bail(response, "reserve book").await?;
            Ok(ReserveOutcome::Reserved(created.reservation_id))
        }
    }

    /// Calls DELETE /api/user/{user_id}/reservation/{reservation_id}
    /// Returns false when there was nothing to cancel
    pub async fn cancel_reservation(
        &self,
        user_id: &str,
        reservation_id: &str,
    ) -> anyhow::Result<bool> {
        let response = self
            .client
            .delete(format!(
                "{}/api/user/{}/reservation/{}",
                self.url, user_id, reservation_id
            ))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            empty_or_bail(response, "cancel reservation").await?;
            Ok(true)
        }
    }

    /// Calls GET /api/user/{user_id}/reservations, any status when `statuses` is empty
    pub async fn list_reservations(
        &self,
        user_id: &str,
        statuses: &[ReservationStatus],
    ) -> anyhow::Result<Vec<ReservationOverview>> {
        let filter = statuses
            .iter()
            .map(|status| status.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .client
            .get(format!("{}/api/user/{}/reservations", self.url, user_id))
            .query(&[("status", filter)])
            .send()
            .await?;
        json_or_bail(response, "list reservations").await
    }

    /// Calls GET /api/user/{user_id}/books
    pub async fn user_books(&self, user_id: &str) -> anyhow::Result<Vec<Reservation>> {
        let response = self
            .client
            .get(format!("{}/api/user/{}/books", self.url, user_id))
            .send()
            .await?;
        json_or_bail(response, "get user books").await
    }

    /// Calls GET /api/user/{user_id}/reading
    pub async fn currently_reading(&self, user_id: &str) -> anyhow::Result<Vec<BookId>> {
        let response = self
            .client
            .get(format!("{}/api/user/{}/reading", self.url, user_id))
            .send()
            .await?;
        json_or_bail(response, "get currently reading").await
    }

    /// Calls GET /api/user/{user_id}/notifications
    pub async fn notifications(&self, user_id: &str) -> anyhow::Result<Vec<NotificationRecord>> {
        let response = self
            .client
            .get(format!("{}/api/user/{}/notifications", self.url, user_id))
            .send()
            .await?;
        json_or_bail(response, "get notifications").await
    }

    /// Calls GET /api/user/{user_id}/book/{book_id}/reserved
    pub async fn is_book_reserved(&self, user_id: &str, book_id: &str) -> anyhow::Result<bool> {
        let response = self
            .client
            .get(format!(
                "{}/api/user/{}/book/{}/reserved",
                self.url, user_id, book_id
            ))
            .send()
            .await?;
        let reserved: ReservedByUserResponse = json_or_bail(response, "check reservation").await?;
        Ok(reserved.reserved)
    }

    /// Calls PUT /api/user/{user_id}/book/{book_id}/rating
    pub async fn rate_book(
        &self,
        user_id: &str,
        book_id: &str,
        rating: u8,
    ) -> anyhow::Result<RatingSummary> {
        let response = self
            .client
            .put(format!(
                "{}/api/user/{}/book/{}/rating",
                self.url, user_id, book_id
            ))
            .json(&RateBookRequest { rating })
            .send()
            .await?;
        json_or_bail(response, "rate book").await
    }

    /// Calls PUT /api/user/{user_id}/book/{book_id}/progress
    pub async fn record_progress(
        &self,
        user_id: &str,
        book_id: &str,
        pages_read: u32,
    ) -> anyhow::Result<ReadingProgress> {
        let response = self
            .client
            .put(format!(
                "{}/api/user/{}/book/{}/progress",
                self.url, user_id, book_id
            ))
            .json(&RecordProgressRequest { pages_read })
            .send()
            .await?;
        json_or_bail(response, "record progress").await
    }

    /// Calls GET /api/book/{book_id}/status
    pub async fn book_status(&self, book_id: &str) -> anyhow::Result<BookStatusResponse> {
        let response = self
            .client
            .get(format!("{}/api/book/{}/status", self.url, book_id))
            .send()
            .await?;
        json_or_bail(response, "get book status").await
    }

    /// Calls GET /api/book/{book_id}/queue/{reservation_id}
    pub async fn queue_position(&self, book_id: &str, reservation_id: &str) -> anyhow::Result<u32> {
        let response = self
            .client
            .get(format!(
                "{}/api/book/{}/queue/{}",
                self.url, book_id, reservation_id
            ))
            .send()
            .await?;
        let position: QueuePositionResponse = json_or_bail(response, "get queue position").await?;
        Ok(position.position)
    }

    /// Calls POST /api/admin/reservation/{reservation_id}/approve
    pub async fn approve(
        &self,
        reservation_id: &str,
        expected_return: Timestamp,
    ) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/api/admin/reservation/{}/approve",
                self.url, reservation_id
            ))
            .json(&ApproveRequest { expected_return })
            .send()
            .await?;
        empty_or_bail(response, "approve reservation").await
    }

    /// Calls POST /api/admin/reservation/{reservation_id}/return
    pub async fn mark_returned(&self, reservation_id: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/api/admin/reservation/{}/return",
                self.url, reservation_id
            ))
            .send()
            .await?;
        empty_or_bail(response, "return reservation").await
    }

    /// Calls POST /api/admin/reconcile
    pub async fn reconcile(&self) -> anyhow::Result<ReconciliationReport> {
        let response = self
            .client
            .post(format!("{}/api/admin/reconcile", self.url))
            .send()
            .await?;
        json_or_bail(response, "reconcile").await
    }
}
