use crate::api::{Notification, NotificationKind, NotificationStatus, Reservation};
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;

impl ReservationService {
    /// Logs the event and appends a notification for the reservation owner.
    /// Never fails the operation that triggered it.
    pub(crate) async fn emit(&self, kind: NotificationKind, reservation: &Reservation) {
        tracing::info!(
            event = ?kind,
            reservation_id = %reservation.id,
            book_id = %reservation.book_id,
            user_id = %reservation.user_id,
            "Reservation event"
        );
        let notification = Notification {
            kind,
            reservation_id: reservation.id.clone(),
            book_id: reservation.book_id.clone(),
            user_id: reservation.user_id.clone(),
            status: NotificationStatus::Unread,
            created_at: self.clock.now_millis(),
        };
        if let Err(err) = self.repository.add_notification(&notification).await {
            tracing::warn!(reservation_id = %reservation.id, "Failed to store notification: {}", err);
        }
    }

    /// The caller's notifications, newest first
    pub async fn notifications(
        &self,
        caller: &Caller,
    ) -> Result<Vec<(String, Notification)>, ReservationError> {
        let user_id = caller.user_id()?;
        Ok(self
            .step("notifications", || self.repository.user_notifications(user_id))
            .await?)
    }

    pub async fn mark_notification_read(
        &self,
        caller: &Caller,
        notification_id: &str,
    ) -> Result<(), ReservationError> {
        let user_id = caller.user_id()?;
        let notification = self
            .step("notification", || self.repository.notification(notification_id))
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("Notification {notification_id}")))?;
        Self::owner_check(user_id, &notification.user_id, notification_id)?;

        self.step("notification.mark_read", || {
            self.repository.mark_notification_read(notification_id)
        })
        .await?;
        Ok(())
    }
}
