use std::sync::Arc;

use actix_web::http::header::LOCATION;
use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::Error;
use actix_web::HttpResponse;
use paperclip::actix::{
    api_v2_operation,
    web::{self},
    Apiv2Schema,
};
use serde::Deserialize;

use crate::api::{
    ApproveRequest, BookId, BookStatusResponse, ErrorResponse, NotificationRecord,
    QueuePositionResponse, RateBookRequest, RecordProgressRequest, ReservationId, ReserveResponse,
    ReservedByUserResponse, StatusFilter, UserId,
};
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;
use crate::reconciliation::Reconciler;

#[derive(Debug, Deserialize, Apiv2Schema)]
pub struct UserPath {
    user_id: UserId,
}

#[derive(Debug, Deserialize, Apiv2Schema)]
pub struct UserBookPath {
    user_id: UserId,
    book_id: BookId,
}

#[derive(Debug, Deserialize, Apiv2Schema)]
pub struct UserReservationPath {
    user_id: UserId,
    reservation_id: ReservationId,
}

#[derive(Debug, Deserialize, Apiv2Schema)]
pub struct UserNotificationPath {
    user_id: UserId,
    notification_id: String,
}

#[derive(Debug, Deserialize, Apiv2Schema)]
pub struct BookQueuePath {
    book_id: BookId,
    reservation_id: ReservationId,
}

fn status_of(err: &ReservationError) -> StatusCode {
    match err {
        ReservationError::Unauthenticated => StatusCode::UNAUTHORIZED,
        ReservationError::DuplicateActiveReservation(_)
        | ReservationError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
        ReservationError::Forbidden(_) => StatusCode::FORBIDDEN,
        ReservationError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReservationError::PartialWriteFailure { .. }
        | ReservationError::TransientStoreError(_)
        | ReservationError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(operation: &str, err: ReservationError) -> HttpResponse {
    let status = status_of(&err);
    if status.is_server_error() {
        tracing::error!("{} failed {}", operation, err);
    } else {
        tracing::info!("{} rejected {}", operation, err);
    }
    HttpResponse::build(status).json(ErrorResponse {
        code: err.code().to_string(),
        message: err.user_message(),
    })
}

fn respond<T: serde::Serialize>(
    operation: &str,
    result: Result<T, ReservationError>,
) -> HttpResponse {
    match result {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(err) => error_response(operation, err),
    }
}

fn caller(user_id: &str) -> Caller {
    Caller::from_identity(Some(user_id))
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn list_reservations(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserPath>,
    filter: web::Query<StatusFilter>,
) -> Result<HttpResponse, Error> {
    let statuses = match filter.statuses() {
        Ok(statuses) => statuses,
        Err(err) => {
            return Ok(error_response(
                "List reservations",
                ReservationError::InvalidRequest(format!("Unknown status filter: {err}")),
            ))
        }
    };
    let result = match caller(&path.user_id).user_id() {
        Ok(user_id) => service.reservation_overview(user_id, &statuses).await,
        Err(err) => Err(err),
    };
    Ok(respond("List reservations", result))
}

#[api_v2_operation]
pub async fn get_user_books(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserPath>,
) -> Result<HttpResponse, Error> {
    let result = match caller(&path.user_id).user_id() {
        Ok(user_id) => service.get_user_books(user_id).await,
        Err(err) => Err(err),
    };
    Ok(respond("Get user books", result))
}

#[api_v2_operation]
pub async fn currently_reading(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserPath>,
) -> Result<HttpResponse, Error> {
    let result = match caller(&path.user_id).user_id() {
        Ok(user_id) => service.currently_reading(user_id).await,
        Err(err) => Err(err),
    };
    Ok(respond("Currently reading", result))
}

#[api_v2_operation]
pub async fn overdue_loans(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserPath>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Overdue loans",
        service.overdue_loans(&caller(&path.user_id)).await,
    ))
}

#[api_v2_operation]
pub async fn notifications(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserPath>,
) -> Result<HttpResponse, Error> {
    let result = service
        .notifications(&caller(&path.user_id))
        .await
        .map(|notifications| {
            notifications
                .into_iter()
                .map(|(id, notification)| NotificationRecord { id, notification })
                .collect::<Vec<_>>()
        });
    Ok(respond("Notifications", result))
}

#[api_v2_operation]
pub async fn mark_notification_read(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserNotificationPath>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service
            .mark_notification_read(&caller(&path.user_id), &path.notification_id)
            .await
        {
            Ok(()) => HttpResponse::NoContent().finish(),
            Err(err) => error_response("Mark notification read", err),
        },
    )
}

#[api_v2_operation]
pub async fn reserve_book(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service
            .reserve(&caller(&path.user_id), &path.book_id)
            .await
        {
            Ok(reservation_id) => HttpResponse::Created()
                .append_header((
                    LOCATION,
                    format!("/api/user/{}/reservation/{}", path.user_id, reservation_id),
                ))
                .json(ReserveResponse { reservation_id }),
            Err(err) => error_response("Reserve book", err),
        },
    )
}

#[api_v2_operation]
pub async fn cancel_reservation(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserReservationPath>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service
            .cancel(&caller(&path.user_id), &path.reservation_id)
            .await
        {
            Ok(()) => HttpResponse::NoContent().finish(),
            Err(err) => error_response("Cancel reservation", err),
        },
    )
}

#[api_v2_operation]
pub async fn is_book_reserved(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
) -> Result<HttpResponse, Error> {
    let result = match caller(&path.user_id).user_id() {
        Ok(user_id) => service
            .is_book_reserved_by_user(user_id, &path.book_id)
            .await
            .map(|reserved| ReservedByUserResponse { reserved }),
        Err(err) => Err(err),
    };
    Ok(respond("Is book reserved", result))
}

#[api_v2_operation]
pub async fn rate_book(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
    request: web::Json<RateBookRequest>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Rate book",
        service
            .rate_book(&caller(&path.user_id), &path.book_id, request.rating)
            .await,
    ))
}

#[api_v2_operation]
pub async fn get_user_rating(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service
            .user_rating(&caller(&path.user_id), &path.book_id)
            .await
        {
            Ok(Some(rating)) => HttpResponse::Ok().json(rating),
            Ok(None) => HttpResponse::NotFound().finish(),
            Err(err) => error_response("Get user rating", err),
        },
    )
}

#[api_v2_operation]
pub async fn record_progress(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
    request: web::Json<RecordProgressRequest>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Record progress",
        service
            .record_progress(&caller(&path.user_id), &path.book_id, request.pages_read)
            .await,
    ))
}

#[api_v2_operation]
pub async fn get_progress(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
) -> Result<HttpResponse, Error> {
    let result = match caller(&path.user_id).user_id() {
        Ok(user_id) => service.reading_progress(user_id, &path.book_id).await,
        Err(err) => Err(err),
    };
    Ok(respond("Get progress", result))
}

#[api_v2_operation]
pub async fn finish_reading(
    service: Data<Arc<ReservationService>>,
    path: web::Path<UserBookPath>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Finish reading",
        service
            .finish_reading(&caller(&path.user_id), &path.book_id)
            .await,
    ))
}

#[api_v2_operation]
pub async fn get_book_status(
    service: Data<Arc<ReservationService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Get book status",
        service
            .get_book_status(&book_id.into_inner())
            .await
            .map(BookStatusResponse::from),
    ))
}

#[api_v2_operation]
pub async fn get_book_meta(
    service: Data<Arc<ReservationService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Get book meta",
        service.get_book_meta(&book_id.into_inner()).await,
    ))
}

#[api_v2_operation]
pub async fn get_rating_summary(
    service: Data<Arc<ReservationService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Get rating summary",
        service.rating_summary(&book_id.into_inner()).await,
    ))
}

#[api_v2_operation]
pub async fn get_next_in_line(
    service: Data<Arc<ReservationService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match service.next_in_line(&book_id.into_inner()).await {
        Ok(Some(entry)) => HttpResponse::Ok().json(entry),
        Ok(None) => HttpResponse::NotFound().finish(),
        Err(err) => error_response("Get next in line", err),
    })
}

#[api_v2_operation]
pub async fn get_queue_position(
    service: Data<Arc<ReservationService>>,
    path: web::Path<BookQueuePath>,
) -> Result<HttpResponse, Error> {
    Ok(respond(
        "Get queue position",
        service
            .compute_queue_position(&path.book_id, &path.reservation_id)
            .await
            .map(|position| QueuePositionResponse { position }),
    ))
}

#[api_v2_operation]
pub async fn approve_reservation(
    service: Data<Arc<ReservationService>>,
    reservation_id: web::Path<ReservationId>,
    request: web::Json<ApproveRequest>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service
            .approve(&reservation_id.into_inner(), request.expected_return)
            .await
        {
            Ok(()) => HttpResponse::NoContent().finish(),
            Err(err) => error_response("Approve reservation", err),
        },
    )
}

#[api_v2_operation]
pub async fn reject_reservation(
    service: Data<Arc<ReservationService>>,
    reservation_id: web::Path<ReservationId>,
) -> Result<HttpResponse, Error> {
    Ok(match service.reject(&reservation_id.into_inner()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => error_response("Reject reservation", err),
    })
}

#[api_v2_operation]
pub async fn return_reservation(
    service: Data<Arc<ReservationService>>,
    reservation_id: web::Path<ReservationId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match service.mark_returned(&reservation_id.into_inner()).await {
            Ok(()) => HttpResponse::NoContent().finish(),
            Err(err) => error_response("Return reservation", err),
        },
    )
}

#[api_v2_operation]
pub async fn reconcile(reconciler: Data<Arc<Reconciler>>) -> Result<HttpResponse, Error> {
    Ok(respond("Reconcile", reconciler.reconcile().await))
}
