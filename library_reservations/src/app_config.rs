use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(
                    web::scope("/user/{user_id}")
                        .service(
                            web::resource("/reservations")
                                .route(web::get().to(handlers::list_reservations)),
                        )
                        .service(
                            web::resource("/books").route(web::get().to(handlers::get_user_books)),
                        )
                        .service(
                            web::resource("/reading")
                                .route(web::get().to(handlers::currently_reading)),
                        )
                        .service(
                            web::resource("/overdue").route(web::get().to(handlers::overdue_loans)),
                        )
                        .service(
                            web::resource("/notifications")
                                .route(web::get().to(handlers::notifications)),
                        )
                        .service(
                            web::resource("/notification/{notification_id}/read")
                                .route(web::put().to(handlers::mark_notification_read)),
                        )
                        .service(
                            web::resource("/reservation/{reservation_id}")
                                .route(web::delete().to(handlers::cancel_reservation)),
                        )
                        .service(
                            web::scope("/book/{book_id}")
                                .service(
                                    web::resource("")
                                        .route(web::post().to(handlers::reserve_book)),
                                )
                                .service(
                                    web::resource("/reserved")
                                        .route(web::get().to(handlers::is_book_reserved)),
                                )
                                .service(
                                    web::resource("/rating")
                                        .route(web::get().to(handlers::get_user_rating))
                                        .route(web::put().to(handlers::rate_book)),
                                )
                                .service(
                                    web::resource("/progress")
                                        .route(web::get().to(handlers::get_progress))
                                        .route(web::put().to(handlers::record_progress)),
                                )
                                .service(
                                    web::resource("/finish")
                                        .route(web::post().to(handlers::finish_reading)),
                                ),
                        ),
                )
                .service(
                    web::scope("/book/{book_id}")
                        .service(
                            web::resource("/status").route(web::get().to(handlers::get_book_status)),
                        )
                        .service(
                            web::resource("/meta").route(web::get().to(handlers::get_book_meta)),
                        )
                        .service(
                            web::resource("/rating")
                                .route(web::get().to(handlers::get_rating_summary)),
                        )
                        .service(
                            web::resource("/next")
                                .route(web::get().to(handlers::get_next_in_line)),
                        )
                        .service(
                            web::resource("/queue/{reservation_id}")
                                .route(web::get().to(handlers::get_queue_position)),
                        ),
                )
                .service(
                    web::scope("/admin")
                        .service(
                            web::resource("/reservation/{reservation_id}/approve")
                                .route(web::post().to(handlers::approve_reservation)),
                        )
                        .service(
                            web::resource("/reservation/{reservation_id}/reject")
                                .route(web::post().to(handlers::reject_reservation)),
                        )
                        .service(
                            web::resource("/reservation/{reservation_id}/return")
                                .route(web::post().to(handlers::return_reservation)),
                        )
                        .service(
                            web::resource("/reconcile").route(web::post().to(handlers::reconcile)),
                        ),
                ),
        );
}
