pub mod api;
pub mod availability;
pub mod book_catalog;
mod circulation;
pub mod clock;
pub mod document_store;
pub mod error;
mod events;
pub mod identity;
pub mod lifecycle;
pub mod overdue;
mod progress;
pub mod queue;
pub mod ratings;
pub mod reconciliation;
pub mod reservations_repository;
pub mod retry;
pub mod subscriptions;

#[cfg(any(feature = "client", test))]
pub mod client;

#[cfg(any(feature = "server", test))]
pub mod app_config;

#[cfg(any(feature = "server", test))]
mod handlers;

#[cfg(any(feature = "server", test))]
pub mod settings;

#[cfg(test)]
mod testing;
