//! Live views for connected clients. One watch channel per (topic, viewer)
//! pair is shared by every subscription of that viewer to that topic and is
//! torn down with the last one. Values are recomputed from the store when a
//! path the topic depends on changes, and only published when they differ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::api::{BookId, BookStatus, Reservation, ReservationId, ReservationStatus, UserId};
use crate::error::ReservationError;
use crate::identity::Caller;
use crate::lifecycle::ReservationService;
use crate::reservations_repository::collection_of;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Reservations of the user with one of the statuses, any when empty
    UserReservations {
        user_id: UserId,
        statuses: Vec<ReservationStatus>,
    },
    BookStatus {
        book_id: BookId,
    },
    BookReservedByUser {
        user_id: UserId,
        book_id: BookId,
    },
    QueuePosition {
        book_id: BookId,
        reservation_id: ReservationId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopicValue {
    Reservations(Vec<Reservation>),
    BookStatus(BookStatus),
    Reserved(bool),
    QueuePosition(u32),
}

impl Topic {
    /// Whether a write to `path` can change this topic's value
    fn depends_on(&self, path: &str) -> bool {
        let mut segments = path.split('/');
        let collection = segments.next().unwrap_or_default();
        let first = segments.next();
        match self {
            // ledger paths carry no user id, so any ledger write counts
            Topic::UserReservations { user_id, .. } => match collection {
                "reservations" | "reservas" => true,
                "userReservations" => first == Some(user_id.as_str()),
                _ => false,
            },
            Topic::BookStatus { book_id } => {
                collection == "bookStatus" && first == Some(book_id.as_str())
            }
            Topic::BookReservedByUser { user_id, book_id } => {
                collection == "userBookReservations"
                    && first == Some(user_id.as_str())
                    && segments.next() == Some(book_id.as_str())
            }
            Topic::QueuePosition { book_id, .. } => {
                collection == "bookQueues" && first == Some(book_id.as_str())
            }
        }
    }

    /// Topics naming a user may only be watched by that user
    fn authorize(&self, viewer: &str) -> Result<(), ReservationError> {
        match self {
            Topic::UserReservations { user_id, .. } | Topic::BookReservedByUser { user_id, .. }
                if user_id != viewer =>
            {
                Err(ReservationError::Forbidden(format!("subscription of {user_id}")))
            }
            _ => Ok(()),
        }
    }
}

type SlotKey = (Topic, UserId);

struct Slot {
    sender: watch::Sender<Option<TopicValue>>,
    subscribers: usize,
    generation: u64,
}

pub struct SubscriptionManager {
    service: Arc<ReservationService>,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_generation: AtomicU64,
}

/// Handle of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    manager: Arc<SubscriptionManager>,
    key: SlotKey,
    generation: u64,
    receiver: watch::Receiver<Option<TopicValue>>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.key.0
    }

    /// Latest published value, `None` until the first load finished
    pub fn current(&self) -> Option<TopicValue> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next value. `None` once the subscription was released.
    pub async fn changed(&mut self) -> Option<TopicValue> {
        self.receiver.changed().await.ok()?;
        self.receiver.borrow_and_update().clone()
    }

    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.key, self.generation);
    }
}

impl SubscriptionManager {
    pub fn new(service: Arc<ReservationService>) -> Self {
        Self {
            service,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn subscribe(
        self: &Arc<Self>,
        viewer: &Caller,
        topic: Topic,
    ) -> Result<Subscription, ReservationError> {
        let viewer = viewer.user_id()?.to_string();
        topic.authorize(&viewer)?;
        let key = (topic, viewer);

        let (receiver, generation, first) = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) => {
                    slot.subscribers += 1;
                    (slot.sender.subscribe(), slot.generation, None)
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        Slot {
                            sender: sender.clone(),
                            subscribers: 1,
                            generation,
                        },
                    );
                    (receiver, generation, Some(sender))
                }
            }
        };
        let mut subscription = Subscription {
            manager: self.clone(),
            key,
            generation,
            receiver,
        };

        if let Some(sender) = first {
            // dropping the subscription on error releases the slot again
            let value = self.load(&subscription.key).await?;
            publish(&sender, value);
            subscription.receiver.borrow_and_update();
        }
        Ok(subscription)
    }

    fn unsubscribe(&self, key: &SlotKey, generation: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            if slot.generation != generation {
                return;
            }
            slot.subscribers -= 1;
            if slot.subscribers == 0 {
                slots.remove(key);
                tracing::debug!(topic = ?key.0, viewer = %key.1, "Last subscriber left");
            }
        }
    }

    /// Drops every channel of the viewer, e.g. on sign out. Open handles see
    /// their subscription end.
    pub fn release_viewer(&self, viewer: &str) {
        self.slots.lock().retain(|(_, slot_viewer), _| slot_viewer != viewer);
    }

    pub fn active_channels(&self) -> usize {
        self.slots.lock().len()
    }

    async fn load(&self, (topic, viewer): &SlotKey) -> Result<TopicValue, ReservationError> {
        let service = &self.service;
        Ok(match topic {
            Topic::UserReservations { user_id, statuses } => {
                TopicValue::Reservations(service.list_reservations(user_id, statuses).await?)
            }
            Topic::BookStatus { book_id } => {
                TopicValue::BookStatus(service.get_book_status(book_id).await?)
            }
            Topic::BookReservedByUser { user_id, book_id } => {
                TopicValue::Reserved(service.is_book_reserved_by_user(user_id, book_id).await?)
            }
            Topic::QueuePosition {
                book_id,
                reservation_id,
            } => {
                tracing::trace!(viewer, "Loading queue position");
                TopicValue::QueuePosition(
                    service
                        .compute_queue_position(book_id, reservation_id)
                        .await?,
                )
            }
        })
    }

    /// Recomputes the topics affected by writes to `changed_paths`
    pub async fn refresh(&self, changed_paths: &[String]) {
        let affected: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(key, _)| changed_paths.iter().any(|path| key.0.depends_on(path)))
            .map(|(key, slot)| (key.clone(), slot.sender.clone()))
            .collect();
        self.reload(affected).await;
    }

    async fn refresh_all(&self) {
        let all: Vec<_> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.sender.clone()))
            .collect();
        self.reload(all).await;
    }

    async fn reload(&self, slots: Vec<(SlotKey, watch::Sender<Option<TopicValue>>)>) {
        for (key, sender) in slots {
            match self.load(&key).await {
                Ok(value) => publish(&sender, value),
                Err(err) => {
                    tracing::warn!(topic = ?key.0, "Keeping last value, reload failed: {}", err)
                }
            }
        }
    }

    /// Subscribes to the store's change feed right away and follows it on a
    /// background task until the feed closes
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        let changes = self.service.repository().store().changes();
        tokio::spawn(self.follow(changes))
    }

    async fn follow(self: Arc<Self>, mut changes: broadcast::Receiver<String>) {
        loop {
            match changes.recv().await {
                Ok(path) => {
                    let mut paths = vec![path];
                    while let Ok(path) = changes.try_recv() {
                        paths.push(path);
                    }
                    tracing::trace!(
                        changed = paths.len(),
                        first = collection_of(&paths[0]),
                        "Refreshing subscriptions"
                    );
                    self.refresh(&paths).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change feed lagged, refreshing every subscription");
                    self.refresh_all().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Change feed closed, subscriptions stop updating");
                    break;
                }
            }
        }
    }
}

fn publish(sender: &watch::Sender<Option<TopicValue>>, value: TopicValue) {
    sender.send_if_modified(|current| {
        if current.as_ref() == Some(&value) {
            false
        } else {
            *current = Some(value);
            true
        }
    });
}
