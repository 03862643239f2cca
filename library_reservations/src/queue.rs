use crate::api::QueueEntry;

/// Entries still waiting for a copy, first in line first. Equal creation
/// times are ordered by reservation id.
pub fn ordered_queue(entries: impl IntoIterator<Item = QueueEntry>) -> Vec<QueueEntry> {
    let mut queue: Vec<QueueEntry> = entries
        .into_iter()
        .filter(|entry| entry.status.is_queued())
        .collect();
    queue.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.reservation_id.cmp(&b.reservation_id))
    });
    queue
}

/// 1-based rank of the reservation, 0 when it is not waiting
pub fn queue_position(
    entries: impl IntoIterator<Item = QueueEntry>,
    reservation_id: &str,
) -> u32 {
    ordered_queue(entries)
        .iter()
        .position(|entry| entry.reservation_id == reservation_id)
        .map(|index| index as u32 + 1)
        .unwrap_or(0)
}

pub fn next_in_line(entries: impl IntoIterator<Item = QueueEntry>) -> Option<QueueEntry> {
    ordered_queue(entries).into_iter().next()
}
