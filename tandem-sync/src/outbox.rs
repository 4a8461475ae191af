//! Edits waiting for a channel.
//!
//! While the channel is down the workspace parks outbound edits here; they
//! are replayed in order right after the next join-request. The queue is
//! bound to one room so edits never leak into a different room.

use std::collections::VecDeque;

use crate::protocol::ClientEvent;

#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<ClientEvent>,
    max_size: usize,
    room: Option<String>,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            room: None,
        }
    }

    /// Attach the queue to `room_id`, dropping edits queued for another room.
    pub fn bind(&mut self, room_id: &str) {
        if self.room.as_deref().is_some_and(|r| r != room_id) && !self.queue.is_empty() {
            log::warn!(
                "Dropping {} queued edits for room {:?}",
                self.queue.len(),
                self.room
            );
            self.queue.clear();
        }
        self.room = Some(room_id.to_string());
    }

    /// Queue an edit for replay. Returns false when the queue is full.
    pub fn enqueue(&mut self, event: ClientEvent) -> bool {
        if self.queue.len() >= self.max_size {
            log::warn!("Outbox full; dropping {}", event.kind());
            return false;
        }
        self.queue.push_back(event);
        true
    }

    /// Put edits that were handed to a dead channel back at the head of the
    /// queue, keeping their order.
    pub fn requeue_front(&mut self, events: Vec<ClientEvent>) {
        for event in events.into_iter().rev() {
            self.queue.push_front(event);
        }
    }

    pub fn drain(&mut self) -> Vec<ClientEvent> {
        self.queue.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientEvent> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.room = None;
    }
}
