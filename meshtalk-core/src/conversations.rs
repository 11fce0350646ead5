//! Conversation index
//!
//! Ordered room list with unread counters. Fed by the delivery engine on
//! every send, push and backfill; feeds the UI room list.

use crate::types::{Conversation, RoomId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Room list with unread tracking.
///
/// Plain synchronous state; the owning engine serializes access.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    rooms: HashMap<RoomId, Conversation>,
    active: Option<RoomId>,
}

impl ConversationIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently active room, if any
    #[must_use]
    pub fn active(&self) -> Option<RoomId> {
        self.active
    }

    /// Make a room active (or none). Entering a room resets its unread
    /// counter to zero.
    pub fn set_active(&mut self, room_id: Option<RoomId>) {
        self.active = room_id;
        if let Some(id) = room_id {
            if let Some(conv) = self.rooms.get_mut(&id) {
                conv.unread_count = 0;
            }
        }
    }

    /// Record outbound activity: update preview and bump the room to the top.
    /// Creates the conversation if it is not indexed yet.
    pub fn touch_outbound(&mut self, room_id: RoomId, preview: &str, at: DateTime<Utc>) {
        let conv = self.rooms.entry(room_id).or_insert_with(|| Conversation {
            room_id,
            last_message: String::new(),
            last_time: at,
            unread_count: 0,
        });
        conv.last_message = preview.to_string();
        conv.last_time = at;
    }

    /// Record an inbound message that did not reconcile a local send.
    ///
    /// Increments the unread counter unless the room is active, in which
    /// case the message is immediately considered read. Returns whether the
    /// unread counter was incremented.
    pub fn record_inbound(&mut self, room_id: RoomId, preview: &str, at: DateTime<Utc>) -> bool {
        let is_active = self.active == Some(room_id);
        let conv = self.rooms.entry(room_id).or_insert_with(|| Conversation {
            room_id,
            last_message: String::new(),
            last_time: at,
            unread_count: 0,
        });
        conv.last_message = preview.to_string();
        conv.last_time = at;
        if is_active {
            conv.unread_count = 0;
            false
        } else {
            conv.unread_count += 1;
            true
        }
    }

    /// Look up one conversation
    #[must_use]
    pub fn get(&self, room_id: RoomId) -> Option<&Conversation> {
        self.rooms.get(&room_id)
    }

    /// Remove a room from the index
    pub fn remove(&mut self, room_id: RoomId) {
        self.rooms.remove(&room_id);
        if self.active == Some(room_id) {
            self.active = None;
        }
    }

    /// All conversations, newest activity first
    #[must_use]
    pub fn ordered(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.rooms.values().cloned().collect();
        list.sort_by(|a, b| b.last_time.cmp(&a.last_time));
        list
    }

    /// Sum of unread counters across all rooms
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.rooms.values().map(|c| c.unread_count).sum()
    }
}
