//! Real-time channel registry.
//!
//! Tracks which users listen on which named channels and fans payloads out to
//! live receivers through per-channel `broadcast` senders. One registry lives
//! per process and is shared by reference; nothing here is global.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffered messages per channel before slow receivers lag.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A payload published on a channel.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMessage {
    pub channel: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Concurrency-safe registry of channel subscriptions.
#[derive(Debug)]
pub struct ChannelRegistry {
    user_channels: DashMap<String, HashSet<String>>,
    senders: DashMap<String, broadcast::Sender<RealtimeMessage>>,
    capacity: usize,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            user_channels: DashMap::new(),
            senders: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Channel name for messages addressed to a single user.
    pub fn user_channel(user_id: &str) -> String {
        format!("user:{}", user_id)
    }

    /// Register `user_id` on `channel`. Returns `false` if already registered.
    pub fn register(&self, user_id: &str, channel: &str) -> bool {
        let added = self
            .user_channels
            .entry(user_id.to_string())
            .or_default()
            .insert(channel.to_string());

        if added {
            tracing::info!(user_id, channel, "User subscribed to channel");
        }
        added
    }

    /// Remove `user_id` from `channel`. Returns `false` if it was not registered.
    pub fn remove(&self, user_id: &str, channel: &str) -> bool {
        let removed = match self.user_channels.get_mut(user_id) {
            Some(mut channels) => channels.remove(channel),
            None => false,
        };
        self.user_channels
            .remove_if(user_id, |_, channels| channels.is_empty());

        if removed {
            tracing::info!(user_id, channel, "User unsubscribed from channel");
        }
        removed
    }

    /// Channels `user_id` is registered on, sorted.
    pub fn channels_for(&self, user_id: &str) -> Vec<String> {
        let mut channels: Vec<String> = self
            .user_channels
            .get(user_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn is_subscribed(&self, user_id: &str, channel: &str) -> bool {
        self.user_channels
            .get(user_id)
            .is_some_and(|channels| channels.contains(channel))
    }

    /// Obtain a live receiver for `channel`.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<RealtimeMessage> {
        self.senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to every live receiver of `channel`. Returns how many received it.
    pub fn broadcast(&self, channel: &str, payload: serde_json::Value) -> usize {
        let Some(sender) = self.senders.get(channel) else {
            tracing::debug!(channel, "No live receivers for channel");
            return 0;
        };
        let message = RealtimeMessage {
            channel: channel.to_string(),
            payload,
            sent_at: Utc::now(),
        };
        let delivered = sender.send(message).unwrap_or(0);
        tracing::debug!(channel, delivered, "Broadcast to channel");
        delivered
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
