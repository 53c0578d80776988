use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "info"),
            NotificationLevel::Warning => write!(f, "warning"),
            NotificationLevel::Error => write!(f, "error"),
        }
    }
}

/// A transient, user-visible message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub level: NotificationLevel,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    /// The failed action can be tried again.
    pub retry: bool,
}

impl Notification {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug)]
pub struct NotificationCenter {
    ttl: Duration,
    next_id: u64,
    items: Vec<Notification>,
}

impl NotificationCenter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_id: 1,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, level: NotificationLevel, text: impl Into<String>) -> Notification {
        self.push_at(level, text, Utc::now())
    }

    /// A failure the user can retry.
    pub fn push_retriable(&mut self, level: NotificationLevel, text: impl Into<String>) -> Notification {
        self.insert(level, text.into(), Utc::now(), true)
    }

    pub fn push_at(
        &mut self,
        level: NotificationLevel,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Notification {
        self.insert(level, text.into(), now, false)
    }

    fn insert(
        &mut self,
        level: NotificationLevel,
        text: String,
        now: DateTime<Utc>,
        retry: bool,
    ) -> Notification {
        let notification = Notification {
            id: self.next_id,
            level,
            text,
            created_at: now,
            ttl: self.ttl,
            retry,
        };
        self.next_id += 1;
        self.items.push(notification.clone());
        notification
    }

    /// Live notifications at `now`; expired ones are dropped.
    pub fn active(&mut self, now: DateTime<Utc>) -> &[Notification] {
        self.prune(now);
        &self.items
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.items.len();
        self.items.retain(|n| !n.is_expired(now));
        before - self.items.len()
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        before != self.items.len()
    }
}
