use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NotificationKind {
    Saved,
    Reserved,
    CheckedOut,
    CheckedIn,
    Cancelled,
    Archived,
    Deleted,
    Overdue,
}

impl NotificationKind {
    pub fn title(self) -> &'static str {
        match self {
            NotificationKind::Saved => "Booking saved",
            NotificationKind::Reserved => "Booking reserved",
            NotificationKind::CheckedOut => "Booking checked-out",
            NotificationKind::CheckedIn => "Booking checked-in",
            NotificationKind::Cancelled => "Booking cancelled",
            NotificationKind::Archived => "Booking archived",
            NotificationKind::Deleted => "Booking deleted",
            NotificationKind::Overdue => "Booking overdue",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            NotificationKind::Saved => "Your booking has been saved successfully",
            NotificationKind::Reserved => "Your booking has been reserved successfully",
            NotificationKind::CheckedOut => "Your booking has been checked-out successfully",
            NotificationKind::CheckedIn => "Your booking has been checked-in successfully",
            NotificationKind::Cancelled => "Your booking has been cancelled successfully",
            NotificationKind::Archived => "Your booking has been archived successfully",
            NotificationKind::Deleted => "Your booking has been deleted successfully",
            NotificationKind::Overdue => "The booking period has ended but its assets have not been checked-in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    /// Who triggered it. `None` for notifications raised by background tasks.
    pub actor_id: Option<Ulid>,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, booking_id: Ulid, actor_id: Option<Ulid>) -> Self {
        Self {
            kind,
            booking_id,
            actor_id,
            title: kind.title().to_string(),
            message: kind.message().to_string(),
        }
    }

    /// JSON payload for forwarding to a toast or push channel.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for booking notifications, per booking plus one channel for everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for one booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every notification of the organization.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.booking_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }

    /// Drop a booking's channel once the booking is gone.
    pub fn remove(&self, booking_id: &Ulid) {
        self.channels.remove(booking_id);
    }
}
