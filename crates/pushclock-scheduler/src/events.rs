//! Event Broadcaster: fan-out of firing outcomes to live listeners.
//!
//! Each listener owns a bounded channel. Publishing never waits: a listener
//! whose buffer is full, or whose receiver is gone, is dropped.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use pushclock_core::types::TaskEvent;

struct Listener {
    user_id: i64,
    tx: mpsc::Sender<TaskEvent>,
}

/// Per-user fan-out of task events.
pub struct EventBroadcaster {
    listeners: Mutex<Vec<Listener>>,
    buffer: usize,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a listener for `user_id`'s events.
    pub fn subscribe(&self, user_id: i64) -> mpsc::Receiver<TaskEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().push(Listener { user_id, tx });
        tracing::debug!("📡 Listener added for user {user_id}");
        rx
    }

    /// Deliver `event` to every listener of `user_id`. Returns how many received it.
    pub fn publish(&self, user_id: i64, event: &TaskEvent) -> usize {
        let mut delivered = 0;
        self.lock().retain(|listener| {
            if listener.user_id != user_id {
                return true;
            }
            match listener.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("📡 Dropping slow listener for user {user_id}");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    pub fn listener_count(&self, user_id: i64) -> usize {
        self.lock().iter().filter(|l| l.user_id == user_id).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pushclock_core::types::TaskStatus;

    fn event(task_id: i64) -> TaskEvent {
        TaskEvent {
            kind: "task_executed".into(),
            task_id,
            title: "t".into(),
            status: TaskStatus::Sent,
            message: "ok".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_only_owner_receives() {
        let bus = EventBroadcaster::new(10);
        let mut alice = bus.subscribe(1);
        let mut bob = bus.subscribe(2);
        assert_eq!(bus.publish(1, &event(5)), 1);
        assert_eq!(alice.recv().await.unwrap().task_id, 5);
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_listener_dropped_without_blocking() {
        let bus = EventBroadcaster::new(2);
        let _slow = bus.subscribe(1);
        let mut fast = bus.subscribe(1);
        for i in 0..2 {
            assert_eq!(bus.publish(1, &event(i)), 2);
            fast.recv().await.unwrap();
        }
        // slow's buffer is now full
        assert_eq!(bus.publish(1, &event(3)), 1);
        assert_eq!(bus.listener_count(1), 1);
    }

    #[test]
    fn test_closed_listener_removed() {
        let bus = EventBroadcaster::new(4);
        drop(bus.subscribe(9));
        assert_eq!(bus.publish(9, &event(1)), 0);
        assert_eq!(bus.listener_count(9), 0);
    }
}
